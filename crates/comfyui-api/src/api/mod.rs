use std::time::Duration;

use reqwest::{StatusCode, Url};

use crate::models::ValidationFailure;

pub mod history;
pub mod prompt;
pub mod system_stats;
pub mod view;

pub use history::*;
pub use prompt::*;
pub use system_stats::*;
pub use view::*;

/// Timeout for requests that carry or return large payloads.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for status probes.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned by the ComfyUI endpoint clients.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ApiError {
    /// Error parsing endpoint URL
    #[error("Failed to parse endpoint URL")]
    ParseError(#[from] url::ParseError),
    /// The server could not be reached or did not answer in time.
    #[error("Failed to connect to {url}")]
    ConnectFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The request failed for a reason other than connectivity.
    #[error("Failed to send request")]
    RequestFailed(#[source] reqwest::Error),
    /// The server rejected the submitted graph.
    #[error("Prompt failed validation: {}", .0.message())]
    ValidationFailed(ValidationFailure),
    /// The server answered with a non-success status.
    #[error("got error code: {status}, message text: {text}")]
    BadStatus { status: StatusCode, text: String },
    /// An error occurred while parsing the response from the API.
    #[error("Parsing response failed")]
    InvalidResponse(#[source] reqwest::Error),
}

impl ApiError {
    /// Whether the error means the server was unreachable, so that the request
    /// may be retried.
    pub fn is_connect(&self) -> bool {
        matches!(self, ApiError::ConnectFailed { .. })
    }

    pub(crate) fn from_request(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ApiError::ConnectFailed {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                source: err,
            }
        } else {
            ApiError::RequestFailed(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Turns a non-success response into `ApiError::BadStatus` carrying the body text.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.map_err(ApiError::InvalidResponse)?;
    Err(ApiError::BadStatus { status, text })
}

/// Struct representing a connection to a ComfyUI API.
#[derive(Clone, Debug)]
pub struct Api {
    client: reqwest::Client,
    url: Url,
    client_id: uuid::Uuid,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: Url::parse(DEFAULT_URL).expect("Failed to parse default URL"),
            client_id: uuid::Uuid::new_v4(),
        }
    }
}

/// Address of a locally running server.
pub const DEFAULT_URL: &str = "http://localhost:8188/";

fn parse_base_url(url: &str) -> Result<Url> {
    let mut url = Url::parse(url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl Api {
    /// Returns a new `Api` instance with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new `Api` instance with the given URL as a string value.
    ///
    /// # Arguments
    ///
    /// * `url` - A string that specifies the ComfyUI API URL endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn new_with_url<S>(url: S) -> Result<Self>
    where
        S: AsRef<str>,
    {
        Ok(Self {
            url: parse_base_url(url.as_ref())?,
            ..Default::default()
        })
    }

    /// Returns a new `Api` instance with the given `reqwest::Client` and URL as a string value.
    ///
    /// # Arguments
    ///
    /// * `client` - An instance of `reqwest::Client`.
    /// * `url` - A string that specifies the ComfyUI API URL endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn new_with_client_and_url<S>(client: reqwest::Client, url: S) -> Result<Self>
    where
        S: AsRef<str>,
    {
        Ok(Self {
            client,
            url: parse_base_url(url.as_ref())?,
            ..Default::default()
        })
    }

    /// The base URL of the server.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The client id sent with every prompt.
    pub fn client_id(&self) -> uuid::Uuid {
        self.client_id
    }

    /// Returns a new instance of `PromptApi` with the API's cloned
    /// `reqwest::Client` and the URL for the `prompt` endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn prompt(&self) -> Result<PromptApi> {
        Ok(PromptApi::new_with_url(
            self.client.clone(),
            self.url.join("prompt")?,
            self.client_id,
        ))
    }

    /// Returns a new instance of `HistoryApi` with the API's cloned
    /// `reqwest::Client` and the URL for the `history` endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn history(&self) -> Result<HistoryApi> {
        Ok(HistoryApi::new_with_url(
            self.client.clone(),
            self.url.join("history/")?,
        ))
    }

    /// Returns a new instance of `ViewApi` with the API's cloned
    /// `reqwest::Client` and the URL for the `view` endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn view(&self) -> Result<ViewApi> {
        Ok(ViewApi::new_with_url(
            self.client.clone(),
            self.url.join("view")?,
        ))
    }

    /// Returns a new instance of `SystemStatsApi` with the API's cloned
    /// `reqwest::Client` and the URL for the `system_stats` endpoint.
    ///
    /// # Errors
    ///
    /// If the URL fails to parse, an error will be returned.
    pub fn system_stats(&self) -> Result<SystemStatsApi> {
        Ok(SystemStatsApi::new_with_url(
            self.client.clone(),
            self.url.join("system_stats")?,
        ))
    }
}
