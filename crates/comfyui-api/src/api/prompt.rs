use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_with::skip_serializing_none;
use tracing::debug;

use crate::{
    api::{check_status, ApiError, Result, LONG_TIMEOUT},
    models::{Prompt, Response, ValidationFailure},
};

#[skip_serializing_none]
#[derive(Serialize, Debug)]
struct PromptWrapper<'a> {
    prompt: &'a Prompt,
    client_id: Option<uuid::Uuid>,
}

/// Struct representing a connection to the ComfyUI API `prompt` endpoint.
#[derive(Clone, Debug)]
pub struct PromptApi {
    client: reqwest::Client,
    endpoint: Url,
    client_id: uuid::Uuid,
}

impl PromptApi {
    /// Constructs a new `PromptApi` client with a given `reqwest::Client` and ComfyUI API
    /// endpoint `String`.
    ///
    /// # Arguments
    ///
    /// * `client` - A `reqwest::Client` used to send requests.
    /// * `endpoint` - A `String` representation of the endpoint url.
    /// * `client_id` - The client id sent along with every prompt.
    ///
    /// # Returns
    ///
    /// A `Result` containing a new `PromptApi` instance on success, or an error if url parsing failed.
    pub fn new(client: reqwest::Client, endpoint: String, client_id: uuid::Uuid) -> Result<Self> {
        Ok(Self::new_with_url(client, Url::parse(&endpoint)?, client_id))
    }

    /// Constructs a new `PromptApi` client with a given `reqwest::Client` and endpoint `Url`.
    ///
    /// # Arguments
    ///
    /// * `client` - A `reqwest::Client` used to send requests.
    /// * `endpoint` - A `Url` representing the endpoint url.
    /// * `client_id` - The client id sent along with every prompt.
    ///
    /// # Returns
    ///
    /// A new `PromptApi` instance.
    pub fn new_with_url(client: reqwest::Client, endpoint: Url, client_id: uuid::Uuid) -> Self {
        Self {
            client,
            endpoint,
            client_id,
        }
    }

    /// Sends a prompt request using the `PromptApi` client.
    ///
    /// # Arguments
    ///
    /// * `prompt` - A `Prompt` to send to the ComfyUI API.
    ///
    /// # Returns
    ///
    /// A `Result` containing a `Response` on success, or an error if the request failed.
    ///
    /// # Errors
    ///
    /// * `ApiError::ConnectFailed` if the server could not be reached.
    /// * `ApiError::ValidationFailed` if the server rejected the graph, either
    ///   with status 400 or with a non-empty `node_errors` map.
    /// * `ApiError::BadStatus` for any other non-success status.
    pub async fn send(&self, prompt: &Prompt) -> Result<Response> {
        debug!(endpoint = %self.endpoint, nodes = prompt.workflow.len(), "sending prompt");
        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(LONG_TIMEOUT)
            .json(&PromptWrapper {
                prompt,
                client_id: Some(self.client_id),
            })
            .send()
            .await
            .map_err(ApiError::from_request)?;
        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await.map_err(ApiError::InvalidResponse)?;
            return Err(match serde_json::from_str::<ValidationFailure>(&text) {
                Ok(failure) if failure.error.is_some() || !failure.node_errors.is_empty() => {
                    ApiError::ValidationFailed(failure)
                }
                _ => ApiError::BadStatus {
                    status: StatusCode::BAD_REQUEST,
                    text,
                },
            });
        }
        let response: Response = check_status(response)
            .await?
            .json()
            .await
            .map_err(ApiError::InvalidResponse)?;
        if !response.node_errors.is_empty() {
            return Err(ApiError::ValidationFailed(ValidationFailure {
                error: None,
                node_errors: response.node_errors,
            }));
        }
        Ok(response)
    }
}
