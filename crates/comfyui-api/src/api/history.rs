use reqwest::Url;
use tracing::debug;

use crate::{
    api::{check_status, ApiError, Result, SHORT_TIMEOUT},
    models::{History, Task},
};

/// Struct representing a connection to the ComfyUI API `history` endpoint.
#[derive(Clone, Debug)]
pub struct HistoryApi {
    client: reqwest::Client,
    endpoint: Url,
}

impl HistoryApi {
    /// Parses `endpoint` and wraps `client` for it.
    pub fn new(client: reqwest::Client, endpoint: String) -> Result<Self> {
        Ok(Self::new_with_url(client, Url::parse(&endpoint)?))
    }

    pub fn new_with_url(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    /// The URL of the `history` endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Sends a history request using the HistoryApi client.
    ///
    /// # Returns
    ///
    /// A `Result` containing a `History` on success, or an error if the request failed.
    pub async fn get(&self) -> Result<History> {
        // The endpoint keeps a trailing slash for joining prompt ids, the
        // listing route has none.
        let url = self.endpoint.join("../history")?;
        let response = self
            .client
            .get(url)
            .timeout(SHORT_TIMEOUT)
            .send()
            .await
            .map_err(ApiError::from_request)?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(ApiError::InvalidResponse)
    }

    /// Sends a history request for a single prompt using the HistoryApi client.
    ///
    /// # Arguments
    ///
    /// * `prompt_id` - A `uuid::Uuid` representing the prompt id.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Task` if the server already knows about it,
    /// `None` while the prompt is still queued or executing on servers that
    /// only record finished tasks, or an error if the request failed.
    pub async fn get_prompt(&self, prompt_id: &uuid::Uuid) -> Result<Option<Task>> {
        let url = self.endpoint.join(prompt_id.to_string().as_str())?;
        debug!(%url, "polling history");
        let response = self
            .client
            .get(url)
            .timeout(SHORT_TIMEOUT)
            .send()
            .await
            .map_err(ApiError::from_request)?;
        let mut history: History = check_status(response)
            .await?
            .json()
            .await
            .map_err(ApiError::InvalidResponse)?;
        Ok(history.tasks.remove(prompt_id))
    }
}
