use reqwest::Url;

use crate::{
    api::{check_status, ApiError, Result, SHORT_TIMEOUT},
    models::SystemStats,
};

/// Struct representing a connection to the ComfyUI API `system_stats` endpoint.
#[derive(Clone, Debug)]
pub struct SystemStatsApi {
    client: reqwest::Client,
    endpoint: Url,
}

impl SystemStatsApi {
    /// Constructs a new `SystemStatsApi` client with a given `reqwest::Client` and endpoint `Url`.
    pub fn new_with_url(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    /// Fetches host and device information. Doubles as a liveness probe.
    pub async fn get(&self) -> Result<SystemStats> {
        let response = self
            .client
            .get(self.endpoint.clone())
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
}

#[cfg(test)]
mod tests {
    use crate::api::Api;

    #[tokio::test]
    async fn test_get_system_stats() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/system_stats")
            .with_status(200)
            .with_body(
                r#"{"system": {"os": "posix"}, "devices": [{"name": "cuda:0 NVIDIA L4", "type": "cuda", "vram_total": 24000000000, "vram_free": 20000000000}]}"#,
            )
            .create_async()
            .await;

        let stats = Api::new_with_url(server.url())
            .unwrap()
            .system_stats()
            .unwrap()
            .get()
            .await
            .unwrap();
        assert_eq!(stats.devices[0].name, "cuda:0 NVIDIA L4");
        assert_eq!(stats.devices[0].vram_free, 20000000000);
    }
}
