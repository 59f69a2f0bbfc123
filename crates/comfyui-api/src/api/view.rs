use reqwest::Url;

use crate::{
    api::{check_status, ApiError, Result, LONG_TIMEOUT},
    models::Image,
};

/// Struct representing a connection to the ComfyUI API `view` endpoint.
#[derive(Clone, Debug)]
pub struct ViewApi {
    client: reqwest::Client,
    endpoint: Url,
}

impl ViewApi {
    /// Parses `endpoint` and wraps `client` for it.
    pub fn new(client: reqwest::Client, endpoint: String) -> Result<Self> {
        Ok(Self::new_with_url(client, Url::parse(&endpoint)?))
    }

    pub fn new_with_url(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    /// Downloads the raw bytes of an output image.
    pub async fn get(&self, image: &Image) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .timeout(LONG_TIMEOUT)
            .query(&image)
            .send()
            .await
            .map_err(ApiError::from_request)?;
        Ok(check_status(response)
            .await?
            .bytes()
            .await
            .map_err(ApiError::InvalidResponse)?
            .to_vec())
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;
    use crate::api::Api;

    #[tokio::test]
    async fn test_get_image() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/view")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("filename".into(), "out_00001_.png".into()),
                Matcher::UrlEncoded("subfolder".into(), "batch".into()),
                Matcher::UrlEncoded("type".into(), "output".into()),
            ]))
            .with_status(200)
            .with_body([0x89, b'P', b'N', b'G'])
            .create_async()
            .await;

        let image = Image {
            filename: "out_00001_.png".to_string(),
            subfolder: "batch".to_string(),
            folder_type: "output".to_string(),
        };
        let bytes = Api::new_with_url(server.url())
            .unwrap()
            .view()
            .unwrap()
            .get(&image)
            .await
            .unwrap();
        assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_image() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/view")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let image = Image {
            filename: "gone.png".to_string(),
            subfolder: String::new(),
            folder_type: "output".to_string(),
        };
        let err = Api::new_with_url(server.url())
            .unwrap()
            .view()
            .unwrap()
            .get(&image)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadStatus { status, .. } if status.as_u16() == 404));
    }
}
