use reqwest::Client;

use super::{BlobStore, BoxFuture, PlatformError, PlatformResult};

pub struct RemoteBlobStore {
    http: Client,
    base_url: String,
    api_key: String,
}

impl RemoteBlobStore {
    pub fn new(http: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl BlobStore for RemoteBlobStore {
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> BoxFuture<'_, PlatformResult<()>> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        let content_type = content_type.to_string();
        Box::pin(async move {
            let response = self
                .http
                .post(&url)
                .header("apikey", &self.api_key)
                .bearer_auth(&self.api_key)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| status.to_string());
                return Err(PlatformError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
            tracing::debug!("Uploaded object {}", url);
            Ok(())
        })
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }
}
