use async_trait::async_trait;
use log::error;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE } };

use super::ObjectStore;
use crate::error::{ ChatError, ChatResult };

/// Public bucket on a hosted storage API (`<backend>/storage/v1`).
pub struct BucketStore {
    http: HttpClient,
    storage_url: String,
    bucket: String,
}

impl BucketStore {
    pub fn new(backend_url: &str, api_key: &str, bucket: &str) -> ChatResult<Self> {
        let mut headers = HeaderMap::new();
        let invalid = |e: reqwest::header::InvalidHeaderValue| {
            ChatError::Config(format!("Invalid backend API key: {}", e))
        };
        headers.insert("apikey", HeaderValue::from_str(api_key).map_err(invalid)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(invalid)?
        );
        Ok(Self {
            http: HttpClient::builder().default_headers(headers).build()?,
            storage_url: format!("{}/storage/v1", backend_url.trim_end_matches('/')),
            bucket: bucket.to_string(),
        })
    }

    pub fn public_url(&self, path: &str) -> String {
        format!("{}/object/public/{}/{}", self.storage_url, self.bucket, path)
    }
}

#[async_trait]
impl ObjectStore for BucketStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> ChatResult<String> {
        let url = format!("{}/object/{}/{}", self.storage_url, self.bucket, path);
        let resp = self.http
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("Upload to bucket '{}' failed with {}: {}", self.bucket, status, body);
            return Err(ChatError::Storage(format!("upload failed with status {}", status.as_u16())));
        }
        Ok(self.public_url(path))
    }
}
