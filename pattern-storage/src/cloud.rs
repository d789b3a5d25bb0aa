//! Cloud bucket backend over plain HTTP object access.
//!
//! Objects are addressed as `{endpoint}/{bucket}/{dir}/{name}`; `GET` reads
//! and `PUT` replaces.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::{BlobPath, BlobStore, StorageError, StorageResult};

#[derive(Debug, Clone)]
pub struct CloudBlobStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl CloudBlobStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StorageError::Http {
                url: endpoint.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.trim_matches('/').to_string(),
            token,
        })
    }

    #[must_use]
    pub fn object_url(&self, path: &BlobPath) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn http_error(url: &str, reason: impl ToString) -> StorageError {
        StorageError::Http {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for CloudBlobStore {
    fn backend(&self) -> &'static str {
        "cloud"
    }

    async fn get(&self, path: &BlobPath) -> StorageResult<Vec<u8>> {
        let url = self.object_url(path);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|err| Self::http_error(&url, err))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound {
                backend: "cloud",
                path: path.to_string(),
            }),
            status if status.is_success() => {
                let bytes = response.bytes().await.map_err(|err| Self::http_error(&url, err))?;
                debug!(url = %url, bytes = bytes.len(), "cloud blob fetched");
                Ok(bytes.to_vec())
            }
            status => Err(Self::http_error(&url, format!("unexpected status {status}"))),
        }
    }

    async fn create(&self, path: &BlobPath, bytes: Vec<u8>) -> StorageResult<()> {
        let url = self.object_url(path);
        let response = self
            .authorize(self.client.put(&url))
            .body(bytes)
            .send()
            .await
            .map_err(|err| Self::http_error(&url, err))?;
        if !response.status().is_success() {
            return Err(Self::http_error(&url, format!("unexpected status {}", response.status())));
        }
        debug!(url = %url, "cloud blob written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn object_urls_join_endpoint_bucket_and_path() {
        let store = CloudBlobStore::new(
            "https://storage.example.com/",
            "/patterns-bucket/",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let url = store.object_url(&crate::layout::chunk(3, 9, "1"));
        assert_eq!(
            url,
            "https://storage.example.com/patterns-bucket/projects/3/models/9/chunks/chunk_1.txt"
        );
    }
}
