//! Object storage for delivered screenshots
//!
//! [`ObjectStore`] is the seam the dispatcher uploads through.
//! [`HttpObjectStore`] speaks path-style requests to an S3-compatible
//! endpoint, signed with [`Signer`] when credentials are configured.

use crate::signing::uri_encode;
use crate::{Credentials, Signer, StorageConfig, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use tracing::{debug, info};
use url::Url;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), StorageError>;
}

/// Path-style client for S3-compatible endpoints.
///
/// Without a signer the endpoint must accept anonymous writes to the bucket.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: Url,
    signer: Option<Signer>,
}

impl HttpObjectStore {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Result<Self, StorageError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StorageError::Transport(format!("invalid endpoint '{endpoint}': {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(StorageError::Transport(format!(
                "endpoint '{endpoint}' cannot be a base"
            )));
        }
        Ok(Self {
            client,
            endpoint,
            signer: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials, region: &str) -> Self {
        self.signer = Some(Signer::new(credentials, region));
        self
    }

    pub fn from_config(client: reqwest::Client, config: &StorageConfig) -> Result<Self, StorageError> {
        let store = Self::new(client, &config.endpoint_url())?;
        Ok(match config.credentials() {
            Some(credentials) => store.with_credentials(credentials, &config.region),
            None => store,
        })
    }

    pub fn is_signed(&self) -> bool {
        self.signer.is_some()
    }

    // Segments are encoded the same way the signer expects the path.
    fn object_url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        let mut path = url.path().trim_end_matches('/').to_string();
        for segment in segments {
            path.push('/');
            path.push_str(&uri_encode(segment));
        }
        url.set_path(&path);
        url
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(signer) = &self.signer {
            let headers: Vec<(&str, &str)> = content_type
                .map(|value| vec![("content-type", value)])
                .unwrap_or_default();
            let signed = signer.sign(method.as_str(), &url, &headers, &body, Utc::now());
            request = request
                .header("x-amz-date", signed.amz_date)
                .header("x-amz-content-sha256", signed.content_sha256)
                .header(AUTHORIZATION, signed.authorization);
        }
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        if body.is_empty() {
            request
        } else {
            request.body(body)
        }
    }
}

async fn rejected(response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    StorageError::Rejected { status, message }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let size = bytes.len();
        let response = self
            .request(
                Method::PUT,
                self.object_url(&[bucket, key]),
                Some(content_type),
                bytes,
            )
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        debug!("Stored {}/{} ({} bytes)", bucket, key, size);
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let response = self
            .request(Method::HEAD, self.object_url(&[bucket]), None, Vec::new())
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejected(response).await),
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), StorageError> {
        let url = self.object_url(&[bucket]);
        let request = if !region.is_empty() && region != "us-east-1" {
            let body = format!(
                "<CreateBucketConfiguration><LocationConstraint>{region}</LocationConstraint></CreateBucketConfiguration>"
            );
            self.request(Method::PUT, url, Some("application/xml"), body.into_bytes())
        } else {
            self.request(Method::PUT, url, None, Vec::new())
        };

        let response = request
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(())
    }
}

/// Creates `bucket` unless it already exists.
pub async fn ensure_bucket(
    store: &dyn ObjectStore,
    bucket: &str,
    region: &str,
) -> Result<(), StorageError> {
    if store.bucket_exists(bucket).await? {
        debug!("Bucket {} already exists", bucket);
        return Ok(());
    }

    store.create_bucket(bucket, region).await?;
    info!("Created bucket {} in {}", bucket, region);
    Ok(())
}
