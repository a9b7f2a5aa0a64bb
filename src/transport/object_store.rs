//! Object-store backed payloads

use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use tracing::debug;

use super::TransportError;
use crate::config::PayloadConfig;

/// Store holding bodies that workers could not return inline
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Bytes, TransportError>;

    async fn delete(&self, key: &str) -> Result<(), TransportError>;
}

/// S3 or any S3-compatible store
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    /// Build from configuration. Credentials come from the standard AWS
    /// environment variables.
    pub fn from_config(config: &PayloadConfig) -> Result<Self, TransportError> {
        let name = config.s3_bucket.as_deref().ok_or(TransportError::NotConfigured)?;
        let endpoint = config
            .s3_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.s3_region));
        let custom = config.s3_endpoint.is_some();
        let region = Region::Custom {
            region: config.s3_region.clone(),
            endpoint,
        };
        let credentials = Credentials::from_env()
            .map_err(|e| TransportError::Backend(format!("missing S3 credentials: {}", e)))?;

        let mut bucket = Bucket::new(name, region, credentials)
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        if custom {
            bucket = bucket.with_path_style();
        }
        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn fetch(&self, key: &str) -> Result<Bytes, TransportError> {
        let response = match self.bucket.get_object(key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(404, _)) => {
                return Err(TransportError::ObjectMissing(key.to_string()))
            }
            Err(e) => return Err(TransportError::Backend(e.to_string())),
        };

        match response.status_code() {
            200..=299 => {
                debug!(key, size = response.bytes().len(), "Fetched payload object");
                Ok(response.bytes().clone())
            }
            404 => Err(TransportError::ObjectMissing(key.to_string())),
            status => Err(TransportError::Backend(format!(
                "object store returned status {} for {}",
                status, key
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), TransportError> {
        let response = self
            .bucket
            .delete_object(key)
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        match response.status_code() {
            200..=299 => Ok(()),
            status => Err(TransportError::Backend(format!(
                "object store returned status {} deleting {}",
                status, key
            ))),
        }
    }
}
