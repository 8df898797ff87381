use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    Client,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use super::{config::StorageConfig, ObjectMeta, ObjectStore};
use crate::error::StorageError;

/// [`ObjectStore`] over one S3 bucket
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig, bucket: impl Into<String>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let Some((access, secret)) = config.static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                access,
                secret,
                None,
                None,
                "meterflow-storage",
            ));
        }

        let shared = loader.load().await;
        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let bucket = bucket.into();
        info!("Storage client initialized for bucket: {}", bucket);

        Self {
            client: Client::from_conf(builder.build()),
            bucket,
        }
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Same connection, different bucket
    pub fn with_bucket(&self, bucket: impl Into<String>) -> Self {
        Self::from_client(self.client.clone(), bucket)
    }
}

fn classify<E: ProvideErrorMetadata, R>(context: &str, err: &SdkError<E, R>) -> StorageError {
    let message = format!("{}: {}", context, err);
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => StorageError::Timeout(message),
        _ => match err.code() {
            Some("NoSuchKey" | "NotFound" | "NoSuchBucket") => {
                StorageError::NotFound(context.to_string())
            }
            Some(
                "SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout"
                | "ServiceUnavailable" | "InternalError",
            ) => StorageError::Throttled(message),
            _ => StorageError::Backend(message),
        },
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

fn clean_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// Copy sources are URL-encoded per path segment
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
    format!("{}/{}", bucket, encoded.join("/"))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(clean_etag),
                last_modified: output.last_modified().and_then(to_chrono),
            })),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(None),
            Err(err) => match classify(key, &err) {
                StorageError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, &e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Timeout(format!("{}: {}", key, e)))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(data)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_head(&self, key: &str, max_bytes: usize) -> Result<Vec<u8>, StorageError> {
        if max_bytes == 0 {
            return Ok(Vec::new());
        }

        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes=0-{}", max_bytes - 1))
            .send()
            .await
        {
            Ok(response) => response,
            // Ranged reads of an empty object
            Err(err) if err.code() == Some("InvalidRange") => return Ok(Vec::new()),
            Err(err) => return Err(classify(key, &err)),
        };

        let mut data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Timeout(format!("{}: {}", key, e)))?
            .into_bytes()
            .to_vec();
        data.truncate(max_bytes);
        Ok(data)
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket, size = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectMeta, StorageError> {
        let size = data.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        let output = request.send().await.map_err(|e| classify(key, &e))?;
        debug!("Uploaded s3://{}/{}", self.bucket, key);

        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            etag: output.e_tag().map(clean_etag),
            last_modified: Some(Utc::now()),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, src))
            .key(dst)
            .send()
            .await
            .map_err(|e| classify(src, &e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, &e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(prefix, &e))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectMeta {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    etag: object.e_tag().map(clean_etag),
                    last_modified: object.last_modified().and_then(to_chrono),
                });
            }
        }

        debug!("Listed {} objects under s3://{}/{}", objects.len(), self.bucket, prefix);
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encodes_segments() {
        assert_eq!(
            copy_source("ingest", "landing/RACV Usage (1).csv"),
            "ingest/landing/RACV%20Usage%20%281%29.csv"
        );
    }

    #[test]
    fn test_clean_etag() {
        assert_eq!(clean_etag("\"abc123\""), "abc123");
        assert_eq!(clean_etag("abc123"), "abc123");
    }
}
