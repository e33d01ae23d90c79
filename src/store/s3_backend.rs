//! S3-compatible artifact store (MinIO in development).

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use secrecy::ExposeSecret;

use super::traits::{ArtifactStore, BucketCreation};
use crate::config::ObjectStoreConfig;
use crate::error::StoreError;

const STORE: &str = "object store";

/// Map an SDK error. Dispatch failures and timeouts are transient; the SDK
/// has already spent its own retry budget on them by the time we see them.
fn map_sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let transient = matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    );
    let reason = DisplayErrorContext(&err).to_string();
    if transient {
        StoreError::Unavailable {
            store: STORE,
            operation,
            reason,
        }
    } else {
        StoreError::Rejected {
            store: STORE,
            operation,
            reason,
        }
    }
}

/// Artifact store over the AWS S3 SDK, path-style for MinIO.
#[derive(Clone)]
pub struct S3ArtifactStore {
    client: Client,
    region: String,
}

impl S3ArtifactStore {
    pub fn new(config: &ObjectStoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.expose_secret().to_string(),
            None,
            None,
            "download-worker-env",
        );
        // Three attempts, backoff capped at two seconds.
        let retry = RetryConfig::standard()
            .with_max_attempts(3)
            .with_max_backoff(Duration::from_secs(2));

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint_url())
            .credentials_provider(credentials)
            .force_path_style(true)
            .retry_config(retry)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            region: config.region.clone(),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                // HEAD has no body, so some servers only give us the status code.
                let not_found = err.as_service_error().is_some_and(|e| e.is_not_found())
                    || err.raw_response().is_some_and(|r| r.status().as_u16() == 404);
                if not_found {
                    Ok(false)
                } else {
                    Err(map_sdk_error("bucket_exists", err))
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<BucketCreation, StoreError> {
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 is the one region that must not be named as a constraint.
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                aws_sdk_s3::types::CreateBucketConfiguration::builder()
                    .location_constraint(aws_sdk_s3::types::BucketLocationConstraint::from(
                        self.region.as_str(),
                    ))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(BucketCreation::Created),
            Err(err) => {
                let lost_race = err.as_service_error().is_some_and(|e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                });
                if lost_race {
                    Ok(BucketCreation::AlreadyExists)
                } else {
                    Err(map_sdk_error("create_bucket", err))
                }
            }
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let length = body.len() as i64;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .content_length(length)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error("put_object", e))?;
        Ok(())
    }
}
