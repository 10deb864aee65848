//! S3 object store
//!
//! Implements [`ObjectStore`] with the AWS SDK. Works against AWS S3 and
//! S3-compatible stores (MinIO, ...) through a custom endpoint.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::timeout::TimeoutConfig;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::StorageError;
use super::object::{ObjectListing, ObjectStore, ObjectSummary};
use crate::config::S3StorageConfig;
use crate::error::redact_secrets;

const DEFAULT_REGION: &str = "us-east-1";

/// Static credentials that never show their secret
pub struct S3Credentials {
    access_key_id: String,
    secret_access_key: String,
}

impl S3Credentials {
    /// Create credentials
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Access key with all but the first four characters hidden
    pub fn redacted_access_key(&self) -> String {
        match self.access_key_id.get(..4) {
            Some(visible) if self.access_key_id.len() > 4 => format!("{}...[REDACTED]", visible),
            _ => "[REDACTED]".to_string(),
        }
    }

    fn into_sdk(self) -> Credentials {
        Credentials::new(
            self.access_key_id,
            self.secret_access_key,
            None,
            None,
            "file-manager-config",
        )
    }
}

// Debug and Display both go through the redacted form
impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::fmt::Display for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "S3Credentials {{ access_key_id: {}, secret: [REDACTED] }}",
            self.redacted_access_key()
        )
    }
}

/// [`ObjectStore`] backed by an S3 bucket
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
}

fn transport_error(action: &str, key: &str, error: impl std::error::Error) -> StorageError {
    StorageError::BackendError(format!(
        "S3 {} {} failed: {}",
        action,
        key,
        redact_secrets(&DisplayErrorContext(error).to_string())
    ))
}

fn to_chrono(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl S3ObjectStore {
    /// Create a store from configuration.
    ///
    /// Uses the configured key/secret when both are present, otherwise the
    /// default AWS credential chain (environment, profile, instance role).
    pub async fn new(config: &S3StorageConfig) -> Result<Self, StorageError> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| StorageError::InvalidOperation("S3 bucket is not configured".to_string()))?;
        let region = config
            .region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.timeout())
                    .build(),
            );

        if let (Some(key), Some(secret)) = (&config.key, &config.secret) {
            let credentials = S3Credentials::new(key, secret);
            debug!("Using static S3 credentials {}", credentials);
            config_loader = config_loader.credentials_provider(credentials.into_sdk());
        }

        let sdk_config = config_loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
            s3_config = s3_config.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config.build());
        info!("S3 storage ready on s3://{}/{}", bucket, config.path);

        Ok(Self {
            client,
            bucket,
            region,
            endpoint: config.endpoint.clone(),
        })
    }

    /// `bucket/key` with the key percent-encoded, as CopyObject expects
    fn copy_source(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.bucket,
            urlencoding::encode(key).replace("%2F", "/")
        )
    }
}

#[async_trait(?Send)]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn public_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| transport_error("PutObject", key, e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => return Ok(None),
            Err(e) => return Err(transport_error("GetObject", key, e)),
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| transport_error("GetObject", key, e))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectSummary>, StorageError> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => Ok(Some(ObjectSummary {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0).max(0) as u64,
                last_modified: to_chrono(response.last_modified()),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(transport_error("HeadObject", key, e)),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| transport_error("DeleteObject", key, e))?;
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(from))
            .key(to)
            .send()
            .await
            .map_err(|e| transport_error("CopyObject", from, e))?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str, delimiter: Option<char>) -> Result<ObjectListing, StorageError> {
        let mut listing = ObjectListing::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(delimiter) = delimiter {
                request = request.delimiter(delimiter.to_string());
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| transport_error("ListObjectsV2", prefix, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    listing.objects.push(ObjectSummary {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        last_modified: to_chrono(object.last_modified()),
                    });
                }
            }
            listing.common_prefixes.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string)),
            );

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(listing)
    }
}
