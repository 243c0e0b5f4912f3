use aws_credential_types::Credentials;
use aws_sdk_s3::operation::create_bucket::CreateBucketError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_types::region::Region;
use bytes::Bytes;
use camera_upload_common::config::{ConfigError, ConnectionString, StoreConfig};
use chrono::{DateTime, SecondsFormat, Utc};
use std::future::Future;
use tracing::{debug, info, warn};

/// One encoded frame ready to be written to the remote container.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub name: String,
    pub data: Bytes,
    pub container: String,
    pub captured_at: Option<DateTime<Utc>>,
}

/// Remote object store holding uploaded frames.
pub trait BlobStore: Send + Sync {
    fn container(&self) -> &str;

    /// Make sure the container exists. Safe to call repeatedly; a container
    /// that already exists is not an error.
    fn ensure_container(&self) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Write `record` under `record.name`. With `overwrite == false` an
    /// existing object of the same name is left untouched and the call fails.
    fn put_blob(
        &self,
        record: &UploadRecord,
        overwrite: bool,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// S3-compatible object storage.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    region: String,
}

impl S3BlobStore {
    pub async fn new(config: &StoreConfig) -> Result<Self, StorageError> {
        let conn = if config.uses_placeholder() {
            warn!("store connection string is the placeholder; falling back to the default AWS credential chain");
            ConnectionString::parse("")?
        } else {
            ConnectionString::parse(&config.connection_string)?
        };

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(conn.region.clone()));
        if let Some(endpoint) = &conn.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&conn.access_key, &conn.secret_key) {
            let creds = Credentials::new(access_key, secret_key, None, None, "connection-string");
            loader = loader.credentials_provider(creds);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        info!(
            bucket = config.container_name,
            region = conn.region,
            endpoint = conn.endpoint.as_deref().unwrap_or("default"),
            "object store client ready"
        );

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.container_name.clone(),
            region: conn.region,
        })
    }
}

impl BlobStore for S3BlobStore {
    fn container(&self) -> &str {
        &self.bucket
    }

    async fn ensure_container(&self) -> Result<(), StorageError> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            info!(bucket = self.bucket, "bucket exists");
            return Ok(());
        }

        info!(bucket = self.bucket, "creating bucket");
        // us-east-1 must NOT include a location constraint; all other regions require one.
        let result = if self.region == "us-east-1" {
            self.client.create_bucket().bucket(&self.bucket).send().await
        } else {
            let cfg = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build();
            self.client
                .create_bucket()
                .bucket(&self.bucket)
                .create_bucket_configuration(cfg)
                .send()
                .await
        };

        match result {
            Ok(_) => {
                info!(bucket = self.bucket, "bucket created");
                Ok(())
            }
            Err(e) if e.as_service_error().is_some_and(is_already_exists) => {
                info!(bucket = self.bucket, "bucket already exists");
                Ok(())
            }
            Err(e) => Err(StorageError::CreateContainer(e.to_string())),
        }
    }

    async fn put_blob(&self, record: &UploadRecord, overwrite: bool) -> Result<(), StorageError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&record.container)
            .key(&record.name)
            .content_type("image/jpeg")
            .body(ByteStream::from(record.data.clone()));
        if !overwrite {
            req = req.if_none_match("*");
        }
        if let Some(ts) = record.captured_at {
            req = req.metadata("captured-at", ts.to_rfc3339_opts(SecondsFormat::Millis, true));
        }

        req.send().await.map_err(|e| {
            let status = e.raw_response().map(|r| r.status().as_u16());
            put_failure(&record.name, status, e.to_string())
        })?;

        debug!(key = record.name, size = record.data.len(), "stored frame");
        Ok(())
    }
}

/// A create that lost to an existing bucket still leaves the bucket usable.
fn is_already_exists(err: &CreateBucketError) -> bool {
    err.is_bucket_already_owned_by_you() || err.is_bucket_already_exists()
}

/// `If-None-Match: *` refusals come back as 412 Precondition Failed.
fn put_failure(name: &str, status: Option<u16>, message: String) -> StorageError {
    match status {
        Some(412) => StorageError::AlreadyExists(name.to_string()),
        _ => StorageError::PutObject(message),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid store configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create container: {0}")]
    CreateContainer(String),
    #[error("failed to put object: {0}")]
    PutObject(String),
    #[error("object {0} already exists")]
    AlreadyExists(String),
}
