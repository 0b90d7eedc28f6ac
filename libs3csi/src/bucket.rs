//! Bucket lookup seam.
//!
//! [`BucketClient`] answers the two questions the node server asks of object
//! storage: does the bucket exist, and how should it be mounted.  The shipped
//! [`S3BucketClient`] talks to any S3-compatible endpoint through the
//! `object_store` crate.

use object_store::ObjectStore;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::credentials::Credentials;
use crate::error::CsiError;
use crate::mounter::MounterKind;

/// Object written at the bucket root by the provisioner to record how the
/// volume was created.
pub const METADATA_OBJECT: &str = ".metadata.json";

/// Provisioning record stored in [`METADATA_OBJECT`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetadata {
    #[serde(default)]
    pub mounter: Option<MounterKind>,
    /// Key prefix inside the bucket that backs the volume.
    #[serde(default)]
    pub fs_path: String,
    #[serde(default)]
    pub capacity_bytes: u64,
}

/// Everything a mount backend needs to mount one bucket.  Scoped to a single
/// request.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Bucket name; equal to the volume id.
    pub name: String,
    pub mounter: MounterKind,
    /// Key prefix mounted instead of the bucket root; empty for the root.
    pub fs_prefix: String,
    pub capacity_bytes: u64,
    pub credentials: Credentials,
}

impl Bucket {
    /// Combine the provisioning record (if any) with the request's
    /// credentials.  The mounter is taken from the record, then the
    /// credentials, then `default_mounter`.
    pub fn resolve(
        name: &str,
        metadata: Option<BucketMetadata>,
        credentials: &Credentials,
        default_mounter: MounterKind,
    ) -> Self {
        let metadata = metadata.unwrap_or_default();
        Self {
            name: name.to_owned(),
            mounter: metadata
                .mounter
                .or(credentials.mounter)
                .unwrap_or(default_mounter),
            fs_prefix: metadata.fs_path.trim_matches('/').to_owned(),
            capacity_bytes: metadata.capacity_bytes,
            credentials: credentials.clone(),
        }
    }
}

/// Existence check and descriptor lookup for a named bucket.
#[async_trait]
pub trait BucketClient: Send + Sync {
    async fn exists(&self, credentials: &Credentials, name: &str) -> Result<bool, CsiError>;

    async fn describe(&self, credentials: &Credentials, name: &str) -> Result<Bucket, CsiError>;
}

/// [`BucketClient`] for S3-compatible endpoints.
#[derive(Debug, Clone, Default)]
pub struct S3BucketClient {
    default_mounter: MounterKind,
}

impl S3BucketClient {
    pub fn new(default_mounter: MounterKind) -> Self {
        Self { default_mounter }
    }

    fn store(credentials: &Credentials, name: &str) -> Result<AmazonS3, CsiError> {
        AmazonS3Builder::new()
            .with_bucket_name(name)
            .with_region(&credentials.region)
            .with_endpoint(&credentials.endpoint)
            .with_access_key_id(&credentials.access_key_id)
            .with_secret_access_key(&credentials.secret_access_key)
            .with_allow_http(!credentials.use_ssl)
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(CsiError::config)
    }
}

#[async_trait]
impl BucketClient for S3BucketClient {
    #[instrument(skip(self, credentials))]
    async fn exists(&self, credentials: &Credentials, name: &str) -> Result<bool, CsiError> {
        let store = Self::store(credentials, name)?;
        match store.list_with_delimiter(None).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => {
                debug!(bucket = name, "bucket does not exist");
                Ok(false)
            }
            Err(e) => Err(CsiError::BackendError(format!(
                "check bucket {name}: {e}"
            ))),
        }
    }

    #[instrument(skip(self, credentials))]
    async fn describe(&self, credentials: &Credentials, name: &str) -> Result<Bucket, CsiError> {
        let store = Self::store(credentials, name)?;
        let metadata = match store.get(&ObjectPath::from(METADATA_OBJECT)).await {
            Ok(result) => {
                let body = result.bytes().await.map_err(CsiError::backend)?;
                let metadata: BucketMetadata = serde_json::from_slice(&body).map_err(|e| {
                    CsiError::Configuration(format!("parse {METADATA_OBJECT} in {name}: {e}"))
                })?;
                Some(metadata)
            }
            // Removed between the existence check and this read.
            Err(e) if mentions_no_such_bucket(&e) => {
                return Err(CsiError::BucketNotFound(name.to_owned()));
            }
            Err(e) if is_not_found(&e) => None,
            Err(e) => {
                return Err(CsiError::BackendError(format!(
                    "read {METADATA_OBJECT} in {name}: {e}"
                )));
            }
        };
        Ok(Bucket::resolve(name, metadata, credentials, self.default_mounter))
    }
}

/// Render `err` together with its whole source chain.
fn error_chain(err: &object_store::Error) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn mentions_no_such_bucket(err: &object_store::Error) -> bool {
    error_chain(err).contains("NoSuchBucket")
}

/// `true` when S3 answered 404.
///
/// `object_store` reports list failures as `Error::Generic`, so the HTTP
/// status and the S3 error code only survive in the message.  A 404 on the
/// bucket root can only mean the bucket itself is absent.
fn is_not_found(err: &object_store::Error) -> bool {
    if matches!(err, object_store::Error::NotFound { .. }) {
        return true;
    }
    let text = error_chain(err);
    text.contains("NoSuchBucket") || text.contains("status 404")
}
