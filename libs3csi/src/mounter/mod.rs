//! Pluggable mount backends.
//!
//! A [`Mounter`] turns a resolved [`Bucket`] into a FUSE mount at the staging
//! path and bind-mounts it into workload paths.  The node server only talks
//! to the trait; which FUSE tool does the work is decided by the bucket's
//! [`MounterKind`].

pub mod fuse;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bucket::Bucket;
use crate::error::CsiError;

pub use fuse::FuseMounter;

/// The FUSE tools a bucket can be mounted with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MounterKind {
    #[default]
    S3fs,
    Goofys,
    Rclone,
}

impl MounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3fs => "s3fs",
            Self::Goofys => "goofys",
            Self::Rclone => "rclone",
        }
    }
}

impl fmt::Display for MounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MounterKind {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3fs" => Ok(Self::S3fs),
            "goofys" => Ok(Self::Goofys),
            "rclone" => Ok(Self::Rclone),
            other => Err(CsiError::Configuration(format!("unknown mounter {other:?}"))),
        }
    }
}

/// Mount backend capabilities.
///
/// Every operation is idempotent: staging an already staged path, mounting
/// an already mounted target, or unmounting a path that is not mounted all
/// succeed without doing anything.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// FUSE-mount `bucket` at `staging_path`.
    async fn stage(
        &self,
        bucket: &Bucket,
        staging_path: &Path,
        mount_flags: &[String],
    ) -> Result<(), CsiError>;

    /// Bind-mount `staging_path` onto `target_path`.
    async fn mount(
        &self,
        bucket: &Bucket,
        staging_path: &Path,
        target_path: &Path,
        read_only: bool,
    ) -> Result<(), CsiError>;

    /// Unmount `path` and clean up its mount directory.
    async fn unmount(&self, path: &Path) -> Result<(), CsiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounter_kind_parses_case_insensitively() {
        assert_eq!("S3FS".parse::<MounterKind>().unwrap(), MounterKind::S3fs);
        assert_eq!("rclone".parse::<MounterKind>().unwrap(), MounterKind::Rclone);
        assert!(matches!(
            "s3backer".parse::<MounterKind>(),
            Err(CsiError::Configuration(_))
        ));
    }

    #[test]
    fn mounter_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&MounterKind::Goofys).unwrap();
        assert_eq!(json, "\"goofys\"");
        assert_eq!(MounterKind::default().to_string(), "s3fs");
    }
}
