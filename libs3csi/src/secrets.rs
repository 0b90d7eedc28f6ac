//! Secret store seam.
//!
//! Credentials may live in a cluster secret referenced from the volume
//! context.  The node server only sees the [`SecretStore`] trait; the shipped
//! [`FileSecretStore`] reads secrets projected onto the node's filesystem.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::CsiError;

/// Key/value retrieval of a named secret.
///
/// A failed lookup must be returned as an error; implementations never
/// degrade to an empty map.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>, CsiError>;
}

/// Secret store backed by a directory tree:
///
/// ```text
/// <root>/
///   <namespace>/
///     <name>/
///       accessKeyID
///       secretAccessKey
///       endpoint
/// ```
///
/// This is the layout produced when secrets are projected as volumes.  Hidden
/// entries (the `..data` symlink farm) are skipped, and trailing newlines are
/// trimmed from values.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Reject names that would escape the store root.
fn check_segment(kind: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() || value.contains('/') || value == "." || value == ".." {
        return Err(CsiError::Configuration(format!(
            "invalid secret {kind} {value:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    #[instrument(skip(self))]
    async fn get(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>, CsiError> {
        check_segment("namespace", namespace)?;
        check_segment("name", name)?;

        let dir = self.root.join(namespace).join(name);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            CsiError::Configuration(format!("get secret {namespace}/{name}: {e}"))
        })?;

        let mut data = HashMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            CsiError::Configuration(format!("list secret {namespace}/{name}: {e}"))
        })? {
            let Some(key) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if key.starts_with('.') {
                continue;
            }
            // Follows symlinks, so projected `key -> ..data/key` entries resolve.
            let meta = tokio::fs::metadata(entry.path())
                .await
                .map_err(|e| CsiError::Configuration(format!("stat secret key {key}: {e}")))?;
            if !meta.is_file() {
                continue;
            }
            let value = tokio::fs::read_to_string(entry.path())
                .await
                .map_err(|e| CsiError::Configuration(format!("read secret key {key}: {e}")))?;
            data.insert(key, value.trim_end_matches(['\n', '\r']).to_owned());
        }

        debug!(keys = data.len(), "secret loaded");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_projected_secret() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("storage/s3-creds");
        std::fs::create_dir_all(dir.join("..2024_01_01")).unwrap();
        std::fs::write(dir.join("accessKeyID"), "AKIA\n").unwrap();
        std::fs::write(dir.join("secretAccessKey"), "shh").unwrap();
        std::fs::write(dir.join("..data"), "ignored").unwrap();

        let store = FileSecretStore::new(tmp.path());
        let data = store.get("storage", "s3-creds").await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["accessKeyID"], "AKIA");
        assert_eq!(data["secretAccessKey"], "shh");
    }

    #[tokio::test]
    async fn missing_secret_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(tmp.path());
        let err = store.get("storage", "absent").await.unwrap_err();
        assert!(matches!(err, CsiError::Configuration(_)));
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(tmp.path());
        assert!(store.get("..", "etc").await.is_err());
        assert!(store.get("ns", "a/b").await.is_err());
    }
}
