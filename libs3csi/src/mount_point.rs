//! Mount point detection.
//!
//! The operating system's mount table is the only record of whether a
//! volume is staged or published; nothing is cached here.  Every check reads
//! the table again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::CsiError;

/// Mount table consulted on Linux.
pub const DEFAULT_MOUNTS_FILE: &str = "/proc/self/mounts";

/// Permission mode for staging and target directories created on demand.
pub const DEFAULT_DIR_MODE: u32 = 0o750;

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Answers "is this path a mount point?" and creates missing mount
/// directories.
#[derive(Debug, Clone)]
pub struct MountPointChecker {
    mounts_file: PathBuf,
    dir_mode: u32,
}

impl Default for MountPointChecker {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNTS_FILE)
    }
}

impl MountPointChecker {
    /// Create a checker reading the given mount table.  Anything in the
    /// `/proc/self/mounts` format works, which lets tests supply a fake one.
    pub fn new(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
            dir_mode: DEFAULT_DIR_MODE,
        }
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    pub fn mounts_file(&self) -> &Path {
        &self.mounts_file
    }

    /// Return `Ok(true)` when `path` still needs a mount.
    ///
    /// A missing path is created (with parents) and reported as not mounted.
    pub async fn is_not_mounted(&self, path: &Path) -> Result<bool, CsiError> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(!self.is_mount_point(path).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(self.dir_mode)
                    .create(path)
                    .await
                    .map_err(|e| {
                        CsiError::Internal(format!("create dir {}: {e}", path.display()))
                    })?;
                debug!(path = %path.display(), "created mount directory");
                Ok(true)
            }
            Err(e) => Err(CsiError::Internal(format!(
                "stat {}: {e}",
                path.display()
            ))),
        }
    }

    /// Return `true` if `path` is listed as a mount point in the mount table.
    pub async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError> {
        let contents = tokio::fs::read_to_string(&self.mounts_file)
            .await
            .map_err(|e| {
                CsiError::Internal(format!("read {}: {e}", self.mounts_file.display()))
            })?;

        let wanted = normalize(path);
        // Symlinked mount directories show up under their resolved name.
        let resolved = tokio::fs::canonicalize(path).await.ok();

        Ok(mount_points(&contents).any(|mp| {
            let mp = normalize(Path::new(&mp));
            mp == wanted || resolved.as_deref() == Some(mp.as_path())
        }))
    }

    /// Poll the mount table until `path` shows up or `timeout` elapses.
    ///
    /// FUSE tools daemonise before the kernel mount is visible, so a spawned
    /// tool exiting successfully does not mean the mount is ready yet.
    pub async fn wait_for_mount(&self, path: &Path, timeout: Duration) -> Result<(), CsiError> {
        let start = Instant::now();
        loop {
            if self.is_mount_point(path).await? {
                debug!(path = %path.display(), elapsed = ?start.elapsed(), "mount is ready");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(CsiError::MountFailed {
                    path: path.display().to_string(),
                    reason: format!("mount did not appear within {timeout:?}"),
                });
            }
            tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
        }
    }
}

/// Iterate the mount point column of a `/proc/self/mounts`-style table.
///
/// Format: `<device> <mountpoint> <fstype> <options> <dump> <pass>`.
fn mount_points(table: &str) -> impl Iterator<Item = String> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_octal)
}

/// Decode the octal escapes the kernel uses for whitespace and backslashes
/// (`\040` for space, `\011` for tab, `\012` for newline, `\134` for `\`).
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}
