//! FUSE tool backed mounter.
//!
//! [`FuseMounter`] stages a bucket by running one of the supported FUSE
//! tools (s3fs, goofys, rclone) against the staging path, then publishes it
//! with a kernel bind-mount.  Credentials reach the tool through environment
//! variables so they never show up in `ps` output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{Mounter, MounterKind};
use crate::bucket::Bucket;
use crate::error::CsiError;
use crate::mount_point::MountPointChecker;

/// Default time to wait for a daemonised FUSE tool's mount to appear.
pub const DEFAULT_MOUNT_WAIT: Duration = Duration::from_secs(10);

/// Program, arguments and environment for one FUSE tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseCommand {
    pub program: &'static str,
    pub args: Vec<String>,
    pub env: Vec<(&'static str, String)>,
}

impl FuseCommand {
    /// Build the command that mounts `bucket` at `staging_path`.
    pub fn for_bucket(bucket: &Bucket, staging_path: &Path, mount_flags: &[String]) -> Self {
        let creds = &bucket.credentials;
        let staging = staging_path.display().to_string();
        let extra_opts = mount_flags
            .iter()
            .flat_map(|flag| ["-o".to_owned(), flag.clone()]);

        match bucket.mounter {
            MounterKind::S3fs => {
                let source = if bucket.fs_prefix.is_empty() {
                    bucket.name.clone()
                } else {
                    format!("{}:/{}", bucket.name, bucket.fs_prefix)
                };
                let mut args = vec![
                    source,
                    staging,
                    "-o".to_owned(),
                    format!("url={}", creds.endpoint),
                    "-o".to_owned(),
                    format!("endpoint={}", creds.region),
                    "-o".to_owned(),
                    "use_path_request_style".to_owned(),
                    "-o".to_owned(),
                    "allow_other".to_owned(),
                    "-o".to_owned(),
                    "mp_umask=000".to_owned(),
                ];
                args.extend(extra_opts);
                Self {
                    program: "s3fs",
                    args,
                    env: vec![
                        ("AWSACCESSKEYID", creds.access_key_id.clone()),
                        ("AWSSECRETACCESSKEY", creds.secret_access_key.clone()),
                    ],
                }
            }
            MounterKind::Goofys => {
                let source = if bucket.fs_prefix.is_empty() {
                    bucket.name.clone()
                } else {
                    format!("{}:{}", bucket.name, bucket.fs_prefix)
                };
                let mut args = vec![
                    "--endpoint".to_owned(),
                    creds.endpoint.clone(),
                    "--region".to_owned(),
                    creds.region.clone(),
                    "-o".to_owned(),
                    "allow_other".to_owned(),
                ];
                args.extend(extra_opts);
                args.push(source);
                args.push(staging);
                Self {
                    program: "goofys",
                    args,
                    env: aws_env(bucket),
                }
            }
            MounterKind::Rclone => {
                let source = if bucket.fs_prefix.is_empty() {
                    format!(":s3:{}", bucket.name)
                } else {
                    format!(":s3:{}/{}", bucket.name, bucket.fs_prefix)
                };
                let mut args = vec![
                    "mount".to_owned(),
                    source,
                    staging,
                    "--daemon".to_owned(),
                    "--s3-provider=Other".to_owned(),
                    format!("--s3-endpoint={}", creds.endpoint),
                    format!("--s3-region={}", creds.region),
                    "--s3-env-auth".to_owned(),
                    "--allow-other".to_owned(),
                    "--vfs-cache-mode=writes".to_owned(),
                ];
                args.extend(extra_opts);
                Self {
                    program: "rclone",
                    args,
                    env: aws_env(bucket),
                }
            }
        }
    }
}

fn aws_env(bucket: &Bucket) -> Vec<(&'static str, String)> {
    vec![
        ("AWS_ACCESS_KEY_ID", bucket.credentials.access_key_id.clone()),
        (
            "AWS_SECRET_ACCESS_KEY",
            bucket.credentials.secret_access_key.clone(),
        ),
    ]
}

/// Production [`Mounter`].
#[derive(Debug, Clone)]
pub struct FuseMounter {
    checker: MountPointChecker,
    mount_wait: Duration,
}

impl FuseMounter {
    pub fn new(checker: MountPointChecker, mount_wait: Duration) -> Self {
        Self {
            checker,
            mount_wait,
        }
    }

    /// Run the tool to completion.  The tool gets `mount_wait` to daemonise;
    /// past that it is killed and the stage fails.
    async fn run(&self, cmd: &FuseCommand, staging_path: &Path) -> Result<(), CsiError> {
        let failed = |reason: String| CsiError::MountFailed {
            path: staging_path.display().to_string(),
            reason,
        };

        debug!(program = cmd.program, args = ?cmd.args, "spawning FUSE tool");
        let child = Command::new(cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("spawn {}: {e}", cmd.program)))?;

        let output = tokio::time::timeout(self.mount_wait, child.wait_with_output())
            .await
            .map_err(|_| {
                failed(format!(
                    "{} did not finish within {:?}",
                    cmd.program, self.mount_wait
                ))
            })?
            .map_err(|e| failed(format!("wait for {}: {e}", cmd.program)))?;

        if !output.status.success() {
            return Err(failed(format!(
                "{} exited with {}: {}",
                cmd.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for FuseMounter {
    #[instrument(skip(self, bucket, mount_flags), fields(bucket = %bucket.name, mounter = %bucket.mounter))]
    async fn stage(
        &self,
        bucket: &Bucket,
        staging_path: &Path,
        mount_flags: &[String],
    ) -> Result<(), CsiError> {
        if self.checker.is_mount_point(staging_path).await? {
            debug!(path = %staging_path.display(), "staging path already mounted");
            return Ok(());
        }

        let cmd = FuseCommand::for_bucket(bucket, staging_path, mount_flags);
        self.run(&cmd, staging_path).await?;

        if let Err(e) = self.checker.wait_for_mount(staging_path, self.mount_wait).await {
            // The tool may still finish mounting after we gave up; do not
            // leave that mount behind.
            if let Err(cleanup) = unmount_path(staging_path).await {
                warn!(path = %staging_path.display(), error = %cleanup, "cleanup after failed stage");
            }
            return Err(e);
        }

        info!(path = %staging_path.display(), "bucket staged");
        Ok(())
    }

    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    async fn mount(
        &self,
        bucket: &Bucket,
        staging_path: &Path,
        target_path: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        if self.checker.is_mount_point(target_path).await? {
            debug!(path = %target_path.display(), "target already mounted");
            return Ok(());
        }

        let source = staging_path.to_path_buf();
        let target = target_path.to_path_buf();
        tokio::task::spawn_blocking(move || bind_mount(&source, &target, read_only))
            .await
            .map_err(CsiError::internal)??;

        info!(
            target_path = %target_path.display(),
            read_only,
            "volume published (bind-mount)",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
        if self.checker.is_mount_point(path).await? {
            unmount_path(path).await?;
            info!(path = %path.display(), "unmounted");
        } else {
            debug!(path = %path.display(), "not mounted, nothing to unmount");
        }

        match tokio::fs::remove_dir(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "mount directory left in place"),
        }
        Ok(())
    }
}

/// Bind-mount `source` onto `target`, creating `target` if needed.
fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError> {
    let failed = |reason: String| CsiError::MountFailed {
        path: target.display().to_string(),
        reason,
    };

    std::fs::create_dir_all(target).map_err(|e| failed(e.to_string()))?;

    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| failed(e.to_string()))?;

    // Some kernels ignore MS_RDONLY on the initial bind-mount call; a
    // separate remount is required to actually enforce read-only access.
    if read_only
        && let Err(e) = nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
    {
        // Never leave a writable mount behind when read-only was asked for.
        detach(target);
        return Err(failed(format!("remount read-only: {e}")));
    }
    Ok(())
}

/// Lazily detach `target`, logging instead of failing.
fn detach(target: &Path) {
    if let Err(e) = nix::mount::umount2(target, MntFlags::MNT_DETACH) {
        warn!(path = %target.display(), error = %e, "detach after failed bind-mount");
    }
}

/// Unmount `path`, falling back from a plain umount to the FUSE helpers and
/// finally a lazy detach.
async fn unmount_path(path: &Path) -> Result<(), CsiError> {
    let target: PathBuf = path.to_path_buf();
    let first = tokio::task::spawn_blocking({
        let target = target.clone();
        move || nix::mount::umount(target.as_path())
    })
    .await
    .map_err(CsiError::internal)?;

    match first {
        Ok(()) => return Ok(()),
        // EINVAL: not a mount point any more, someone else got there first.
        Err(nix::errno::Errno::EINVAL) => return Ok(()),
        Err(e) => debug!(path = %path.display(), error = %e, "umount failed, trying FUSE helpers"),
    }

    for helper in ["fusermount3", "fusermount"] {
        match Command::new(helper).arg("-u").arg(&target).output().await {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => debug!(
                "{helper} -u {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => debug!("{helper} -u {} error: {e}", path.display()),
        }
    }

    tokio::task::spawn_blocking(move || nix::mount::umount2(target.as_path(), MntFlags::MNT_DETACH))
        .await
        .map_err(CsiError::internal)?
        .map_err(|e| CsiError::UnmountFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
