//! Node lifecycle orchestration.
//!
//! [`NodeServer`] wires validation, the mount point gate, credential
//! resolution, the bucket client and the mount backend into the four node
//! operations.  It keeps no state of its own besides the per-volume locks;
//! the mount table is the durable record.
//!
//! Every stage / publish follows the same shape:
//!
//! ```text
//! validate -> lock(volume) -> already mounted? -> credentials -> bucket -> mounter
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::bucket::{Bucket, BucketClient};
use crate::config::NodeConfig;
use crate::credentials::CredentialResolver;
use crate::error::CsiError;
use crate::locks::VolumeLocks;
use crate::mount_point::MountPointChecker;
use crate::mounter::Mounter;
use crate::node::{CsiNode, Deadline};
use crate::secrets::SecretStore;
use crate::types::*;
use crate::validate;

pub struct NodeServer {
    config: NodeConfig,
    checker: MountPointChecker,
    credentials: CredentialResolver,
    buckets: Arc<dyn BucketClient>,
    mounter: Arc<dyn Mounter>,
    locks: VolumeLocks,
}

impl NodeServer {
    pub fn new(
        config: NodeConfig,
        checker: MountPointChecker,
        secrets: Arc<dyn SecretStore>,
        buckets: Arc<dyn BucketClient>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            config,
            checker,
            credentials: CredentialResolver::new(secrets),
            buckets,
            mounter,
            locks: VolumeLocks::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Resolve credentials, confirm the bucket exists and fetch its
    /// descriptor.  Each bucket client call is bounded by
    /// `bucket_check_timeout`.
    async fn lookup_bucket(
        &self,
        volume_id: &VolumeId,
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<Bucket, CsiError> {
        let credentials = self.credentials.resolve(volume_context, secrets).await?;
        let name = volume_id.as_str();
        let timeout = self.config.bucket_check_timeout;
        let timed_out = |what: &str| {
            CsiError::BackendError(format!("{what} for bucket {name} timed out after {timeout:?}"))
        };

        let exists = tokio::time::timeout(timeout, self.buckets.exists(&credentials, name))
            .await
            .map_err(|_| timed_out("existence check"))??;
        if !exists {
            return Err(CsiError::BucketNotFound(name.to_owned()));
        }

        tokio::time::timeout(timeout, self.buckets.describe(&credentials, name))
            .await
            .map_err(|_| timed_out("descriptor lookup"))?
    }
}

#[async_trait]
impl CsiNode for NodeServer {
    #[instrument(skip_all, fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(
        &self,
        req: NodeStageVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError> {
        validate::stage(&req)?;
        let _guard = self.locks.lock(&req.volume_id).await;
        deadline.check("mount point check")?;

        let staging = Path::new(&req.staging_target_path);
        if !self.checker.is_not_mounted(staging).await? {
            debug!("staging path already mounted, nothing to do");
            return Ok(());
        }

        deadline.check("bucket lookup")?;
        let bucket = self
            .lookup_bucket(&req.volume_id, &req.volume_context, &req.secrets)
            .await?;

        let mount_flags = req
            .volume_capability
            .as_ref()
            .map(|cap| cap.mount_flags.as_slice())
            .unwrap_or_default();
        deadline.check("stage")?;
        self.mounter.stage(&bucket, staging, mount_flags).await?;

        info!(mounter = %bucket.mounter, "volume staged");
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn unstage_volume(
        &self,
        req: NodeUnstageVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError> {
        validate::unstage(&req)?;
        let _guard = self.locks.lock(&req.volume_id).await;
        deadline.check("unmount")?;

        self.mounter
            .unmount(Path::new(&req.staging_target_path))
            .await?;

        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(
        &self,
        req: NodePublishVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError> {
        validate::publish(&req)?;
        let _guard = self.locks.lock(&req.volume_id).await;
        deadline.check("mount point check")?;

        let target = Path::new(&req.target_path);
        if !self.checker.is_not_mounted(target).await? {
            debug!("target path already mounted, nothing to do");
            return Ok(());
        }

        deadline.check("bucket lookup")?;
        let bucket = self
            .lookup_bucket(&req.volume_id, &req.volume_context, &req.secrets)
            .await?;

        deadline.check("mount")?;
        self.mounter
            .mount(
                &bucket,
                Path::new(&req.staging_target_path),
                target,
                req.read_only,
            )
            .await?;

        info!(read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError> {
        validate::unpublish(&req)?;
        let _guard = self.locks.lock(&req.volume_id).await;
        deadline.check("unmount")?;

        self.mounter.unmount(Path::new(&req.target_path)).await?;

        info!("volume unpublished");
        Ok(())
    }

    fn get_capabilities(&self) -> Vec<NodeServiceCapability> {
        vec![NodeServiceCapability::StageUnstageVolume]
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: self.config.max_volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, SECRET_NAME_KEY, SECRET_NAMESPACE_KEY};
    use crate::mounter::MounterKind;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    // -- fakes ---------------------------------------------------------------

    /// Mount table file shared by the fake mounter and the real checker.
    #[derive(Clone)]
    struct FakeTable(PathBuf);

    impl FakeTable {
        fn add(&self, path: &Path) {
            let mut body = std::fs::read_to_string(&self.0).unwrap_or_default();
            body.push_str(&format!("fake {} fuse.fake rw 0 0\n", path.display()));
            std::fs::write(&self.0, body).unwrap();
        }

        fn remove(&self, path: &Path) {
            let needle = format!(" {} ", path.display());
            let body: String = std::fs::read_to_string(&self.0)
                .unwrap_or_default()
                .lines()
                .filter(|l| !l.contains(&needle))
                .map(|l| format!("{l}\n"))
                .collect();
            std::fs::write(&self.0, body).unwrap();
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Stage(String, PathBuf, Vec<String>),
        Mount(PathBuf, PathBuf, bool),
        Unmount(PathBuf),
    }

    struct RecordingMounter {
        table: FakeTable,
        calls: Mutex<Vec<Call>>,
        delay: Duration,
        barrier: Option<Barrier>,
    }

    impl RecordingMounter {
        fn new(table: FakeTable) -> Self {
            Self {
                table,
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                barrier: None,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn mounts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Mount(..)))
                .count()
        }
    }

    #[async_trait]
    impl Mounter for RecordingMounter {
        async fn stage(
            &self,
            bucket: &Bucket,
            staging_path: &Path,
            mount_flags: &[String],
        ) -> Result<(), CsiError> {
            self.calls.lock().unwrap().push(Call::Stage(
                bucket.name.clone(),
                staging_path.to_path_buf(),
                mount_flags.to_vec(),
            ));
            self.table.add(staging_path);
            Ok(())
        }

        async fn mount(
            &self,
            _bucket: &Bucket,
            staging_path: &Path,
            target_path: &Path,
            read_only: bool,
        ) -> Result<(), CsiError> {
            self.calls.lock().unwrap().push(Call::Mount(
                staging_path.to_path_buf(),
                target_path.to_path_buf(),
                read_only,
            ));
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            tokio::time::sleep(self.delay).await;
            self.table.add(target_path);
            Ok(())
        }

        async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Unmount(path.to_path_buf()));
            self.table.remove(path);
            Ok(())
        }
    }

    struct FakeBuckets {
        existing: HashSet<String>,
        delay: Duration,
        failure: Option<CsiError>,
        lookups: AtomicUsize,
    }

    impl FakeBuckets {
        fn with(names: &[&str]) -> Self {
            Self {
                existing: names.iter().map(|n| n.to_string()).collect(),
                delay: Duration::ZERO,
                failure: None,
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BucketClient for FakeBuckets {
        async fn exists(&self, _credentials: &Credentials, name: &str) -> Result<bool, CsiError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            Ok(self.existing.contains(name))
        }

        async fn describe(
            &self,
            credentials: &Credentials,
            name: &str,
        ) -> Result<Bucket, CsiError> {
            Ok(Bucket::resolve(name, None, credentials, MounterKind::S3fs))
        }
    }

    struct FakeSecrets(HashMap<(String, String), HashMap<String, String>>);

    #[async_trait]
    impl SecretStore for FakeSecrets {
        async fn get(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<HashMap<String, String>, CsiError> {
            self.0
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned()
                .ok_or_else(|| CsiError::Configuration(format!("secret {namespace}/{name} not found")))
        }
    }

    // -- harness -------------------------------------------------------------

    fn s3_secrets(key_id: &str) -> HashMap<String, String> {
        HashMap::from([
            ("accessKeyID".to_owned(), key_id.to_owned()),
            ("secretAccessKey".to_owned(), "secret".to_owned()),
            ("endpoint".to_owned(), "http://127.0.0.1:9000".to_owned()),
        ])
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        server: Arc<NodeServer>,
        mounter: Arc<RecordingMounter>,
        buckets: Arc<FakeBuckets>,
    }

    impl Harness {
        fn new(buckets: FakeBuckets) -> Self {
            Self::build(buckets, |m| m, NodeConfig::for_node("node-1"))
        }

        fn build(
            buckets: FakeBuckets,
            tweak: impl FnOnce(RecordingMounter) -> RecordingMounter,
            config: NodeConfig,
        ) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            let table = FakeTable(root.join("mounts"));
            std::fs::write(&table.0, "").unwrap();

            let mounter = Arc::new(tweak(RecordingMounter::new(table.clone())));
            let buckets = Arc::new(buckets);
            let secrets = FakeSecrets(HashMap::from([(
                ("ns".to_owned(), "s".to_owned()),
                s3_secrets("from-store"),
            )]));
            let server = Arc::new(NodeServer::new(
                config,
                MountPointChecker::new(&table.0),
                Arc::new(secrets),
                buckets.clone(),
                mounter.clone(),
            ));
            Self {
                _tmp: tmp,
                root,
                server,
                mounter,
                buckets,
            }
        }

        fn stage_req(&self, volume: &str) -> NodeStageVolumeRequest {
            NodeStageVolumeRequest {
                volume_id: volume.into(),
                staging_target_path: self.root.join("stage").display().to_string(),
                volume_capability: Some(VolumeCapability {
                    mount_flags: vec!["noatime".into()],
                    ..Default::default()
                }),
                secrets: s3_secrets("inline"),
                ..Default::default()
            }
        }

        fn publish_req(&self, volume: &str, pod: &str) -> NodePublishVolumeRequest {
            NodePublishVolumeRequest {
                volume_id: volume.into(),
                staging_target_path: self.root.join("stage").display().to_string(),
                target_path: self.root.join("pods").join(pod).join("vol").display().to_string(),
                volume_capability: Some(VolumeCapability::default()),
                secrets: s3_secrets("inline"),
                ..Default::default()
            }
        }
    }

    // -- tests ---------------------------------------------------------------

    #[tokio::test]
    async fn stage_mounts_bucket_once() {
        let h = Harness::new(FakeBuckets::with(&["bucket"]));
        let req = h.stage_req("bucket");

        h.server.stage_volume(req.clone(), Deadline::none()).await.unwrap();
        h.server.stage_volume(req.clone(), Deadline::none()).await.unwrap();

        assert_eq!(
            h.mounter.calls(),
            vec![Call::Stage(
                "bucket".into(),
                PathBuf::from(&req.staging_target_path),
                vec!["noatime".into()],
            )]
        );
        // The replay never reached the bucket client.
        assert_eq!(h.buckets.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_is_idempotent() {
        let h = Harness::new(FakeBuckets::with(&["bucket"]));
        let req = h.publish_req("bucket", "x");

        h.server.publish_volume(req.clone(), Deadline::none()).await.unwrap();
        h.server.publish_volume(req.clone(), Deadline::none()).await.unwrap();

        assert_eq!(h.mounter.mounts(), 1);
        assert!(Path::new(&req.target_path).is_dir());
    }

    #[tokio::test]
    async fn read_only_is_forwarded() {
        let h = Harness::new(FakeBuckets::with(&["bucket"]));
        let mut req = h.publish_req("bucket", "ro");
        req.read_only = true;

        h.server.publish_volume(req.clone(), Deadline::none()).await.unwrap();
        assert!(matches!(h.mounter.calls()[0], Call::Mount(_, _, true)));
    }

    #[tokio::test]
    async fn validation_failure_has_no_side_effect() {
        let h = Harness::new(FakeBuckets::with(&["bucket"]));

        let mut publish = h.publish_req("bucket", "x");
        publish.volume_capability = None;
        let err = h
            .server
            .publish_volume(publish.clone(), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(!Path::new(&publish.target_path).exists());

        let mut stage = h.stage_req("bucket");
        stage.volume_id = VolumeId::default();
        let err = h.server.stage_volume(stage.clone(), Deadline::none()).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(!Path::new(&stage.staging_target_path).exists());

        let err = h
            .server
            .unpublish_volume(
                NodeUnpublishVolumeRequest {
                    volume_id: "bucket".into(),
                    target_path: String::new(),
                },
                Deadline::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        let err = h
            .server
            .unstage_volume(
                NodeUnstageVolumeRequest {
                    volume_id: VolumeId::default(),
                    staging_target_path: "/stage".into(),
                },
                Deadline::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        assert!(h.mounter.calls().is_empty());
        assert_eq!(h.buckets.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_bucket_is_not_found_and_never_mounts() {
        let h = Harness::new(FakeBuckets::with(&[]));

        let err = h
            .server
            .stage_volume(h.stage_req("ghost"), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::BucketNotFound(ref b) if b == "ghost"));
        assert_eq!(err.code(), crate::error::Code::NotFound);

        let err = h
            .server
            .publish_volume(h.publish_req("ghost", "x"), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::BucketNotFound(_)));
        assert!(h.mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn referenced_secret_is_used() {
        let h = Harness::new(FakeBuckets::with(&["bucket"]));
        let mut req = h.publish_req("bucket", "x");
        req.secrets.clear();
        req.volume_context = HashMap::from([
            (SECRET_NAMESPACE_KEY.to_owned(), "ns".to_owned()),
            (SECRET_NAME_KEY.to_owned(), "s".to_owned()),
        ]);
        h.server.publish_volume(req, Deadline::none()).await.unwrap();

        let mut req = h.publish_req("bucket", "y");
        req.volume_context = HashMap::from([
            (SECRET_NAMESPACE_KEY.to_owned(), "ns".to_owned()),
            (SECRET_NAME_KEY.to_owned(), "absent".to_owned()),
        ]);
        let err = h.server.publish_volume(req, Deadline::none()).await.unwrap_err();
        assert!(matches!(err, CsiError::Configuration(_)));
        assert_eq!(h.mounter.mounts(), 1);
    }

    #[tokio::test]
    async fn concurrent_publish_of_same_target_mounts_once() {
        let h = Harness::build(
            FakeBuckets::with(&["bucket"]),
            |mut m| {
                m.delay = Duration::from_millis(100);
                m
            },
            NodeConfig::for_node("node-1"),
        );
        let req = h.publish_req("bucket", "x");

        let (a, b) = tokio::join!(
            h.server.publish_volume(req.clone(), Deadline::none()),
            h.server.publish_volume(req.clone(), Deadline::none()),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(h.mounter.mounts(), 1);
    }

    #[tokio::test]
    async fn different_volumes_publish_in_parallel() {
        let h = Harness::build(
            FakeBuckets::with(&["a", "b"]),
            |mut m| {
                m.barrier = Some(Barrier::new(2));
                m
            },
            NodeConfig::for_node("node-1"),
        );

        // Both mounts must be in flight at once to pass the barrier.
        let both = async {
            tokio::join!(
                h.server.publish_volume(h.publish_req("a", "pa"), Deadline::none()),
                h.server.publish_volume(h.publish_req("b", "pb"), Deadline::none()),
            )
        };
        let (a, b) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("publishes of different volumes serialized");
        a.unwrap();
        b.unwrap();
        assert_eq!(h.mounter.mounts(), 2);
    }

    #[tokio::test]
    async fn unpublish_of_unmounted_target_succeeds() {
        let h = Harness::new(FakeBuckets::with(&[]));
        let target = h.root.join("never-mounted");
        h.server
            .unpublish_volume(
                NodeUnpublishVolumeRequest {
                    volume_id: "bucket".into(),
                    target_path: target.display().to_string(),
                },
                Deadline::none(),
            )
            .await
            .unwrap();
        assert_eq!(h.mounter.calls(), vec![Call::Unmount(target)]);
    }

    #[tokio::test]
    async fn full_lifecycle_unstage_unmounts_staging() {
        let h = Harness::new(FakeBuckets::with(&["bucket"]));
        let stage = h.stage_req("bucket");
        let publish = h.publish_req("bucket", "x");

        h.server.stage_volume(stage.clone(), Deadline::none()).await.unwrap();
        h.server.publish_volume(publish.clone(), Deadline::none()).await.unwrap();
        h.server
            .unpublish_volume(
                NodeUnpublishVolumeRequest {
                    volume_id: "bucket".into(),
                    target_path: publish.target_path.clone(),
                },
                Deadline::none(),
            )
            .await
            .unwrap();
        h.server
            .unstage_volume(
                NodeUnstageVolumeRequest {
                    volume_id: "bucket".into(),
                    staging_target_path: stage.staging_target_path.clone(),
                },
                Deadline::none(),
            )
            .await
            .unwrap();

        let calls = h.mounter.calls();
        assert_eq!(
            calls.last(),
            Some(&Call::Unmount(PathBuf::from(&stage.staging_target_path)))
        );

        // After a full teardown the volume can be staged again.
        h.server.stage_volume(stage, Deadline::none()).await.unwrap();
        let stages = h
            .mounter
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Stage(..)))
            .count();
        assert_eq!(stages, 2);
    }

    #[tokio::test]
    async fn expired_deadline_stops_before_mounting() {
        let h = Harness::new(FakeBuckets::with(&["bucket"]));
        let err = h
            .server
            .publish_volume(h.publish_req("bucket", "x"), Deadline::after(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::DeadlineExceeded(_)));
        assert!(h.mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn slow_bucket_check_is_bounded() {
        let mut buckets = FakeBuckets::with(&["bucket"]);
        buckets.delay = Duration::from_secs(5);
        let config = NodeConfig {
            bucket_check_timeout: Duration::from_millis(50),
            ..NodeConfig::for_node("node-1")
        };
        let h = Harness::build(buckets, |m| m, config);

        let err = h
            .server
            .stage_volume(h.stage_req("bucket"), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::BackendError(ref m) if m.contains("timed out")));
        assert!(h.mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn backend_error_is_passed_through_unchanged() {
        let mut buckets = FakeBuckets::with(&["bucket"]);
        buckets.failure = Some(CsiError::BackendError(
            "check bucket bucket: connection refused".into(),
        ));
        let h = Harness::new(buckets);

        let err = h
            .server
            .stage_volume(h.stage_req("bucket"), Deadline::none())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "backend error: check bucket bucket: connection refused"
        );
        assert!(h.mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn capabilities_info_and_expand() {
        let h = Harness::new(FakeBuckets::with(&[]));
        assert_eq!(
            h.server.get_capabilities(),
            vec![NodeServiceCapability::StageUnstageVolume]
        );
        assert_eq!(h.server.get_info().await.unwrap().node_id, "node-1");

        let err = h
            .server
            .expand_volume(NodeExpandVolumeRequest {
                volume_id: "bucket".into(),
                volume_path: "/x".into(),
                required_bytes: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::Unimplemented);
    }
}
