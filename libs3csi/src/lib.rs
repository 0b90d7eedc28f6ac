//! # libs3csi: S3 bucket volumes for RK8s nodes
//!
//! `libs3csi` implements the node half of a [Container Storage Interface][csi]
//! plugin that exposes S3-compatible buckets as filesystem volumes.  A bucket
//! is FUSE-mounted once per node at a staging path and then bind-mounted into
//! each workload that uses it.  Requests arrive over QUIC (via [`quinn`])
//! instead of gRPC and follow the RK8s conventions (Tokio async runtime,
//! `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `VolumeId`, capabilities, node requests. |
//! | [`error`] | [`CsiError`] and its status [`Code`]. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`node`] | [`CsiNode`] trait and request [`Deadline`]. |
//! | [`node_server`] | [`NodeServer`], the node service implementation. |
//! | [`validate`] | Required-field checks for each request. |
//! | [`credentials`] | Credential resolution from secrets. |
//! | [`secrets`] | [`SecretStore`] seam and its file-backed implementation. |
//! | [`bucket`] | [`BucketClient`] seam and the S3 implementation. |
//! | [`mounter`] | [`Mounter`] seam and the FUSE backends. |
//! | [`mount_point`] | Mount-table queries used for idempotency. |
//! | [`locks`] | Per-volume serialization. |
//! | [`config`] | [`NodeConfig`] settings. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod bucket;
pub mod config;
pub mod credentials;
pub mod error;
pub mod locks;
pub mod message;
pub mod mount_point;
pub mod mounter;
pub mod node;
pub mod node_server;
pub mod secrets;
pub mod transport;
pub mod types;
pub mod validate;

// Re-export the most commonly used items at crate root for convenience.
pub use bucket::{Bucket, BucketClient, S3BucketClient};
pub use config::NodeConfig;
pub use error::{Code, CsiError};
pub use message::CsiMessage;
pub use mount_point::MountPointChecker;
pub use mounter::{FuseMounter, Mounter, MounterKind};
pub use node::{CsiNode, Deadline};
pub use node_server::NodeServer;
pub use secrets::{FileSecretStore, SecretStore};
pub use types::*;
