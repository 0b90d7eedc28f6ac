//! Node protocol messages transmitted over QUIC.
//!
//! The client sends one [`Envelope`] per bi-directional stream and the
//! server answers with exactly one [`CsiMessage`]: the matching response
//! variant, or [`CsiMessage::Error`] carrying the status code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Code, CsiError};
use crate::node::Deadline;
use crate::types::*;

/// Request frame: a request message plus the caller's time budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Milliseconds the caller is willing to wait; `None` means no deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub message: CsiMessage,
}

impl Envelope {
    pub fn new(message: CsiMessage, timeout: Option<Duration>) -> Self {
        Self {
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            message,
        }
    }

    /// Deadline measured from the moment the frame was received.
    pub fn deadline(&self) -> Deadline {
        match self.timeout_ms {
            Some(ms) => Deadline::after(Duration::from_millis(ms)),
            None => Deadline::none(),
        }
    }
}

/// Top-level message for the node service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// FUSE-mount a bucket at its staging path.
    StageVolume(NodeStageVolumeRequest),
    /// Unmount a staging path.
    UnstageVolume(NodeUnstageVolumeRequest),
    /// Bind-mount a staged bucket into a workload path.
    PublishVolume(NodePublishVolumeRequest),
    /// Remove a workload bind-mount.
    UnpublishVolume(NodeUnpublishVolumeRequest),
    /// Grow a volume; always answered with `Unimplemented`.
    ExpandVolume(NodeExpandVolumeRequest),
    /// Query node service capabilities.
    GetCapabilities,
    /// Query node info.
    GetNodeInfo,

    // ----- Responses -------------------------------------------------------
    /// Node service capabilities.
    Capabilities(Vec<NodeServiceCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),
    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error { code: Code, error: CsiError },
}

impl CsiMessage {
    /// Wrap an error together with its status code.
    pub fn error(error: CsiError) -> Self {
        Self::Error {
            code: error.code(),
            error,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::StageVolume(_)
                | Self::UnstageVolume(_)
                | Self::PublishVolume(_)
                | Self::UnpublishVolume(_)
                | Self::ExpandVolume(_)
                | Self::GetCapabilities
                | Self::GetNodeInfo
        )
    }
}

impl From<Result<(), CsiError>> for CsiMessage {
    fn from(result: Result<(), CsiError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => Self::error(e),
        }
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume(req) => write!(f, "UnstageVolume({})", req.volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume(req) => write!(f, "UnpublishVolume({})", req.volume_id),
            Self::ExpandVolume(req) => write!(f, "ExpandVolume({})", req.volume_id),
            Self::GetCapabilities => f.write_str("GetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::Capabilities(caps) => write!(f, "Capabilities(count={})", caps.len()),
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::Error { code, error } => write!(f, "Error({code:?}: {error})"),
        }
    }
}
