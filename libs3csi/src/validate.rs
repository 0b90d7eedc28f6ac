//! Request field validation.
//!
//! Every node operation runs one of these checks before it touches the
//! filesystem or the network.  The first missing field wins.

use crate::error::CsiError;
use crate::types::{
    NodePublishVolumeRequest, NodeStageVolumeRequest, NodeUnpublishVolumeRequest,
    NodeUnstageVolumeRequest, VolumeCapability, VolumeId,
};

fn require_volume_id(id: &VolumeId) -> Result<(), CsiError> {
    if id.is_empty() {
        return Err(CsiError::InvalidArgument(
            "volume ID missing in request".into(),
        ));
    }
    Ok(())
}

fn require_path(path: &str, field: &str) -> Result<(), CsiError> {
    if path.is_empty() {
        return Err(CsiError::InvalidArgument(format!(
            "{field} missing in request"
        )));
    }
    Ok(())
}

fn require_capability(cap: Option<&VolumeCapability>) -> Result<(), CsiError> {
    if cap.is_none() {
        return Err(CsiError::InvalidArgument(
            "volume capability missing in request".into(),
        ));
    }
    Ok(())
}

pub fn stage(req: &NodeStageVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require_path(&req.staging_target_path, "staging target path")?;
    require_capability(req.volume_capability.as_ref())
}

pub fn publish(req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
    require_capability(req.volume_capability.as_ref())?;
    require_volume_id(&req.volume_id)?;
    require_path(&req.staging_target_path, "staging target path")?;
    require_path(&req.target_path, "target path")
}

pub fn unstage(req: &NodeUnstageVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require_path(&req.staging_target_path, "staging target path")
}

pub fn unpublish(req: &NodeUnpublishVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require_path(&req.target_path, "target path")
}
