//! Storage pool collaborator: creates/mounts/unmounts the root disk's
//! backing volume. The actual pool implementation (zfs/btrfs/dir/lvm) is
//! outside this crate.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::CoreResult;

#[derive(Debug, Clone)]
pub struct StorageVolume {
    pub name: String,
    pub mount_path: PathBuf,
    /// Whether the pool can present the volume with an idmapped mount
    /// instead of requiring an on-disk rootfs shift.
    pub supports_idmapped_mount: bool,
}

#[async_trait]
pub trait StoragePool: Send + Sync {
    async fn create_volume(&self, instance_name: &str) -> CoreResult<StorageVolume>;
    async fn mount_volume(&self, instance_name: &str) -> CoreResult<StorageVolume>;
    async fn unmount_volume(&self, instance_name: &str) -> CoreResult<()>;
    async fn delete_volume(&self, instance_name: &str) -> CoreResult<()>;
}
