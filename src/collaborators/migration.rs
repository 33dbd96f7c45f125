//! CRIU-backed migration collaborator for the lifecycle Restore transition.

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};
use crate::instance::Instance;

#[async_trait]
pub trait MigrationService: Send + Sync {
    async fn dump(&self, instance: &Instance) -> CoreResult<()>;
    async fn restore(&self, instance: &Instance) -> CoreResult<()>;
    fn criu_available(&self) -> bool;
}

/// Default when no CRIU-backed service is wired in; every call fails with
/// `CRIUMissing` rather than silently no-opping, since a Restore that
/// silently succeeded without actually restoring state would be worse than
/// an explicit error.
pub struct UnsupportedMigrationService;

#[async_trait]
impl MigrationService for UnsupportedMigrationService {
    async fn dump(&self, _instance: &Instance) -> CoreResult<()> {
        Err(CoreError::CRIUMissing)
    }

    async fn restore(&self, _instance: &Instance) -> CoreResult<()> {
        Err(CoreError::CRIUMissing)
    }

    fn criu_available(&self) -> bool {
        false
    }
}
