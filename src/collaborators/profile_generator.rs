//! AppArmor/seccomp profile-file generation collaborator.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::CoreResult;
use crate::instance::Instance;

#[derive(Debug, Clone)]
pub struct ProfileFile {
    pub path: PathBuf,
    pub content: String,
}

#[async_trait]
pub trait ProfileGenerator: Send + Sync {
    async fn apparmor_profile(&self, instance: &Instance) -> CoreResult<Option<ProfileFile>>;
    async fn seccomp_profile(&self, instance: &Instance) -> CoreResult<Option<ProfileFile>>;

    /// Unload and remove any profile files written for `instance` (the
    /// `stop` hook's cleanup step).
    async fn unload(&self, instance: &Instance) -> CoreResult<()>;
}

/// A generator that produces no profile files — used where the host
/// doesn't want AppArmor/seccomp confinement managed through this path.
pub struct NoopProfileGenerator;

#[async_trait]
impl ProfileGenerator for NoopProfileGenerator {
    async fn apparmor_profile(&self, _instance: &Instance) -> CoreResult<Option<ProfileFile>> {
        Ok(None)
    }

    async fn seccomp_profile(&self, _instance: &Instance) -> CoreResult<Option<ProfileFile>> {
        Ok(None)
    }

    async fn unload(&self, _instance: &Instance) -> CoreResult<()> {
        Ok(())
    }
}
