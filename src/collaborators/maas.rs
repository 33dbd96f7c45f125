//! MAAS record synchronization collaborator: Create syncs MAAS records.
//! Out of scope for this crate's own logic — `NoopMaasClient` is the
//! default for deployments that don't integrate with MAAS.

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::instance::Instance;

#[async_trait]
pub trait MaasClient: Send + Sync {
    async fn sync(&self, instance: &Instance) -> CoreResult<()>;
    async fn release(&self, instance: &Instance) -> CoreResult<()>;
}

pub struct NoopMaasClient;

#[async_trait]
impl MaasClient for NoopMaasClient {
    async fn sync(&self, _instance: &Instance) -> CoreResult<()> {
        Ok(())
    }

    async fn release(&self, _instance: &Instance) -> CoreResult<()> {
        Ok(())
    }
}
