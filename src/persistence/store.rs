//! Instance persistence collaborator.
//!
//! `InstanceStore` is the trait boundary onto the actual database; this
//! crate ships only [`InMemoryInstanceStore`], the in-process stand-in used
//! by tests and by hosts that haven't wired a real store yet. Real
//! deployments provide their own implementation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::idmap::HostIdClaim;
use crate::instance::Instance;

pub trait InstanceStore: Send + Sync {
    fn get(&self, id: u64) -> CoreResult<Instance>;
    fn save(&self, instance: &Instance) -> CoreResult<()>;
    fn delete(&self, id: u64) -> CoreResult<()>;
    /// Host id claims of every currently-isolated instance, for the idmap
    /// allocator's scan.
    fn isolated_claims(&self, exclude: u64) -> CoreResult<Vec<HostIdClaim>>;
    /// Resolve an instance by its `project/name` reference — the only
    /// identifier the runtime library hands back through a hook invocation.
    fn get_by_name(&self, name: &str) -> CoreResult<Instance>;
}

/// In-memory `InstanceStore`: a single lock guards a cache keyed by id, and
/// every mutation follows the database-first pattern — here there is no
/// separate database, but `save` still fully replaces the cached entry
/// atomically rather than mutating it in place, so a reader never observes a
/// partially-written instance.
#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    inner: Arc<RwLock<HashMap<u64, Instance>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for InMemoryInstanceStore {
    fn get(&self, id: u64) -> CoreResult<Instance> {
        self.inner
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    fn save(&self, instance: &Instance) -> CoreResult<()> {
        tracing::debug!(instance_id = instance.id, "persisting instance");
        self.inner.write().insert(instance.id, instance.clone());
        Ok(())
    }

    fn delete(&self, id: u64) -> CoreResult<()> {
        self.inner.write().remove(&id);
        Ok(())
    }

    fn isolated_claims(&self, exclude: u64) -> CoreResult<Vec<HostIdClaim>> {
        let claims = self
            .inner
            .read()
            .values()
            .filter(|inst| inst.id != exclude && !inst.flags().privileged)
            .filter_map(|inst| {
                let config = inst.config();
                let base: u32 = config.get("volatile.idmap.base")?.parse().ok()?;
                let size: u32 = config.get("security.idmap.size")?.parse().ok()?;
                Some(HostIdClaim { host_id: base, map_range: size })
            })
            .collect();
        Ok(claims)
    }

    fn get_by_name(&self, name: &str) -> CoreResult<Instance> {
        self.inner
            .read()
            .values()
            .find(|inst| inst.name == name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(name.to_string()))
    }
}
