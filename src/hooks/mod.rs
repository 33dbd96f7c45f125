//! Hook Handler.
//!
//! Dispatches the runtime's `start`/`stopns`/`stop` hook invocations.
//! In this crate's in-process model the lifecycle
//! controller calls straight into this handler rather than across the
//! `callhook` re-exec boundary the real runtime uses — the re-exec itself
//! is the host binary's job (`helpers::dispatch`), not this crate's.

mod socket;
mod target;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use crate::collaborators::{EventSink, ProfileGenerator, StoragePool};
use crate::device::DeviceOrchestrator;
use crate::error::CoreResult;
use crate::persistence::{InstanceStore, VolatileWriter};
use crate::runtime_trait::Runtime;

pub use socket::{SOCKET_NAME, serve, socket_path};
pub use target::HookTarget;

/// Set while a hook handler is executing. Any runtime-handle call made
/// while this is true must fail fast with `MonitorUnresponsive` instead of
/// blocking — the runtime's own monitor thread is what invoked the hook,
/// so waiting on it here would deadlock.
#[derive(Debug, Clone, Copy)]
pub struct HookContext {
    pub from_hook: bool,
}

impl HookContext {
    pub const ACTIVE: HookContext = HookContext { from_hook: true };
    const INACTIVE: HookContext = HookContext { from_hook: false };
}

tokio::task_local! {
    static HOOK_CONTEXT: HookContext;
}

/// The ambient `HookContext` of the task currently running, or inactive if
/// it isn't nested inside a hook dispatch at all. Work spawned off via
/// `tokio::spawn` starts a fresh task and doesn't inherit this, which is
/// exactly how deferred post-hook work (e.g. network priority application)
/// is allowed to call back into the runtime.
pub fn current_hook_context() -> HookContext {
    HOOK_CONTEXT.try_with(|ctx| *ctx).unwrap_or(HookContext::INACTIVE)
}

pub(crate) async fn run_as_hook<F: std::future::Future>(fut: F) -> F::Output {
    HOOK_CONTEXT.scope(HookContext::ACTIVE, fut).await
}

/// What `stop`'s background cleanup decided the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopHookOutcome {
    pub reboot: bool,
    pub ephemeral: bool,
}

pub struct HookHandler<S> {
    store: Arc<S>,
    volatile: Arc<dyn VolatileWriter>,
    devices: Arc<DeviceOrchestrator<S>>,
    storage: Arc<dyn StoragePool>,
    profiles: Arc<dyn ProfileGenerator>,
    events: Arc<dyn EventSink>,
}

impl<S: InstanceStore> HookHandler<S> {
    pub fn new(
        store: Arc<S>,
        volatile: Arc<dyn VolatileWriter>,
        devices: Arc<DeviceOrchestrator<S>>,
        storage: Arc<dyn StoragePool>,
        profiles: Arc<dyn ProfileGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { store, volatile, devices, storage, profiles, events }
    }

    /// `start`: load AppArmor/templated files are the profile collaborator's
    /// job at Start time already; this records the power state and kicks
    /// off the network-priority application, which must happen after the
    /// hook itself returns — `runtime` is only used from the detached task
    /// below, never from this synchronous body, since the runtime's own
    /// monitor thread is blocked on this hook returning.
    pub async fn handle_start(&self, instance_id: u64, runtime: Arc<dyn Runtime>) -> CoreResult<()> {
        run_as_hook(async {
            self.volatile.set(instance_id, "volatile.power_state", "RUNNING".to_string())?;

            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = apply_network_priority(instance_id, &store, runtime.as_ref()).await {
                    tracing::warn!(instance_id, error = %e, "failed to apply network priority");
                }
            });

            tracing::info!(instance_id, "start hook complete");
            Ok(())
        })
        .await
    }

    /// `stopns`: detach every NIC/infiniband device from the (already
    /// mount-namespace-torn-down, still net-namespace-open) container back
    /// to the host, in reverse Start order.
    pub async fn handle_stopns(&self, instance_id: u64, target: HookTarget, netns_path: &str) -> CoreResult<()> {
        run_as_hook(async {
            let _ = target;
            let instance = self.store.get(instance_id)?;
            for name in crate::device::reversed(instance.devices()) {
                let cfg = &instance.devices()[&name];
                let kind = cfg.get("type").map(String::as_str).unwrap_or_default();
                if kind != "nic" && kind != "infiniband" {
                    continue;
                }
                self.devices.stop(instance_id, &name, cfg, false, Some(netns_path))?;
            }
            Ok(())
        })
        .await
    }

    /// `stop`: record the power state, then the background cleanup the
    /// spec describes — stop every remaining device, chown the instance
    /// path back to root, unmount storage, and unload AppArmor. Returns
    /// what the caller (the lifecycle controller's Stop/Shutdown) should
    /// do next.
    pub async fn handle_stop(
        &self,
        instance_id: u64,
        target: HookTarget,
        instance_path: &Path,
    ) -> CoreResult<StopHookOutcome> {
        run_as_hook(async {
            self.volatile.set(instance_id, "volatile.power_state", "STOPPED".to_string())?;

            let instance = self.store.get(instance_id)?;
            for name in crate::device::reversed(instance.devices()) {
                let cfg = &instance.devices()[&name];
                let kind = cfg.get("type").map(String::as_str).unwrap_or_default();
                if kind == "nic" || kind == "infiniband" {
                    continue; // already handled by stopns
                }
                self.devices.stop(instance_id, &name, cfg, false, None)?;
            }

            chown_to_root(instance_path)?;
            self.storage.unmount_volume(&instance.name).await?;
            self.profiles.unload(&instance).await?;
            remove_device_nodes(instance_path);

            let flags = instance.flags();
            tracing::info!(instance_id, reboot = target.is_reboot(), ephemeral = flags.ephemeral, "stop hook complete");
            Ok(StopHookOutcome { reboot: target.is_reboot(), ephemeral: flags.ephemeral })
        })
        .await
    }
}

/// Reads `limits.network.priority` and writes it into every NIC device's
/// `net_prio.ifpriomap` entry. Runs detached from the hook dispatch that
/// triggered it, since the NIC devices aren't guaranteed to exist inside
/// the namespace until after `start` has already returned control to the
/// runtime.
async fn apply_network_priority<S: InstanceStore>(instance_id: u64, store: &Arc<S>, runtime: &dyn Runtime) -> CoreResult<()> {
    let instance = store.get(instance_id)?;
    let Some(priority) = instance.config().get("limits.network.priority") else {
        return Ok(());
    };
    let priority: u8 = priority
        .parse()
        .map_err(|_| crate::error::CoreError::InvalidConfig("limits.network.priority must be an integer".to_string()))?;

    for (name, cfg) in instance.devices() {
        let kind = cfg.get(crate::instance::DEVICE_TYPE_KEY).map(String::as_str).unwrap_or_default();
        if kind != "nic" && kind != "infiniband" {
            continue;
        }
        let prefix = crate::instance::volatile_device_prefix(name);
        let Some(iface) = cfg.get("name").cloned().or_else(|| instance.local_config.get(&format!("{prefix}name")).cloned()) else {
            continue;
        };
        runtime.set_cgroup_item("net_prio.ifpriomap", &format!("{iface} {priority}")).await?;
    }
    Ok(())
}

#[cfg(unix)]
fn chown_to_root(path: &Path) -> CoreResult<()> {
    use nix::unistd::{Gid, Uid, chown};

    if !path.exists() {
        return Ok(());
    }
    chown(path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
        .map_err(|e| crate::error::CoreError::Internal(format!("chown {}: {e}", path.display())))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o100))
        .map_err(crate::error::CoreError::Io)?;
    Ok(())
}

#[cfg(not(unix))]
fn chown_to_root(_path: &Path) -> CoreResult<()> {
    Ok(())
}

fn remove_device_nodes(instance_path: &Path) {
    let devices_dir = instance_path.join("devices");
    if devices_dir.exists() {
        let _ = std::fs::remove_dir_all(&devices_dir);
    }
    let shmounts_dir = instance_path.join("shmounts");
    if shmounts_dir.exists() {
        let _ = std::fs::remove_dir_all(&shmounts_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoopMaasClient, NoopProfileGenerator, VecEventSink};
    use crate::instance::{DEVICE_TYPE_KEY, Instance};
    use crate::persistence::{InMemoryInstanceStore, StoreVolatileWriter};
    use crate::runtime_trait::test_support::NoopRuntime;
    use std::collections::BTreeMap;

    struct NoopStorage;

    #[async_trait::async_trait]
    impl crate::collaborators::StoragePool for NoopStorage {
        async fn create_volume(&self, _name: &str) -> CoreResult<crate::collaborators::StorageVolume> {
            unimplemented!()
        }
        async fn mount_volume(&self, _name: &str) -> CoreResult<crate::collaborators::StorageVolume> {
            unimplemented!()
        }
        async fn unmount_volume(&self, _name: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn delete_volume(&self, _name: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    fn handler() -> HookHandler<InMemoryInstanceStore> {
        let store = Arc::new(InMemoryInstanceStore::new());
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        let volatile = Arc::new(StoreVolatileWriter::new(store.clone()));
        let devices = Arc::new(DeviceOrchestrator::new(store.clone(), volatile.clone()));
        HookHandler::new(
            store,
            volatile,
            devices,
            Arc::new(NoopStorage),
            Arc::new(NoopProfileGenerator),
            Arc::new(VecEventSink::new()),
        )
    }

    #[tokio::test]
    async fn start_hook_records_running_power_state() {
        let h = handler();
        h.handle_start(1, Arc::new(NoopRuntime::default())).await.unwrap();
        let instance = h.store.get(1).unwrap();
        assert_eq!(instance.local_config.get("volatile.power_state").unwrap(), "RUNNING");
    }

    #[tokio::test]
    async fn start_hook_applies_network_priority_to_nic_devices_in_background() {
        let h = handler();
        let mut instance = h.store.get(1).unwrap();
        let mut cfg = BTreeMap::new();
        cfg.insert(DEVICE_TYPE_KEY.to_string(), "nic".to_string());
        cfg.insert("name".to_string(), "eth0".to_string());
        instance.local_devices.insert("eth0".to_string(), cfg);
        instance.local_config.insert("limits.network.priority".to_string(), "5".to_string());
        h.store.save(&instance).unwrap();

        let runtime = Arc::new(NoopRuntime::default());
        h.handle_start(1, runtime.clone()).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(runtime.cgroup_items.lock().get("net_prio.ifpriomap").map(String::as_str), Some("eth0 5"));
    }

    #[tokio::test]
    async fn runtime_calls_fail_fast_while_a_hook_is_active() {
        assert!(!current_hook_context().from_hook);
        let observed = run_as_hook(async { current_hook_context().from_hook }).await;
        assert!(observed);
        assert!(!current_hook_context().from_hook);
    }

    #[tokio::test]
    async fn stop_hook_skips_nic_devices_already_handled_by_stopns() {
        let h = handler();
        let mut instance = h.store.get(1).unwrap();
        let mut cfg = BTreeMap::new();
        cfg.insert(DEVICE_TYPE_KEY.to_string(), "nic".to_string());
        instance.local_devices.insert("eth0".to_string(), cfg);
        h.store.save(&instance).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let outcome = h.handle_stop(1, HookTarget::Stop, dir.path()).await.unwrap();
        assert!(!outcome.reboot);
    }

    #[tokio::test]
    async fn reboot_target_is_reported_back_to_caller() {
        let h = handler();
        let dir = tempfile::tempdir().unwrap();
        let outcome = h.handle_stop(1, HookTarget::Reboot, dir.path()).await.unwrap();
        assert!(outcome.reboot);
    }
}
