//! Lifecycle Controller.
//!
//! Owns the per-instance operation lock and drives Create/Start/Stop/
//! Shutdown/Restart/Freeze/Unfreeze/Restore/Delete/Rename/Update,
//! delegating to config expansion, idmap allocation, device orchestration,
//! the hook handler, the live injector, the rootfs remapper, and the
//! external collaborators for everything that isn't pure orchestration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::collaborators::{
    DevlxdEvent, DevlxdEventKind, DevlxdEventQueue, EventSink, LifecycleEvent, LifecycleEventKind, MaasClient, MigrationService, ProfileGenerator, StoragePool,
};
use crate::config;
use crate::device::{DeviceOrchestrator, RunConfig};
use crate::error::{CoreError, CoreResult, OperationAction};
use crate::hooks::{HookHandler, HookTarget};
use crate::idmap::{self, HostIdClaim, IdmapAllocator};
use crate::instance::{DEVICE_TYPE_KEY, DeviceConfig, Instance, Profile};
use crate::persistence::{InstanceStore, VolatileWriter};
use crate::runtime_config::{self, BuildInput, LogLevel};
use crate::runtime_trait::Runtime;

use super::operation_lock::{Acquired, OperationLock};
use super::runtime_factory::RuntimeFactory;
use super::state::InstanceState;

/// The host's delegated sub-id range, everything else being a per-instance
/// slice of it.
const DELEGATED_BASE: u32 = 1_000_000;
const DELEGATED_SIZE: u32 = 1 << 30;
const DEFAULT_IDMAP_SIZE: u32 = 65536;

pub struct LifecycleController<S> {
    store: Arc<S>,
    volatile: Arc<dyn VolatileWriter>,
    devices: Arc<DeviceOrchestrator<S>>,
    idmap_allocator: Arc<IdmapAllocator>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    storage: Arc<dyn StoragePool>,
    profiles: Arc<dyn ProfileGenerator>,
    events: Arc<dyn EventSink>,
    maas: Arc<dyn MaasClient>,
    migration: Arc<dyn MigrationService>,
    hooks: Arc<HookHandler<S>>,
    devlxd: Arc<dyn DevlxdEventQueue>,

    /// Root of the per-instance state tree (`<state_dir>/<name>/{rootfs,devices,shmounts,config}`).
    state_dir: PathBuf,

    locks: parking_lot::Mutex<HashMap<u64, Arc<OperationLock>>>,
    runtimes: parking_lot::Mutex<HashMap<u64, Arc<dyn Runtime>>>,
}

#[allow(clippy::too_many_arguments)]
impl<S: InstanceStore + 'static> LifecycleController<S> {
    pub fn new(
        store: Arc<S>,
        volatile: Arc<dyn VolatileWriter>,
        devices: Arc<DeviceOrchestrator<S>>,
        idmap_allocator: Arc<IdmapAllocator>,
        runtime_factory: Arc<dyn RuntimeFactory>,
        storage: Arc<dyn StoragePool>,
        profiles: Arc<dyn ProfileGenerator>,
        events: Arc<dyn EventSink>,
        maas: Arc<dyn MaasClient>,
        migration: Arc<dyn MigrationService>,
        hooks: Arc<HookHandler<S>>,
        devlxd: Arc<dyn DevlxdEventQueue>,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            volatile,
            devices,
            idmap_allocator,
            runtime_factory,
            storage,
            profiles,
            events,
            maas,
            migration,
            hooks,
            devlxd,
            state_dir,
            locks: parking_lot::Mutex::new(HashMap::new()),
            runtimes: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Double-checked-locking lookup of this instance's operation lock,
    /// mirroring `litebox/lifecycle.rs`'s `ensure_ready`.
    fn lock_for(&self, instance_id: u64) -> Arc<OperationLock> {
        if let Some(lock) = self.locks.lock().get(&instance_id) {
            return lock.clone();
        }
        let mut locks = self.locks.lock();
        locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(OperationLock::new()))
            .clone()
    }

    /// The runtime handle for this instance, rebuilding it if none is
    /// cached. Single-owner: any rebuild releases the previous handle
    /// first.
    async fn runtime_for(&self, instance: &Instance) -> CoreResult<Arc<dyn Runtime>> {
        if crate::hooks::current_hook_context().from_hook {
            return Err(CoreError::MonitorUnresponsive);
        }
        if let Some(runtime) = self.runtimes.lock().get(&instance.id).cloned() {
            return Ok(runtime);
        }
        let runtime = self.runtime_factory.build(instance)?;
        self.runtimes.lock().insert(instance.id, runtime.clone());
        Ok(runtime)
    }

    fn instance_state(&self, instance: &Instance) -> InstanceState {
        match instance.config().get("volatile.power_state").map(String::as_str) {
            Some("RUNNING") => InstanceState::Running,
            Some("FROZEN") => InstanceState::Frozen,
            _ => InstanceState::Stopped,
        }
    }

    fn instance_path(&self, instance: &Instance) -> PathBuf {
        self.state_dir.join(&instance.name)
    }

    fn validate(&self, instance: &Instance) -> CoreResult<()> {
        if let Some(raw) = instance.config().get("limits.memory") {
            let hard = runtime_config::parse_memory_size(raw, total_host_memory())?;
            if hard == 0 {
                return Err(CoreError::InvalidConfig(format!("limits.memory resolves to a 0-byte hard limit: {raw}")));
            }
        }
        if instance.config().get("limits.memory.swap.priority").is_some() {
            let priority: u8 = instance
                .config()
                .get("limits.memory.swap.priority")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| CoreError::InvalidConfig("limits.memory.swap.priority must be an integer".into()))?;
            if priority > 10 {
                return Err(CoreError::InvalidConfig("limits.memory.swap.priority must be 0-10".into()));
            }
        }
        for (name, cfg) in instance.devices() {
            if !cfg.contains_key(crate::instance::DEVICE_TYPE_KEY) {
                return Err(CoreError::InvalidDevices(format!("device {name} missing type")));
            }
        }
        if instance.config().get("nvidia.runtime").map(|v| v == "true").unwrap_or(false) {
            runtime_config::nvidia_preflight()?;
        }
        Ok(())
    }

    // ---- Create ----------------------------------------------------

    pub async fn create(&self, instance_id: u64, available_profiles: &[Profile]) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Create, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };

        let result = self.do_create(instance_id, available_profiles).await;
        if let Err(err) = &result {
            warn!(instance_id, error = %err, "create failed, unwinding via delete");
            if let Err(delete_err) = self.do_delete(instance_id, true).await {
                warn!(instance_id, error = %delete_err, "unwind delete also failed");
            }
        }
        guard.complete(&result);
        result
    }

    async fn do_create(&self, instance_id: u64, available_profiles: &[Profile]) -> CoreResult<()> {
        let mut instance = self.store.get(instance_id)?;
        config::expand(&mut instance, available_profiles)?;
        self.validate(&instance)?;

        self.storage.create_volume(&instance.name).await?;
        std::fs::create_dir_all(self.instance_path(&instance).join("rootfs"))?;

        let privileged = instance.flags().privileged;
        let isolated = instance.config().get("security.idmap.isolated").map(|v| v == "true").unwrap_or(true);
        let explicit_base = instance.config().get("security.idmap.base").and_then(|v| v.parse().ok());
        let size: u32 = instance
            .config()
            .get("security.idmap.size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_IDMAP_SIZE);
        let raw_idmap = instance.config().get("raw.idmap").cloned();

        let committed: Vec<HostIdClaim> = self.store.isolated_claims(instance_id)?;
        let next_idmap = idmap::resolve(
            &self.idmap_allocator,
            privileged,
            isolated,
            DELEGATED_BASE,
            DELEGATED_SIZE,
            size,
            &committed,
            explicit_base,
            raw_idmap.as_deref(),
        )?;

        self.volatile.set(instance_id, "volatile.idmap.next", serde_json::to_string(&next_idmap.0).map_err(|e| CoreError::Internal(e.to_string()))?)?;
        if let Some(base) = next_idmap.0.first().map(|e| e.hostid) {
            self.volatile.set(instance_id, "volatile.idmap.base", base.to_string())?;
        }
        self.volatile.set(instance_id, "volatile.last_state.idmap", "[]".to_string())?;

        let mut instance = self.store.get(instance_id)?;
        config::expand(&mut instance, available_profiles)?;

        let devices = instance.devices().clone();
        for (name, cfg) in devices {
            self.devices.add(instance_id, &name, cfg, false)?;
        }

        self.maas.sync(&instance).await?;
        self.events
            .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Created })
            .await?;
        Ok(())
    }

    // ---- Start -------------------------------------------------------

    pub async fn start(&self, instance_id: u64, stateful: bool) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Start, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };
        let result = self.start_locked(instance_id, stateful).await;
        guard.complete(&result);
        result
    }

    /// Assumes the caller already holds this instance's operation lock
    /// (used directly by `Restart`, which reuses a single `restart` guard
    /// across both phases instead of acquiring `Start`'s own lock).
    async fn start_locked(&self, instance_id: u64, stateful: bool) -> CoreResult<()> {
        let instance = self.store.get(instance_id)?;
        if self.instance_state(&instance) == InstanceState::Running {
            return Err(CoreError::AlreadyRunning);
        }

        if stateful {
            return self.start_stateful(instance_id, instance).await;
        }

        for module in instance.config().get("linux.kernel_modules").map(|v| v.split(',')).into_iter().flatten() {
            let module = module.trim();
            if !module.is_empty() {
                tracing::debug!(module, "loading kernel module");
            }
        }

        let next_idmap = instance
            .config()
            .get("volatile.idmap.next")
            .map(|raw| serde_json::from_str::<Vec<crate::idmap::IdEntry>>(raw))
            .transpose()
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .map(crate::idmap::Idmap)
            .unwrap_or_else(crate::idmap::Idmap::empty);
        let disk_idmap = instance
            .config()
            .get("volatile.last_state.idmap")
            .map(|raw| serde_json::from_str::<Vec<crate::idmap::IdEntry>>(raw))
            .transpose()
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .map(crate::idmap::Idmap);

        let instance_path = self.instance_path(&instance);
        let rootfs_path = instance_path.join("rootfs");
        let shift_protected = instance.config().get("security.protection.shift").map(|v| v == "true").unwrap_or(false);
        let storage_supports_idmapped_mount = false;
        let is_btrfs = false;

        if disk_idmap.as_ref() != Some(&next_idmap) {
            let new_disk_idmap = crate::rootfs::remap(
                &rootfs_path,
                disk_idmap.as_ref(),
                &next_idmap,
                shift_protected,
                storage_supports_idmapped_mount,
                is_btrfs,
                &mut |_progress| {},
            )?;
            self.volatile
                .set(instance_id, "volatile.last_state.idmap", serde_json::to_string(&new_disk_idmap.0).map_err(|e| CoreError::Internal(e.to_string()))?)?;
        }
        self.volatile
            .set(instance_id, "volatile.idmap.current", serde_json::to_string(&next_idmap.0).map_err(|e| CoreError::Internal(e.to_string()))?)?;

        if let Some(profile) = self.profiles.apparmor_profile(&instance).await? {
            std::fs::write(&profile.path, &profile.content)?;
        }
        if let Some(profile) = self.profiles.seccomp_profile(&instance).await? {
            std::fs::write(&profile.path, &profile.content)?;
        }

        let devices_dir = instance_path.join("devices");
        let _ = std::fs::remove_dir_all(&devices_dir);

        let volume = self.storage.mount_volume(&instance.name).await?;

        let runtime = self.runtime_for(&instance).await?;
        let host_interfaces: BTreeSet<String> = runtime.interfaces().await?.into_iter().collect();
        let started = self.devices.start_all(instance_id, instance.devices(), &host_interfaces)?;

        let mut run_config = crate::device::RunConfig::empty();
        for (_name, rc) in started {
            run_config = run_config.merge(rc);
        }

        let build_input = self.build_input(&instance, &next_idmap, &volume.mount_path, runtime.api_version());
        let directives = runtime_config::build(&build_input)?;
        for (key, value) in &directives {
            runtime.set_config_item(key, value).await?;
        }
        for (key, value) in &run_config.cgroup_rules {
            let in_userns = instance.config().get("security.privileged").map(|v| v != "true").unwrap_or(true);
            crate::live::add_cgroup_rule(runtime.as_ref(), key, value, in_userns, true).await?;
        }
        for (key, value) in &run_config.nic_directives {
            runtime.set_config_item(key, value).await?;
        }

        let config_path = instance_path.join("config");
        runtime.save_config_file(&config_path).await?;

        chown_instance_path(&instance_path, next_idmap.0.first().map(|e| e.hostid).unwrap_or(0))?;

        runtime.start().await.map_err(|e| {
            CoreError::RuntimeFailed(format!("start failed for {}: {e}", instance.name))
        })?;

        for hook in &run_config.post_start_hooks {
            info!(device = %hook.device, action = %hook.action, "running post-start hook");
        }

        crate::persistence::write_backup(&instance_path.join("backup.yaml"), &instance)?;

        self.hooks.handle_start(instance_id, runtime.clone()).await?;
        self.events
            .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Started })
            .await?;
        Ok(())
    }

    async fn start_stateful(&self, instance_id: u64, instance: Instance) -> CoreResult<()> {
        self.migration.restore(&instance).await?;
        self.volatile.set(instance_id, "volatile.stateful", "false".to_string())?;

        // CRIU restore reconstructs the process tree and namespaces
        // directly; no runtime config rebuild or device Start pass runs.
        let runtime = self.runtime_for(&instance).await?;
        self.hooks.handle_start(instance_id, runtime).await?;
        self.events
            .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Started })
            .await?;
        Ok(())
    }

    fn build_input(&self, instance: &Instance, idmap: &crate::idmap::Idmap, rootfs_path: &Path, runtime_version: (u32, u32)) -> BuildInput {
        let memory = instance
            .config()
            .get("limits.memory")
            .and_then(|v| runtime_config::parse_memory_size(v, total_host_memory()).ok())
            .and_then(|hard| {
                let swap_enabled = instance.config().get("limits.memory.swap").map(|v| v != "false").unwrap_or(true);
                let priority: u8 = instance
                    .config()
                    .get("limits.memory.swap.priority")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                runtime_config::memory_limits(hard, swap_enabled, priority).ok()
            });

        BuildInput {
            log_file: PathBuf::from(format!("/var/log/ctnrd/{}/lxc.log", instance.name)),
            log_level: LogLevel::Info,
            console_log_path: PathBuf::from(format!("/var/log/ctnrd/{}/console.log", instance.name)),
            hostname: instance.name.split('/').next_back().unwrap_or(&instance.name).to_string(),
            privileged: instance.flags().privileged,
            in_userns: !instance.flags().privileged,
            apparmor_stacking_active: false,
            cgroup_unified: true,
            host_supports_devices_controller: true,
            architecture_personality: instance.architecture.clone(),
            instance_ref: instance.name.clone(),
            idmap: idmap.clone(),
            environment: instance
                .config()
                .iter()
                .filter_map(|(k, v)| k.strip_prefix("environment.").map(|k| (k.to_string(), v.clone())))
                .collect(),
            nvidia_runtime: instance.config().get("nvidia.runtime").map(|v| v == "true").unwrap_or(false),
            memory,
            cpu_shares: instance.config().get("limits.cpu.allowance").and_then(|v| v.parse().ok()),
            cpu_period: instance.config().get("limits.cpu.period").and_then(|v| v.parse().ok()),
            cpu_quota: instance.config().get("limits.cpu.quota").and_then(|v| v.parse().ok()),
            blkio_weight: instance
                .config()
                .get("limits.disk.priority")
                .and_then(|v| v.parse().ok())
                .and_then(|p| runtime_config::disk_priority_to_weight(p).ok()),
            pids_max: instance.config().get("limits.processes").and_then(|v| v.parse().ok()),
            hugepages: instance
                .config()
                .iter()
                .filter_map(|(k, v)| k.strip_prefix("limits.hugepages.").map(|size| (size.to_string(), v)))
                .filter_map(|(size, v)| v.parse().ok().map(|limit| (size, limit)))
                .collect(),
            rlimits: instance
                .config()
                .iter()
                .filter_map(|(k, v)| k.strip_prefix("limits.kernel.").map(|name| (name.to_string(), v.clone())))
                .collect(),
            raw_lxc: instance.config().get("raw.lxc").cloned(),
            runtime_version,
            rootfs_path: rootfs_path.to_path_buf(),
        }
    }

    // ---- Stop / Shutdown ----------------------------------------------

    pub async fn stop(&self, instance_id: u64) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Stop, true).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };
        let result = self.stop_locked(instance_id, None).await;
        guard.complete(&result);
        result
    }

    pub async fn shutdown(&self, instance_id: u64, timeout: Duration) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Shutdown, true).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };
        let result = self.stop_locked(instance_id, Some(timeout)).await;
        guard.complete(&result);
        result
    }

    async fn stop_locked(&self, instance_id: u64, shutdown_timeout: Option<Duration>) -> CoreResult<()> {
        let instance = self.store.get(instance_id)?;
        if self.instance_state(&instance) != InstanceState::Running {
            return Err(CoreError::AlreadyStopped);
        }

        let runtime = self.runtime_for(&instance).await?;

        // Fork-bomb mitigation: zero the pids cgroup, falling back to a
        // bounded freeze/unfreeze if the controller isn't available.
        if runtime.set_cgroup_item("pids.max", "0").await.is_err() {
            let frozen = tokio::time::timeout(Duration::from_secs(5), runtime.freeze()).await;
            if frozen.is_ok() {
                let _ = runtime.unfreeze().await;
            }
        }

        match shutdown_timeout {
            Some(timeout) => runtime.shutdown(timeout).await?,
            None => runtime.stop().await?,
        }

        let instance_path = self.instance_path(&instance);
        let target = HookTarget::Stop;
        self.hooks.handle_stopns(instance_id, target, "startfailed").await?;
        let outcome = self.hooks.handle_stop(instance_id, target, &instance_path).await?;

        let final_state = runtime_state_bounded(runtime.as_ref()).await;
        if final_state != crate::runtime_trait::RawState::Stopped {
            return Err(CoreError::RuntimeFailed(format!("expected stopped, runtime reports {final_state:?}")));
        }

        self.events
            .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Stopped })
            .await?;

        if outcome.reboot {
            self.start_locked(instance_id, false).await?;
        } else if outcome.ephemeral {
            self.do_delete(instance_id, true).await?;
        }
        Ok(())
    }

    // ---- Restart -------------------------------------------------------

    pub async fn restart(&self, instance_id: u64, timeout: Duration) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Restart, true).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };

        let result = async {
            self.stop_locked(instance_id, Some(timeout)).await?;
            self.start_locked(instance_id, false).await?;
            self.events
                .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Restarted })
                .await
        }
        .await;

        guard.complete(&result);
        result
    }

    // ---- Freeze / Unfreeze ---------------------------------------------

    pub async fn freeze(&self, instance_id: u64) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Freeze, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };
        let instance = self.store.get(instance_id)?;
        let result = match self.runtime_for(&instance).await {
            Ok(runtime) => match runtime.freeze().await {
                Ok(()) => Ok(()),
                Err(_) => {
                    info!(instance_id, "freezer cgroup unavailable, freeze is a no-op");
                    Ok(())
                }
            },
            Err(e) => Err(e),
        };
        guard.complete(&result);
        result
    }

    pub async fn unfreeze(&self, instance_id: u64) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Unfreeze, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };
        let instance = self.store.get(instance_id)?;
        let result = match self.runtime_for(&instance).await {
            Ok(runtime) => match runtime.unfreeze().await {
                Ok(()) => Ok(()),
                Err(_) => {
                    info!(instance_id, "freezer cgroup unavailable, unfreeze is a no-op");
                    Ok(())
                }
            },
            Err(e) => Err(e),
        };
        guard.complete(&result);
        result
    }

    // ---- Restore ---------------------------------------------------

    pub async fn restore(&self, instance_id: u64, stateful: bool) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Restore, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };

        let result = async {
            let instance = self.store.get(instance_id)?;
            let was_running = self.instance_state(&instance) == InstanceState::Running;
            if was_running {
                self.stop_locked(instance_id, None).await?;
            }

            self.storage.mount_volume(&instance.name).await?;
            if !self.migration.criu_available() {
                return Err(CoreError::CRIUMissing);
            }
            self.migration.restore(&instance).await?;

            let instance_path = self.instance_path(&instance);
            crate::persistence::write_backup(&instance_path.join("backup.yaml"), &instance)?;

            self.events
                .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Restored })
                .await?;

            if was_running {
                self.start_locked(instance_id, stateful).await?;
            }
            Ok(())
        }
        .await;

        guard.complete(&result);
        result
    }

    // ---- Delete ----------------------------------------------------

    pub async fn delete(&self, instance_id: u64, force: bool) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Delete, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };
        let result = self.do_delete(instance_id, force).await;
        guard.complete(&result);
        result
    }

    async fn do_delete(&self, instance_id: u64, force: bool) -> CoreResult<()> {
        let instance = match self.store.get(instance_id) {
            Ok(instance) => instance,
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let protected = instance.config().get("security.protection.delete").map(|v| v == "true").unwrap_or(false);
        if protected && !force {
            return Err(CoreError::ProtectedFromDelete);
        }

        let _ = self.maas.release(&instance).await;

        for name in crate::device::reversed(instance.devices()) {
            let _ = self.devices.remove(instance_id, &name);
        }

        let _ = self.profiles.unload(&instance).await;
        let instance_path = self.instance_path(&instance);
        let _ = std::fs::remove_dir_all(instance_path.join("devices"));
        let _ = std::fs::remove_dir_all(instance_path.join("shmounts"));

        let _ = self.storage.delete_volume(&instance.name).await;
        self.runtimes.lock().remove(&instance_id);
        self.locks.lock().remove(&instance_id);
        self.store.delete(instance_id)?;

        self.events
            .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Deleted })
            .await?;
        Ok(())
    }

    // ---- Rename ------------------------------------------------------

    pub async fn rename(&self, instance_id: u64, new_name: &str) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Rename, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };

        let result = async {
            let mut instance = self.store.get(instance_id)?;
            if self.instance_state(&instance) == InstanceState::Running {
                return Err(CoreError::AlreadyRunning);
            }

            instance.name = new_name.to_string();
            self.store.save(&instance)?;
            self.runtimes.lock().remove(&instance_id);

            self.events
                .publish(LifecycleEvent { instance_id, kind: LifecycleEventKind::Renamed })
                .await
        }
        .await;

        guard.complete(&result);
        result
    }

    // ---- Update ------------------------------------------------------

    pub async fn update(&self, instance_id: u64, new_config: BTreeMap<String, String>, new_devices: BTreeMap<String, DeviceConfig>) -> CoreResult<()> {
        let lock = self.lock_for(instance_id);
        let guard = match lock.acquire(OperationAction::Update, false).await? {
            Acquired::Owner(g) => g,
            Acquired::Joined(r) => return r,
        };

        let previous = match self.store.get(instance_id) {
            Ok(instance) => instance,
            Err(e) => {
                let result: CoreResult<()> = Err(e);
                guard.complete(&result);
                return result;
            }
        };

        let result = self.update_locked(instance_id, &previous, new_config, new_devices).await;
        if result.is_err() {
            if let Err(rollback_err) = self.store.save(&previous) {
                warn!(instance_id, error = %rollback_err, "update rollback save also failed");
            }
        }
        guard.complete(&result);
        result
    }

    async fn update_locked(
        &self,
        instance_id: u64,
        previous: &Instance,
        new_config: BTreeMap<String, String>,
        new_devices: BTreeMap<String, DeviceConfig>,
    ) -> CoreResult<()> {
        let running = self.instance_state(previous) == InstanceState::Running;

        let mut instance = previous.clone();
        instance.local_config = new_config;

        let removed_config_keys: Vec<String> = previous
            .local_config
            .keys()
            .filter(|k| !instance.local_config.contains_key(*k))
            .cloned()
            .collect();
        let local_config_snapshot = instance.local_config.clone();
        if let Some(expanded) = instance.expanded_config.as_mut() {
            expanded.retain(|k, _| !removed_config_keys.contains(k));
            config::fold_config(expanded, &local_config_snapshot);
        }
        self.validate(&instance)?;
        self.store.save(&instance)?;

        let removed_names: Vec<String> = previous.local_devices.keys().filter(|n| !new_devices.contains_key(*n)).cloned().collect();
        let added_names: Vec<String> = new_devices.keys().filter(|n| !previous.local_devices.contains_key(*n)).cloned().collect();
        let common_names: Vec<String> = new_devices.keys().filter(|n| previous.local_devices.contains_key(*n)).cloned().collect();

        let host_interfaces: BTreeSet<String> = if running {
            self.runtime_for(&instance).await?.interfaces().await?.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        let in_userns = !instance.flags().privileged;

        let mut touched_devices: Vec<(String, LifecycleEventKind, DevlxdEventKind)> = Vec::new();

        let removed: BTreeMap<String, DeviceConfig> = removed_names
            .iter()
            .map(|n| (n.clone(), previous.local_devices[n].clone()))
            .collect();
        for name in crate::device::reversed(&removed) {
            let cfg = &removed[&name];
            if running {
                let outcome = self.devices.stop(instance_id, &name, cfg, true, None)?;
                if let Some(detach) = outcome.nic_detach {
                    let runtime = self.runtime_for(&instance).await?;
                    runtime.detach_interface_rename(&detach.requested_name, &detach.requested_name).await?;
                }
            }
            self.devices.remove(instance_id, &name)?;
            touched_devices.push((name, LifecycleEventKind::DeviceRemoved, DevlxdEventKind::DeviceRemoved));
        }

        let added: BTreeMap<String, DeviceConfig> = added_names.iter().map(|n| (n.clone(), new_devices[n].clone())).collect();
        for name in crate::device::sorted(&added) {
            let cfg = added[&name].clone();
            self.devices.add(instance_id, &name, cfg.clone(), running)?;
            if running {
                let runtime = self.runtime_for(&instance).await?;
                let run = self.devices.start(instance_id, &name, &cfg, &host_interfaces)?;
                apply_run_config_live(runtime.as_ref(), &run, in_userns).await?;
            }
            touched_devices.push((name, LifecycleEventKind::DeviceAdded, DevlxdEventKind::DeviceAdded));
        }

        for name in &common_names {
            let old_cfg = previous.local_devices[name].clone();
            let new_cfg = new_devices[name].clone();
            if old_cfg == new_cfg {
                continue;
            }

            let mut changed_keys: BTreeSet<&str> = BTreeSet::new();
            for key in old_cfg.keys().chain(new_cfg.keys()) {
                if old_cfg.get(key) != new_cfg.get(key) {
                    changed_keys.insert(key.as_str());
                }
            }
            let same_kind = old_cfg.get(DEVICE_TYPE_KEY) == new_cfg.get(DEVICE_TYPE_KEY);
            let kind = new_cfg
                .get(DEVICE_TYPE_KEY)
                .ok_or_else(|| CoreError::InvalidDevices(format!("device {name} missing type")))?;
            let device = crate::device::lookup(kind)?;
            let all_updatable = changed_keys.iter().all(|k| device.updatable_fields().contains(k));

            if same_kind && all_updatable && device.capabilities().updatable {
                self.devices.update(instance_id, name, &old_cfg, &new_cfg, running)?;
            } else {
                if running {
                    let outcome = self.devices.stop(instance_id, name, &old_cfg, true, None)?;
                    if let Some(detach) = outcome.nic_detach {
                        let runtime = self.runtime_for(&instance).await?;
                        runtime.detach_interface_rename(&detach.requested_name, &detach.requested_name).await?;
                    }
                }
                self.devices.remove(instance_id, name)?;
                self.devices.add(instance_id, name, new_cfg.clone(), running)?;
                if running {
                    let runtime = self.runtime_for(&instance).await?;
                    let run = self.devices.start(instance_id, name, &new_cfg, &host_interfaces)?;
                    apply_run_config_live(runtime.as_ref(), &run, in_userns).await?;
                }
            }
            touched_devices.push((name.clone(), LifecycleEventKind::DeviceUpdated, DevlxdEventKind::DeviceUpdated));
        }

        // Re-fetch: the device diff above mutated `local_devices` through
        // the orchestrator's own read-modify-write, independently of the
        // config snapshot saved above.
        let mut instance = self.store.get(instance_id)?;
        if let Some(expanded) = instance.expanded_devices.as_mut() {
            for name in &removed_names {
                expanded.remove(name);
            }
            let local_devices_snapshot = instance.local_devices.clone();
            config::fold_devices(expanded, &local_devices_snapshot);
        }
        self.store.save(&instance)?;

        let refresh_idmap = ["security.idmap.isolated", "security.idmap.base", "security.idmap.size", "raw.idmap", "security.privileged"]
            .iter()
            .any(|key| previous.local_config.get(*key) != instance.local_config.get(*key));
        if refresh_idmap {
            tracing::debug!(instance_id, "idmap-relevant config changed, will reshift at next Start");
        }

        if running {
            let apparmor_changed = ["raw.apparmor", "security.nesting"]
                .iter()
                .any(|key| previous.local_config.get(*key) != instance.local_config.get(*key));
            if apparmor_changed {
                if let Some(profile) = self.profiles.apparmor_profile(&instance).await? {
                    std::fs::write(&profile.path, &profile.content)?;
                }
            }

            if limits_config_changed(&previous.local_config, &instance.local_config) {
                let runtime = self.runtime_for(&instance).await?;
                let idmap = current_idmap(&instance)?;
                let instance_path = self.instance_path(&instance);
                let build_input = self.build_input(&instance, &idmap, &instance_path.join("rootfs"), runtime.api_version());
                let directives = runtime_config::build(&build_input)?;
                for (key, value) in &directives {
                    if let Some(raw_key) = key.strip_prefix("lxc.cgroup2.") {
                        crate::live::add_cgroup_rule(runtime.as_ref(), raw_key, value, in_userns, true).await?;
                    }
                }
            }

            let devlxd_was_enabled = previous.local_config.get("security.devlxd").map(|v| v != "false").unwrap_or(true);
            let devlxd_now_enabled = instance.local_config.get("security.devlxd").map(|v| v != "false").unwrap_or(true);
            if devlxd_was_enabled != devlxd_now_enabled {
                let runtime = self.runtime_for(&instance).await?;
                let init_pid = runtime.init_pid().await?;
                let init_pid_fd = runtime.init_pid_fd().await?;
                let instance_path = self.instance_path(&instance);
                if devlxd_now_enabled {
                    crate::live::mount_devlxd_socket(&instance_path, init_pid, init_pid_fd)?;
                } else {
                    crate::live::unmount_devlxd_socket(init_pid)?;
                }
            }
        }

        let user_keys_changed = previous
            .local_config
            .iter()
            .chain(instance.local_config.iter())
            .any(|(k, _)| k.starts_with("user.") && previous.local_config.get(k) != instance.local_config.get(k));
        if user_keys_changed {
            self.devlxd
                .push(instance_id, DevlxdEvent { kind: DevlxdEventKind::ConfigChanged, name: "user".to_string() })
                .await?;
        }
        for (name, lifecycle_kind, devlxd_kind) in touched_devices {
            self.events.publish(LifecycleEvent { instance_id, kind: lifecycle_kind }).await?;
            self.devlxd.push(instance_id, DevlxdEvent { kind: devlxd_kind, name }).await?;
        }

        if running {
            let instance_path = self.instance_path(&instance);
            crate::persistence::write_backup(&instance_path.join("backup.yaml"), &instance)?;
        }

        Ok(())
    }
}

/// Resource-limit config prefixes whose change requires a live cgroup
/// re-apply rather than waiting for the next Start.
const LIVE_LIMIT_PREFIXES: &[&str] = &["limits.memory", "limits.cpu", "limits.disk.priority", "limits.processes", "limits.hugepages.", "limits.kernel."];

fn limits_config_changed(previous: &BTreeMap<String, String>, updated: &BTreeMap<String, String>) -> bool {
    let relevant = |m: &BTreeMap<String, String>| -> BTreeMap<&str, &str> {
        m.iter()
            .filter(|(k, _)| LIVE_LIMIT_PREFIXES.iter().any(|p| k.starts_with(p)))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    };
    relevant(previous) != relevant(updated)
}

fn current_idmap(instance: &Instance) -> CoreResult<crate::idmap::Idmap> {
    instance
        .config()
        .get("volatile.idmap.current")
        .map(|raw| serde_json::from_str::<Vec<crate::idmap::IdEntry>>(raw))
        .transpose()
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .map(crate::idmap::Idmap)
        .ok_or_else(|| CoreError::Internal("instance has no current idmap recorded".to_string()))
}

/// Apply a just-started device's live-only contributions (cgroup rules, a
/// hot-attached NIC link) into a running container. Mounts and NIC
/// config-file directives that only take effect at the runtime's own Start
/// are not replayed here — a device hot-added to a running instance never
/// goes through that path at all.
async fn apply_run_config_live(runtime: &dyn Runtime, run: &RunConfig, in_userns: bool) -> CoreResult<()> {
    for (key, value) in &run.cgroup_rules {
        crate::live::add_cgroup_rule(runtime, key, value, in_userns, true).await?;
    }
    if let Some((_, link_name)) = run.nic_directives.iter().find(|(k, _)| k == "link") {
        runtime.attach_interface(link_name, link_name).await?;
    }
    Ok(())
}

fn total_host_memory() -> u64 {
    16u64 * 1024 * 1024 * 1024
}

/// `runtime.state()` talks to the runtime's monitor thread; a wedged
/// monitor must not hang a Stop indefinitely. Times out after 5 seconds
/// and reports `Frozen` — an unresponsive monitor is indistinguishable
/// from a stuck/frozen container from the caller's point of view.
async fn runtime_state_bounded(runtime: &dyn Runtime) -> crate::runtime_trait::RawState {
    match tokio::time::timeout(Duration::from_secs(5), runtime.state()).await {
        Ok(Ok(state)) => state,
        Ok(Err(e)) => {
            warn!(error = %e, "runtime state query failed, reporting frozen");
            crate::runtime_trait::RawState::Frozen
        }
        Err(_) => {
            warn!("runtime state query timed out after 5s, reporting frozen");
            crate::runtime_trait::RawState::Frozen
        }
    }
}

#[cfg(unix)]
fn chown_instance_path(path: &Path, host_uid: u32) -> CoreResult<()> {
    use nix::unistd::{Gid, Uid, chown};
    if !path.exists() {
        return Ok(());
    }
    chown(path, Some(Uid::from_raw(host_uid)), Some(Gid::from_raw(host_uid)))
        .map_err(|e| CoreError::Internal(format!("chown {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn chown_instance_path(_path: &Path, _host_uid: u32) -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoopDevlxdEventQueue, NoopMaasClient, NoopProfileGenerator, StorageVolume, UnsupportedMigrationService, VecEventSink};
    use crate::persistence::{InMemoryInstanceStore, StoreVolatileWriter};
    use crate::runtime_trait::test_support::NoopRuntime;
    use async_trait::async_trait;

    struct InMemoryStorage;

    #[async_trait]
    impl StoragePool for InMemoryStorage {
        async fn create_volume(&self, name: &str) -> CoreResult<StorageVolume> {
            Ok(StorageVolume { name: name.to_string(), mount_path: PathBuf::from("/tmp"), supports_idmapped_mount: false })
        }
        async fn mount_volume(&self, name: &str) -> CoreResult<StorageVolume> {
            self.create_volume(name).await
        }
        async fn unmount_volume(&self, _name: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn delete_volume(&self, _name: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    struct FixedRuntimeFactory(Arc<NoopRuntime>);

    impl RuntimeFactory for FixedRuntimeFactory {
        fn build(&self, _instance: &Instance) -> CoreResult<Arc<dyn Runtime>> {
            Ok(self.0.clone())
        }
    }

    fn controller() -> (Arc<InMemoryInstanceStore>, LifecycleController<InMemoryInstanceStore>, tempfile::TempDir) {
        let state_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryInstanceStore::new());
        let volatile: Arc<dyn VolatileWriter> = Arc::new(StoreVolatileWriter::new(store.clone()));
        let devices = Arc::new(DeviceOrchestrator::new(store.clone(), volatile.clone()));
        let hooks = Arc::new(HookHandler::new(
            store.clone(),
            volatile.clone(),
            devices.clone(),
            Arc::new(InMemoryStorage),
            Arc::new(NoopProfileGenerator),
            Arc::new(VecEventSink::new()),
        ));
        let runtime = Arc::new(NoopRuntime::default());
        let controller = LifecycleController::new(
            store.clone(),
            volatile,
            devices,
            Arc::new(IdmapAllocator::new()),
            Arc::new(FixedRuntimeFactory(runtime)),
            Arc::new(InMemoryStorage),
            Arc::new(NoopProfileGenerator),
            Arc::new(VecEventSink::new()),
            Arc::new(NoopMaasClient),
            Arc::new(UnsupportedMigrationService),
            hooks,
            Arc::new(NoopDevlxdEventQueue),
            state_dir.path().to_path_buf(),
        );
        (store, controller, state_dir)
    }

    #[tokio::test]
    async fn create_then_start_transitions_to_running() {
        let (store, controller, _state_dir) = controller();
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();

        controller.create(1, &[]).await.unwrap();
        controller.start(1, false).await.unwrap();

        let instance = store.get(1).unwrap();
        assert_eq!(instance.local_config.get("volatile.power_state").unwrap(), "RUNNING");
    }

    #[tokio::test]
    async fn starting_an_already_running_instance_fails() {
        let (store, controller, _state_dir) = controller();
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        controller.create(1, &[]).await.unwrap();
        controller.start(1, false).await.unwrap();

        let err = controller.start(1, false).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRunning));
    }

    #[tokio::test]
    async fn stop_requires_a_running_instance() {
        let (store, controller, _state_dir) = controller();
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        controller.create(1, &[]).await.unwrap();

        let err = controller.stop(1).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyStopped));
    }

    #[tokio::test]
    async fn delete_removes_the_instance_record() {
        let (store, controller, _state_dir) = controller();
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        controller.create(1, &[]).await.unwrap();

        controller.delete(1, false).await.unwrap();
        assert!(store.get(1).is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent_on_already_missing_instance() {
        let (_store, controller, _state_dir) = controller();
        controller.delete(42, true).await.unwrap();
    }

    #[tokio::test]
    async fn protected_instance_refuses_delete_without_force() {
        let (store, controller, _state_dir) = controller();
        let mut instance = Instance::new(1, "default/c1", "x86_64");
        instance.local_config.insert("security.protection.delete".into(), "true".into());
        store.save(&instance).unwrap();
        controller.create(1, &[]).await.unwrap();

        let err = controller.delete(1, false).await.unwrap_err();
        assert!(matches!(err, CoreError::ProtectedFromDelete));
    }

    #[tokio::test]
    async fn rename_while_running_is_rejected() {
        let (store, controller, _state_dir) = controller();
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        controller.create(1, &[]).await.unwrap();
        controller.start(1, false).await.unwrap();

        let err = controller.rename(1, "default/c2").await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRunning));
    }

    fn nic_device(name: &str) -> DeviceConfig {
        [("type".to_string(), "nic".to_string()), ("nictype".to_string(), "bridged".to_string()), ("name".to_string(), name.to_string())]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn device_hot_add_while_running_attaches_the_interface() {
        let (store, controller, _state_dir) = controller();
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        controller.create(1, &[]).await.unwrap();
        controller.start(1, false).await.unwrap();

        let new_devices: BTreeMap<String, DeviceConfig> = [("eth0".to_string(), nic_device("eth0"))].into_iter().collect();
        controller.update(1, BTreeMap::new(), new_devices).await.unwrap();

        let instance = store.get(1).unwrap();
        assert!(instance.local_devices.contains_key("eth0"));
        assert_eq!(instance.expanded_devices.as_ref().unwrap().get("eth0").unwrap().get("name").unwrap(), "eth0");
    }

    #[tokio::test]
    async fn device_hot_remove_while_running_detaches_the_interface() {
        let (store, controller, _state_dir) = controller();
        let mut instance = Instance::new(1, "default/c1", "x86_64");
        instance.local_devices.insert("eth0".to_string(), nic_device("eth0"));
        store.save(&instance).unwrap();
        controller.create(1, &[]).await.unwrap();
        controller.start(1, false).await.unwrap();

        controller.update(1, BTreeMap::new(), BTreeMap::new()).await.unwrap();

        let instance = store.get(1).unwrap();
        assert!(!instance.local_devices.contains_key("eth0"));
    }

    #[tokio::test]
    async fn updatable_field_change_does_not_remove_and_readd_the_device() {
        let (store, controller, _state_dir) = controller();
        let mut instance = Instance::new(1, "default/c1", "x86_64");
        instance.local_devices.insert("eth0".to_string(), nic_device("eth0"));
        store.save(&instance).unwrap();
        controller.create(1, &[]).await.unwrap();

        let mut updated = nic_device("eth0");
        updated.insert("limits.ingress".to_string(), "1000".to_string());
        let new_devices: BTreeMap<String, DeviceConfig> = [("eth0".to_string(), updated)].into_iter().collect();

        controller.update(1, BTreeMap::new(), new_devices).await.unwrap();

        let instance = store.get(1).unwrap();
        assert_eq!(instance.local_devices.get("eth0").unwrap().get("limits.ingress").unwrap(), "1000");
    }

    #[tokio::test]
    async fn non_updatable_field_change_falls_back_to_remove_and_readd() {
        let (store, controller, _state_dir) = controller();
        let mut instance = Instance::new(1, "default/c1", "x86_64");
        instance.local_devices.insert("eth0".to_string(), nic_device("eth0"));
        store.save(&instance).unwrap();
        controller.create(1, &[]).await.unwrap();

        let mut updated = nic_device("eth0");
        updated.insert("name".to_string(), "eth1".to_string());
        let new_devices: BTreeMap<String, DeviceConfig> = [("eth0".to_string(), updated)].into_iter().collect();

        controller.update(1, BTreeMap::new(), new_devices).await.unwrap();

        let instance = store.get(1).unwrap();
        assert_eq!(instance.local_devices.get("eth0").unwrap().get("name").unwrap(), "eth1");
    }

    #[tokio::test]
    async fn user_config_change_pushes_a_devlxd_event() {
        let state_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryInstanceStore::new());
        let volatile: Arc<dyn VolatileWriter> = Arc::new(StoreVolatileWriter::new(store.clone()));
        let devices = Arc::new(DeviceOrchestrator::new(store.clone(), volatile.clone()));
        let hooks = Arc::new(HookHandler::new(
            store.clone(),
            volatile.clone(),
            devices.clone(),
            Arc::new(InMemoryStorage),
            Arc::new(NoopProfileGenerator),
            Arc::new(VecEventSink::new()),
        ));
        let runtime = Arc::new(NoopRuntime::default());
        let devlxd = Arc::new(VecDevlxdEventQueue::new());
        let controller = LifecycleController::new(
            store.clone(),
            volatile,
            devices,
            Arc::new(IdmapAllocator::new()),
            Arc::new(FixedRuntimeFactory(runtime)),
            Arc::new(InMemoryStorage),
            Arc::new(NoopProfileGenerator),
            Arc::new(VecEventSink::new()),
            Arc::new(NoopMaasClient),
            Arc::new(UnsupportedMigrationService),
            hooks,
            devlxd.clone(),
            state_dir.path().to_path_buf(),
        );

        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        controller.create(1, &[]).await.unwrap();

        let mut new_config = BTreeMap::new();
        new_config.insert("user.comment".to_string(), "hello".to_string());
        controller.update(1, new_config, BTreeMap::new()).await.unwrap();

        let events = devlxd.drain();
        assert!(events.iter().any(|(id, e)| *id == 1 && e.kind == DevlxdEventKind::ConfigChanged));
    }

    #[tokio::test]
    async fn update_rolls_back_the_store_on_validation_failure() {
        let (store, controller, _state_dir) = controller();
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        controller.create(1, &[]).await.unwrap();

        let mut bad_devices = BTreeMap::new();
        bad_devices.insert("eth0".to_string(), nic_device("eth0"));
        bad_devices.get_mut("eth0").unwrap().insert("nictype".to_string(), "teleport".to_string());

        let err = controller.update(1, BTreeMap::new(), bad_devices).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidDevices(_)));

        let instance = store.get(1).unwrap();
        assert!(!instance.local_devices.contains_key("eth0"));
    }
}
