//! Device orchestration: Add/Start/Stop/Update/Remove across the device
//! map, sort ordering, NIC volatile resolution, and scoped Start rollback.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::instance::{DEVICE_TYPE_KEY, DeviceConfig, volatile_device_prefix};
use crate::persistence::{InstanceStore, VolatileWriter};

use super::nic_alloc::{generate_mac, lowest_free_name, name_prefix};
use super::registry::{self, DeviceContext};
use super::run_config::RunConfig;

const NIC_KINDS: &[&str] = &["nic", "infiniband"];

/// Device fields that get a resolved `volatile.<name>.<field>` entry —
/// the only ones `clear_suffixes` ever needs to touch.
const RESOLVED_VOLATILE_FIELDS: &[&str] = &["hwaddr", "name"];

/// What a device's Stop leaves for the caller to finish: NICs need to be
/// detached from the network namespace under their requested link name,
/// which requires the runtime handle the orchestrator doesn't own.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub nic_detach: Option<NicDetach>,
}

#[derive(Debug, Clone)]
pub struct NicDetach {
    pub requested_name: String,
    pub netns_path: Option<String>,
}

/// Ascending `(mount-path-depth, name)` order — Start iterates this,
/// Stop iterates its reverse.
pub fn sorted(devices: &BTreeMap<String, DeviceConfig>) -> Vec<String> {
    let mut names: Vec<&String> = devices.keys().collect();
    names.sort_by_key(|name| (mount_path_depth(&devices[*name]), (*name).clone()));
    names.into_iter().cloned().collect()
}

pub fn reversed(devices: &BTreeMap<String, DeviceConfig>) -> Vec<String> {
    let mut names = sorted(devices);
    names.reverse();
    names
}

fn mount_path_depth(cfg: &DeviceConfig) -> usize {
    cfg.get("path")
        .map(|p| p.trim_start_matches('/').split('/').filter(|c| !c.is_empty()).count())
        .unwrap_or(0)
}

pub struct DeviceOrchestrator<S> {
    store: Arc<S>,
    volatile: Arc<dyn VolatileWriter>,
    _marker: std::marker::PhantomData<S>,
}

impl<S: InstanceStore> DeviceOrchestrator<S> {
    pub fn new(store: Arc<S>, volatile: Arc<dyn VolatileWriter>) -> Self {
        Self { store, volatile, _marker: std::marker::PhantomData }
    }

    /// `defined -> added`. Idempotent on an already-added device with the
    /// same config.
    pub fn add(&self, instance_id: u64, name: &str, cfg: DeviceConfig, running: bool) -> CoreResult<()> {
        let kind = cfg
            .get(DEVICE_TYPE_KEY)
            .ok_or_else(|| CoreError::InvalidDevices(format!("device {name} missing type")))?;
        let device = registry::lookup(kind)?;

        if running && !device.capabilities().can_hot_plug {
            return Err(CoreError::DeviceCannotHotPlug(name.to_string()));
        }
        device.validate(&cfg)?;

        let mut instance = self.store.get(instance_id)?;
        if instance.local_devices.get(name) == Some(&cfg) {
            debug!(instance_id, device = name, "device add is a no-op, already present");
            return Ok(());
        }

        let previous = instance.local_devices.get(name).cloned();
        let previous_kind = previous.as_ref().and_then(|prev| prev.get(DEVICE_TYPE_KEY).cloned());
        let kind_changed = previous_kind.as_deref().is_some_and(|prev| prev != kind);
        let nic_subtype_changed = !kind_changed
            && kind == "nic"
            && previous.as_ref().and_then(|prev| prev.get("nictype")) != cfg.get("nictype");

        if kind_changed || nic_subtype_changed {
            self.volatile.clear_prefix(instance_id, &volatile_device_prefix(name))?;
        } else if previous.is_some() {
            // Same device, replaced in place: drop only the resolved
            // volatile fields the new config now supplies explicitly, since
            // a stale resolution for a field the new config no longer
            // leaves to us would otherwise linger unused.
            let stale: Vec<&str> = RESOLVED_VOLATILE_FIELDS.iter().copied().filter(|field| cfg.contains_key(*field)).collect();
            if !stale.is_empty() {
                self.volatile.clear_suffixes(instance_id, &volatile_device_prefix(name), &stale)?;
            }
        }

        instance.local_devices.insert(name.to_string(), cfg);
        self.store.save(&instance)?;
        info!(instance_id, device = name, kind, "device added");
        Ok(())
    }

    /// `added -> started` (and, if `running`, onward to `attached-live` —
    /// applying the resulting [`RunConfig`] is the caller's job; the
    /// lifecycle controller owns the runtime handle that mounts/cgroups
    /// get applied through).
    pub fn start(
        &self,
        instance_id: u64,
        name: &str,
        cfg: &DeviceConfig,
        host_interfaces: &BTreeSet<String>,
    ) -> CoreResult<RunConfig> {
        let kind = cfg
            .get(DEVICE_TYPE_KEY)
            .ok_or_else(|| CoreError::InvalidDevices(format!("device {name} missing type")))?;
        let device = registry::lookup(kind)?;

        let effective = if NIC_KINDS.contains(&kind.as_str()) {
            self.resolve_nic_volatile(instance_id, name, kind, cfg, host_interfaces)?
        } else {
            cfg.clone()
        };

        let ctx = DeviceContext { instance_id, device_name: name, running: false, netns_path: None };
        device
            .start(&effective, &ctx)
            .map_err(|e| CoreError::DeviceStartFailed(name.to_string(), e.to_string()))
    }

    /// Resolve `volatile.<name>.hwaddr`/`.name` if missing, merge them into
    /// a config copy under the plain `hwaddr`/`name` keys devices expect.
    fn resolve_nic_volatile(
        &self,
        instance_id: u64,
        name: &str,
        kind: &str,
        cfg: &DeviceConfig,
        host_interfaces: &BTreeSet<String>,
    ) -> CoreResult<DeviceConfig> {
        let mut effective = cfg.clone();

        let hwaddr_key = format!("{}hwaddr", volatile_device_prefix(name));
        let hwaddr = match cfg.get("hwaddr") {
            Some(explicit) if !explicit.is_empty() => explicit.clone(),
            _ => self.volatile.insert_if_absent(instance_id, &hwaddr_key, generate_mac())?,
        };
        effective.insert("hwaddr".to_string(), hwaddr);

        let iface_key = format!("{}name", volatile_device_prefix(name));
        let iface_name = match cfg.get("name") {
            Some(explicit) if !explicit.is_empty() => explicit.clone(),
            _ => {
                let instance = self.store.get(instance_id)?;
                let mut claimed: BTreeSet<String> = host_interfaces.clone();
                for (dev_name, dev_cfg) in &instance.local_devices {
                    if dev_name == name {
                        continue;
                    }
                    if let Some(n) = dev_cfg.get("name") {
                        claimed.insert(n.clone());
                    }
                    let prefix = volatile_device_prefix(dev_name);
                    if let Some(n) = instance.local_config.get(&format!("{prefix}name")) {
                        claimed.insert(n.clone());
                    }
                }
                let candidate = lowest_free_name(name_prefix(kind), &claimed);
                self.volatile.insert_if_absent(instance_id, &iface_key, candidate)?
            }
        };
        effective.insert("name".to_string(), iface_name);

        Ok(effective)
    }

    /// `started|attached-live -> stopped`. Post-stop hooks always run
    /// regardless of `running`, so this never skips the device's `stop`.
    pub fn stop(
        &self,
        instance_id: u64,
        name: &str,
        cfg: &DeviceConfig,
        running: bool,
        netns_path: Option<&str>,
    ) -> CoreResult<StopOutcome> {
        let kind = cfg
            .get(DEVICE_TYPE_KEY)
            .ok_or_else(|| CoreError::InvalidDevices(format!("device {name} missing type")))?;
        let device = registry::lookup(kind)?;

        let ctx = DeviceContext { instance_id, device_name: name, running, netns_path };
        device.stop(cfg, &ctx)?;

        let nic_detach = if NIC_KINDS.contains(&kind.as_str()) {
            cfg.get("name").map(|requested_name| NicDetach {
                requested_name: requested_name.clone(),
                netns_path: netns_path.map(str::to_string),
            })
        } else {
            None
        };

        Ok(StopOutcome { nic_detach })
    }

    pub fn update(
        &self,
        instance_id: u64,
        name: &str,
        old: &DeviceConfig,
        new: &DeviceConfig,
        running: bool,
    ) -> CoreResult<()> {
        let kind = new
            .get(DEVICE_TYPE_KEY)
            .ok_or_else(|| CoreError::InvalidDevices(format!("device {name} missing type")))?;
        let device = registry::lookup(kind)?;
        let ctx = DeviceContext { instance_id, device_name: name, running, netns_path: None };
        device.update(old, new, &ctx)?;

        let mut instance = self.store.get(instance_id)?;
        instance.local_devices.insert(name.to_string(), new.clone());
        self.store.save(&instance)?;
        Ok(())
    }

    /// `stopped -> removed`. Clears every `volatile.<name>.*` key.
    pub fn remove(&self, instance_id: u64, name: &str) -> CoreResult<()> {
        self.volatile.clear_prefix(instance_id, &volatile_device_prefix(name))?;
        let mut instance = self.store.get(instance_id)?;
        instance.local_devices.remove(name);
        self.store.save(&instance)?;
        info!(instance_id, device = name, "device removed");
        Ok(())
    }

    /// Start every device in `Sorted` order, collecting a `RunConfig` per
    /// device. A per-device failure aborts with a scoped rollback: every
    /// device started so far is stopped (`running=false`,
    /// `netns_path="startfailed"`) in reverse order.
    pub fn start_all(
        &self,
        instance_id: u64,
        devices: &BTreeMap<String, DeviceConfig>,
        host_interfaces: &BTreeSet<String>,
    ) -> CoreResult<Vec<(String, RunConfig)>> {
        let order = sorted(devices);
        let mut started = Vec::with_capacity(order.len());

        for name in &order {
            let cfg = &devices[name];
            match self.start(instance_id, name, cfg, host_interfaces) {
                Ok(run) => started.push((name.clone(), run)),
                Err(err) => {
                    warn!(instance_id, device = %name, error = %err, "device start failed, rolling back");
                    for (rolled_back_name, _) in started.iter().rev() {
                        let cfg = &devices[rolled_back_name];
                        if let Err(stop_err) =
                            self.stop(instance_id, rolled_back_name, cfg, false, Some("startfailed"))
                        {
                            warn!(instance_id, device = %rolled_back_name, error = %stop_err, "rollback stop failed");
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::persistence::{InMemoryInstanceStore, StoreVolatileWriter};

    fn setup() -> (Arc<InMemoryInstanceStore>, DeviceOrchestrator<InMemoryInstanceStore>) {
        let store = Arc::new(InMemoryInstanceStore::new());
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        let volatile = Arc::new(StoreVolatileWriter::new(store.clone()));
        let orchestrator = DeviceOrchestrator::new(store.clone(), volatile);
        (store, orchestrator)
    }

    fn nic_cfg(nictype: &str) -> DeviceConfig {
        [
            (DEVICE_TYPE_KEY.to_string(), "nic".to_string()),
            ("nictype".to_string(), nictype.to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn add_is_idempotent() {
        let (_store, orch) = setup();
        orch.add(1, "eth0", nic_cfg("bridged"), false).unwrap();
        orch.add(1, "eth0", nic_cfg("bridged"), false).unwrap();
    }

    #[test]
    fn add_rejects_unknown_type() {
        let (_store, orch) = setup();
        let cfg: DeviceConfig = [(DEVICE_TYPE_KEY.to_string(), "teleporter".to_string())].into_iter().collect();
        assert!(matches!(
            orch.add(1, "d0", cfg, false).unwrap_err(),
            CoreError::UnsupportedDevType(_)
        ));
    }

    #[test]
    fn add_while_running_rejects_non_hotpluggable() {
        let (_store, orch) = setup();
        let cfg: DeviceConfig = [
            (DEVICE_TYPE_KEY.to_string(), "gpu".to_string()),
            ("id".to_string(), "0".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(matches!(
            orch.add(1, "gpu0", cfg, true).unwrap_err(),
            CoreError::DeviceCannotHotPlug(_)
        ));
    }

    #[test]
    fn start_resolves_nic_volatile_name_and_hwaddr() {
        let (_store, orch) = setup();
        orch.add(1, "eth0", nic_cfg("bridged"), false).unwrap();
        let cfg = nic_cfg("bridged");
        let run = orch.start(1, "eth0", &cfg, &BTreeSet::new()).unwrap();
        assert!(run.nic_directives.iter().any(|(k, v)| k == "link" && v == "eth0"));
    }

    #[test]
    fn second_nic_gets_next_free_name() {
        let (store, orch) = setup();
        let mut instance = store.get(1).unwrap();
        instance.local_devices.insert("eth0".to_string(), nic_cfg("bridged"));
        store.save(&instance).unwrap();

        orch.volatile
            .insert_if_absent(1, "volatile.eth0.name", "eth0".to_string())
            .unwrap();

        let cfg = nic_cfg("bridged");
        let run = orch.start(1, "eth1", &cfg, &BTreeSet::new()).unwrap();
        assert!(run.nic_directives.iter().any(|(k, v)| k == "link" && v == "eth1"));
    }

    #[test]
    fn sorted_orders_by_path_depth_then_name() {
        let mut devices = BTreeMap::new();
        devices.insert("b".to_string(), [("path".to_string(), "/a".to_string())].into_iter().collect());
        devices.insert("a".to_string(), [("path".to_string(), "/a/b/c".to_string())].into_iter().collect());
        devices.insert("c".to_string(), DeviceConfig::new());

        let order = sorted(&devices);
        assert_eq!(order, vec!["c".to_string(), "b".to_string(), "a".to_string()]);
        assert_eq!(reversed(&devices), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn remove_clears_volatile_keys() {
        let (store, orch) = setup();
        orch.add(1, "eth0", nic_cfg("bridged"), false).unwrap();
        orch.volatile
            .insert_if_absent(1, "volatile.eth0.hwaddr", "00:16:3e:00:00:01".to_string())
            .unwrap();

        orch.remove(1, "eth0").unwrap();

        let instance = store.get(1).unwrap();
        assert!(!instance.local_devices.contains_key("eth0"));
        assert!(!instance.local_config.contains_key("volatile.eth0.hwaddr"));
    }

    #[test]
    fn add_clears_volatile_on_nic_subtype_change() {
        let (store, orch) = setup();
        orch.add(1, "eth0", nic_cfg("bridged"), false).unwrap();
        orch.volatile
            .insert_if_absent(1, "volatile.eth0.name", "eth0".to_string())
            .unwrap();

        orch.add(1, "eth0", nic_cfg("macvlan"), false).unwrap();

        let instance = store.get(1).unwrap();
        assert!(!instance.local_config.contains_key("volatile.eth0.name"));
    }

    #[test]
    fn add_selectively_clears_volatile_fields_the_new_config_now_sets_explicitly() {
        let (store, orch) = setup();
        orch.add(1, "eth0", nic_cfg("bridged"), false).unwrap();
        orch.volatile
            .insert_if_absent(1, "volatile.eth0.name", "eth0".to_string())
            .unwrap();
        orch.volatile
            .insert_if_absent(1, "volatile.eth0.hwaddr", "00:16:3e:00:00:01".to_string())
            .unwrap();

        let mut replacement = nic_cfg("bridged");
        replacement.insert("name".to_string(), "eth9".to_string());
        orch.add(1, "eth0", replacement, false).unwrap();

        let instance = store.get(1).unwrap();
        assert!(!instance.local_config.contains_key("volatile.eth0.name"));
        assert!(instance.local_config.contains_key("volatile.eth0.hwaddr"));
    }

    #[test]
    fn start_all_rolls_back_on_failure() {
        let (store, orch) = setup();
        let mut devices = BTreeMap::new();
        devices.insert("eth0".to_string(), nic_cfg("bridged"));
        devices.insert(
            "bad".to_string(),
            [(DEVICE_TYPE_KEY.to_string(), "gpu".to_string())].into_iter().collect(),
        );
        let mut instance = store.get(1).unwrap();
        instance.local_devices = devices.clone();
        store.save(&instance).unwrap();

        let err = orch.start_all(1, &devices, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, CoreError::DeviceStartFailed(_, _)));
    }
}
