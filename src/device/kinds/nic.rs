//! `nic` device kind.

use crate::error::{CoreError, CoreResult};
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::RunConfig;

pub struct NicDevice;

impl Device for NicDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: true, updatable: true }
    }

    fn validate(&self, cfg: &DeviceConfig) -> CoreResult<()> {
        match cfg.get("nictype").map(String::as_str) {
            Some("bridged") | Some("macvlan") | Some("physical") | Some("routed") => Ok(()),
            Some(other) => Err(CoreError::InvalidDevices(format!("unknown nictype: {other}"))),
            None => Err(CoreError::InvalidDevices("nic device missing nictype".to_string())),
        }
    }

    fn start(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig> {
        // By the time a device's Start runs, the orchestrator has already
        // resolved `hwaddr`/`name` into `cfg` via the volatile insert-or-read
        // path.
        let name = cfg
            .get("name")
            .ok_or_else(|| CoreError::DeviceStartFailed(ctx.device_name.to_string(), "no interface name resolved".to_string()))?;
        let hwaddr = cfg.get("hwaddr").cloned().unwrap_or_default();

        let mut run = RunConfig::empty();
        run.nic_directives.push(("link".to_string(), name.clone()));
        if !hwaddr.is_empty() {
            run.nic_directives.push(("hwaddr".to_string(), hwaddr));
        }
        if let Some(parent) = cfg.get("parent") {
            run.nic_directives.push(("parent".to_string(), parent.clone()));
        }
        Ok(run)
    }

    fn stop(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<()> {
        let _ = (cfg, ctx);
        Ok(())
    }

    fn updatable_fields(&self) -> &'static [&'static str] {
        &["limits.ingress", "limits.egress", "limits.priority"]
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "nic", factory: || Box::new(NicDevice) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx() -> DeviceContext<'static> {
        DeviceContext { instance_id: 1, device_name: "eth0", running: false, netns_path: None }
    }

    #[test]
    fn rejects_unknown_nictype() {
        let mut cfg = BTreeMap::new();
        cfg.insert("nictype".to_string(), "teleport".to_string());
        assert!(NicDevice.validate(&cfg).is_err());
    }

    #[test]
    fn start_emits_link_directive() {
        let mut cfg = BTreeMap::new();
        cfg.insert("name".to_string(), "eth0".to_string());
        cfg.insert("hwaddr".to_string(), "00:16:3e:00:00:01".to_string());
        let run = NicDevice.start(&cfg, &ctx()).unwrap();
        assert!(run.nic_directives.contains(&("link".to_string(), "eth0".to_string())));
    }
}
