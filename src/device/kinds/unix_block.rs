//! `unix-block` device kind: block-device analogue of `unix-char`.

use crate::error::{CoreError, CoreResult};
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::{MountEntry, RunConfig, ShiftMode};

pub struct UnixBlockDevice;

impl Device for UnixBlockDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: true, updatable: false }
    }

    fn validate(&self, cfg: &DeviceConfig) -> CoreResult<()> {
        if cfg.get("source").is_none() && cfg.get("major").is_none() {
            return Err(CoreError::InvalidDevices(
                "unix-block device needs source path or major/minor".to_string(),
            ));
        }
        Ok(())
    }

    fn start(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig> {
        let source = cfg
            .get("source")
            .ok_or_else(|| CoreError::DeviceStartFailed(ctx.device_name.to_string(), "no source path".to_string()))?;
        let target = cfg.get("path").cloned().unwrap_or_else(|| source.clone());

        let mut run = RunConfig::empty();
        run.mounts.push(MountEntry {
            host_path: source.clone(),
            target_path: target,
            fstype: "none".to_string(),
            options: vec!["bind".to_string(), "create=file".to_string()],
            shift_mode: ShiftMode::None,
            frequency: None,
            pass_no: 0,
        });
        if let (Some(major), Some(minor)) = (cfg.get("major"), cfg.get("minor")) {
            run.cgroup_rules.push(("devices.allow".to_string(), format!("b {major}:{minor} rwm")));
        }
        Ok(run)
    }

    fn stop(&self, _cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<()> {
        Ok(())
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "unix-block", factory: || Box::new(UnixBlockDevice) }
}
