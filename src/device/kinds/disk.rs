//! `disk` device kind.

use crate::error::{CoreError, CoreResult};
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::{MountEntry, RunConfig, ShiftMode};

pub struct DiskDevice;

impl Device for DiskDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: true, updatable: true }
    }

    fn validate(&self, cfg: &DeviceConfig) -> CoreResult<()> {
        if cfg.get("path").is_none() && cfg.get("source").is_none() {
            return Err(CoreError::InvalidDevices(
                "disk device needs either path or source".to_string(),
            ));
        }
        Ok(())
    }

    fn start(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig> {
        let source = cfg.get("source").cloned().unwrap_or_default();
        let target = cfg
            .get("path")
            .ok_or_else(|| CoreError::DeviceStartFailed(ctx.device_name.to_string(), "no mount path".to_string()))?;

        let readonly = cfg.get("readonly").map(|v| v == "true").unwrap_or(false);
        let mut options = vec!["bind".to_string()];
        if readonly {
            options.push("ro".to_string());
        }

        let shift_mode = match cfg.get("shift").map(String::as_str) {
            Some("true") => ShiftMode::Dynamic,
            _ => ShiftMode::None,
        };

        let mut run = RunConfig::empty();
        run.mounts.push(MountEntry {
            host_path: source,
            target_path: target.clone(),
            fstype: "none".to_string(),
            options,
            shift_mode,
            frequency: None,
            pass_no: 0,
        });
        Ok(run)
    }

    fn stop(&self, _cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<()> {
        Ok(())
    }

    fn updatable_fields(&self) -> &'static [&'static str] {
        &["limits.read", "limits.write"]
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "disk", factory: || Box::new(DiskDevice) }
}
