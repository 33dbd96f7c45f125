//! `tpm` device kind: emulated TPM passed through as a char device mount.

use crate::error::CoreResult;
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::{MountEntry, RunConfig, ShiftMode};

pub struct TpmDevice;

impl Device for TpmDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: false, updatable: false }
    }

    fn validate(&self, _cfg: &DeviceConfig) -> CoreResult<()> {
        Ok(())
    }

    fn start(&self, cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<RunConfig> {
        let path = cfg.get("path").cloned().unwrap_or_else(|| "/dev/tpm0".to_string());

        let mut run = RunConfig::empty();
        run.mounts.push(MountEntry {
            host_path: "/dev/tpm0".to_string(),
            target_path: path,
            fstype: "none".to_string(),
            options: vec!["bind".to_string(), "create=file".to_string()],
            shift_mode: ShiftMode::None,
            frequency: None,
            pass_no: 0,
        });
        Ok(run)
    }

    fn stop(&self, _cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<()> {
        Ok(())
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "tpm", factory: || Box::new(TpmDevice) }
}
