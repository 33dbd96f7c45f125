//! `gpu` device kind.

use crate::error::{CoreError, CoreResult};
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::{GpuDescriptor, RunConfig};

pub struct GpuDevice;

impl Device for GpuDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: false, updatable: false }
    }

    fn validate(&self, cfg: &DeviceConfig) -> CoreResult<()> {
        if cfg.get("id").is_none() && cfg.get("pci").is_none() {
            return Err(CoreError::InvalidDevices(
                "gpu device needs id or pci selector".to_string(),
            ));
        }
        Ok(())
    }

    fn start(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig> {
        let major: u32 = cfg
            .get("major")
            .ok_or_else(|| CoreError::DeviceStartFailed(ctx.device_name.to_string(), "no major number".to_string()))?
            .parse()
            .map_err(|_| CoreError::InvalidDevices("gpu major is not a number".to_string()))?;
        let minor: u32 = cfg
            .get("minor")
            .ok_or_else(|| CoreError::DeviceStartFailed(ctx.device_name.to_string(), "no minor number".to_string()))?
            .parse()
            .map_err(|_| CoreError::InvalidDevices("gpu minor is not a number".to_string()))?;

        let mut run = RunConfig::empty();
        run.gpus.push(GpuDescriptor {
            path: cfg.get("source").cloned().unwrap_or_default(),
            major,
            minor,
        });
        run.cgroup_rules.push(("devices.allow".to_string(), format!("c {major}:{minor} rwm")));
        Ok(run)
    }

    fn stop(&self, _cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<()> {
        Ok(())
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "gpu", factory: || Box::new(GpuDevice) }
}
