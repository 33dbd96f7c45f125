//! `infiniband` device kind — NIC-shaped, but namespaces its volatile
//! interface name under `ib<N>` instead of `eth<N>`.

use crate::error::CoreResult;
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::RunConfig;

pub struct InfinibandDevice;

impl Device for InfinibandDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: true, updatable: false }
    }

    fn validate(&self, _cfg: &DeviceConfig) -> CoreResult<()> {
        Ok(())
    }

    fn start(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig> {
        let mut run = RunConfig::empty();
        if let Some(name) = cfg.get("name") {
            run.nic_directives.push(("link".to_string(), name.clone()));
        }
        let _ = ctx;
        Ok(run)
    }

    fn stop(&self, _cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<()> {
        Ok(())
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "infiniband", factory: || Box::new(InfinibandDevice) }
}
