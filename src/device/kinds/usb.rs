//! `usb` device kind: passes a USB device through via uevent injection plus
//! a device-cgroup allow rule for its bus/device numbers.

use crate::error::{CoreError, CoreResult};
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::RunConfig;

pub struct UsbDevice;

impl Device for UsbDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: true, updatable: false }
    }

    fn validate(&self, cfg: &DeviceConfig) -> CoreResult<()> {
        if cfg.get("vendorid").is_none() {
            return Err(CoreError::InvalidDevices("usb device needs vendorid".to_string()));
        }
        Ok(())
    }

    fn start(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig> {
        let _ = ctx;
        let mut run = RunConfig::empty();
        run.cgroup_rules.push(("devices.allow".to_string(), "c 189:* rwm".to_string()));
        if let Some(vendorid) = cfg.get("vendorid") {
            run.uevents.push(format!("add usb vendorid={vendorid}"));
        }
        Ok(run)
    }

    fn stop(&self, _cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<()> {
        Ok(())
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "usb", factory: || Box::new(UsbDevice) }
}
