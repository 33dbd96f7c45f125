//! `proxy` device kind: forwards a host socket/port into the container.
//! The actual forwarder process is started out-of-band by the host (it is
//! outside this crate's boundary); the device only emits the post-start
//! hook that asks for it to be spawned once the container is live.

use crate::error::{CoreError, CoreResult};
use crate::instance::DeviceConfig;

use crate::device::registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor};
use crate::device::run_config::{PostStartHook, RunConfig};

pub struct ProxyDevice;

impl Device for ProxyDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities { startable: true, can_hot_plug: true, updatable: true }
    }

    fn validate(&self, cfg: &DeviceConfig) -> CoreResult<()> {
        if cfg.get("listen").is_none() || cfg.get("connect").is_none() {
            return Err(CoreError::InvalidDevices(
                "proxy device needs both listen and connect addresses".to_string(),
            ));
        }
        Ok(())
    }

    fn start(&self, _cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig> {
        let mut run = RunConfig::empty();
        run.post_start_hooks.push(PostStartHook {
            device: ctx.device_name.to_string(),
            action: "spawn-proxy".to_string(),
        });
        Ok(run)
    }

    fn stop(&self, _cfg: &DeviceConfig, _ctx: &DeviceContext) -> CoreResult<()> {
        Ok(())
    }

    fn updatable_fields(&self) -> &'static [&'static str] {
        &["connect", "listen"]
    }
}

inventory::submit! {
    DeviceKindDescriptor { kind: "proxy", factory: || Box::new(ProxyDevice) }
}
