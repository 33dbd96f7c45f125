//! Device kind registry.
//!
//! Device kinds are `inventory`-registered plugins rather than a hard-coded
//! `match`, so adding a kind is a matter of registering a
//! [`DeviceKindDescriptor`] next to its implementation.

use crate::error::{CoreError, CoreResult};
use crate::instance::DeviceConfig;

use super::run_config::RunConfig;

/// The capability set a device kind supports: which of
/// Add/Start/Update/Stop/Remove/Register it implements, whether it can be
/// hot-plugged, and which config fields route through Update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    pub startable: bool,
    pub can_hot_plug: bool,
    pub updatable: bool,
}

/// Runtime context a device needs to do its job, without granting it
/// ownership of any shared resource — volatile reads/writes go through
/// `StoreVolatileWriter` at the orchestrator layer, not through this trait.
pub struct DeviceContext<'a> {
    pub instance_id: u64,
    pub device_name: &'a str,
    pub running: bool,
    pub netns_path: Option<&'a str>,
}

pub trait Device: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn validate(&self, cfg: &DeviceConfig) -> CoreResult<()>;

    fn start(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<RunConfig>;

    fn stop(&self, cfg: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<()>;

    fn update(&self, old: &DeviceConfig, new: &DeviceConfig, ctx: &DeviceContext) -> CoreResult<()> {
        let _ = (old, new, ctx);
        Ok(())
    }

    /// Config keys that, when changed, are routed through `Update` rather
    /// than Remove+Add.
    fn updatable_fields(&self) -> &'static [&'static str] {
        &[]
    }
}

pub struct DeviceKindDescriptor {
    pub kind: &'static str,
    pub factory: fn() -> Box<dyn Device>,
}

inventory::collect!(DeviceKindDescriptor);

pub fn lookup(kind: &str) -> CoreResult<Box<dyn Device>> {
    inventory::iter::<DeviceKindDescriptor>
        .into_iter()
        .find(|d| d.kind == kind)
        .map(|d| (d.factory)())
        .ok_or_else(|| CoreError::UnsupportedDevType(kind.to_string()))
}
