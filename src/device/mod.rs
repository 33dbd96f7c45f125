//! Device Orchestrator.
//!
//! Walks an instance's devices through `defined -> added -> started ->
//! attached-live -> stopped -> removed`, producing the `RunConfig` each
//! device's Start contributes to the runtime config builder.

mod kinds;
mod nic_alloc;
mod orchestrator;
mod registry;
mod run_config;

pub use orchestrator::{DeviceOrchestrator, NicDetach, StopOutcome, reversed, sorted};
pub use registry::{Device, DeviceCapabilities, DeviceContext, DeviceKindDescriptor, lookup};
pub use run_config::{GpuDescriptor, MountEntry, PostStartHook, RootfsDescriptor, RunConfig, ShiftMode};
