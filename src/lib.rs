//! Linux container driver core.
//!
//! Wires together config expansion, idmap allocation, runtime
//! config building, device orchestration, the lifecycle
//! controller, the hook handler, the live injector, and the
//! rootfs remapper on top of an external container runtime library
//! this crate only ever holds a trait handle to (`runtime_trait::Runtime`).
//!
//! This crate does not own a database, a storage pool, AppArmor/seccomp
//! profile generation, the cluster event bus, MAAS, or CRIU — each is a
//! trait in [`collaborators`] a host binary wires a real implementation
//! into.

pub mod collaborators;
pub mod config;
pub mod device;
pub mod error;
pub mod helpers;
pub mod hooks;
pub mod idmap;
pub mod instance;
pub mod lifecycle;
pub mod live;
pub mod logging;
pub mod persistence;
pub mod rootfs;
pub mod runtime_config;
pub mod runtime_trait;

pub use error::{CoreError, CoreResult};
