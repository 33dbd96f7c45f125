//! Config Expander.
//!
//! Merges profile configs/devices with local overrides into
//! `expandedConfig`/`expandedDevices`.

mod expand;

pub use expand::{expand, fold_config, fold_devices};
