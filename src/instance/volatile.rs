//! Volatile config key helpers.
//!
//! Volatile keys (prefix `volatile.`) are persisted but driver-managed —
//! every mutation of such a key must go through the volatile-set path
//! (`persistence::VolatileWriter`), never a direct config map write. This
//! module only has the naming helpers; the actual write path lives in
//! `persistence`.

pub const VOLATILE_PREFIX: &str = "volatile.";

pub fn is_volatile_key(key: &str) -> bool {
    key.starts_with(VOLATILE_PREFIX)
}

/// The key prefix for a device's per-instance volatile state, e.g.
/// `volatile.eth0.` for a device named `eth0`.
pub fn volatile_device_prefix(device_name: &str) -> String {
    format!("{VOLATILE_PREFIX}{device_name}.")
}
