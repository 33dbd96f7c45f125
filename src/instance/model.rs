//! Instance aggregate root.
//!
//! Keeps config and devices as fields directly on `Instance` rather than
//! splitting them into a separate state struct, since the profile
//! expansion pipeline needs config and devices together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single device's raw config, keyed like the instance config map.
///
/// `type` is required and is read out of the map by device-kind lookup
/// rather than promoted to its own field: device config is itself a plain
/// string→string mapping with a required `type` entry.
pub type DeviceConfig = BTreeMap<String, String>;

pub const DEVICE_TYPE_KEY: &str = "type";

/// Derived instance flags, recomputed from config rather than stored
/// independently so they can never drift from the config that implies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceFlags {
    pub ephemeral: bool,
    pub snapshot: bool,
    pub stateful: bool,
    pub privileged: bool,
    pub nesting: bool,
}

/// Profile configs/devices as the expander receives them — keyed by name so
/// `ProfileNotFound`/`DuplicateProfile` can be reported precisely.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub name: String,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, DeviceConfig>,
}

/// The instance aggregate root.
///
/// Owned exclusively by the lifecycle controller; mutated only under the
/// operation lock or through the volatile-key write path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    /// Project-qualified name, e.g. `"default/web-1"`.
    pub name: String,
    pub architecture: String,
    pub node: String,

    /// Local config overrides, before profile expansion.
    pub local_config: BTreeMap<String, String>,
    /// Local device overrides, before profile expansion.
    pub local_devices: BTreeMap<String, DeviceConfig>,
    /// Ordered profile names to fold in ahead of local overrides.
    pub profiles: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,

    /// Populated by the config expander. `None` before the first
    /// expansion.
    #[serde(skip)]
    pub expanded_config: Option<BTreeMap<String, String>>,
    #[serde(skip)]
    pub expanded_devices: Option<BTreeMap<String, DeviceConfig>>,
}

impl Instance {
    pub fn new(id: u64, name: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            architecture: architecture.into(),
            node: String::new(),
            local_config: BTreeMap::new(),
            local_devices: BTreeMap::new(),
            profiles: Vec::new(),
            created_at: Utc::now(),
            last_used_at: None,
            expiry: None,
            expanded_config: None,
            expanded_devices: None,
        }
    }

    /// Derive instance flags from the expanded config (falls back to local
    /// config if expansion hasn't run yet).
    pub fn flags(&self) -> InstanceFlags {
        let config = self.expanded_config.as_ref().unwrap_or(&self.local_config);
        let truthy = |k: &str| config.get(k).map(|v| v == "true").unwrap_or(false);

        InstanceFlags {
            ephemeral: truthy("volatile.ephemeral"),
            snapshot: false,
            stateful: truthy("volatile.stateful"),
            privileged: truthy("security.privileged"),
            nesting: truthy("security.nesting"),
        }
    }

    /// Expanded config, or local config before the first expansion.
    pub fn config(&self) -> &BTreeMap<String, String> {
        self.expanded_config.as_ref().unwrap_or(&self.local_config)
    }

    /// Expanded devices, or local devices before the first expansion.
    pub fn devices(&self) -> &BTreeMap<String, DeviceConfig> {
        self.expanded_devices
            .as_ref()
            .unwrap_or(&self.local_devices)
    }
}
