//! Profile/local config and device expansion.

use std::collections::{BTreeMap, HashSet};

use crate::error::{CoreError, CoreResult};
use crate::instance::{DeviceConfig, Instance, Profile};

/// Fold `overlay` onto `base`, deleting a key when `overlay` maps it to the
/// empty string.
pub(crate) fn fold_config(base: &mut BTreeMap<String, String>, overlay: &BTreeMap<String, String>) {
    for (k, v) in overlay {
        if v.is_empty() {
            base.remove(k);
        } else {
            base.insert(k.clone(), v.clone());
        }
    }
}

/// Fold devices by name: a later definition fully replaces an earlier one,
/// rather than merging individual device keys.
pub(crate) fn fold_devices(
    base: &mut BTreeMap<String, DeviceConfig>,
    overlay: &BTreeMap<String, DeviceConfig>,
) {
    for (name, cfg) in overlay {
        base.insert(name.clone(), cfg.clone());
    }
}

/// Expand `instance`'s local config/devices against its profile list,
/// writing `expandedConfig`/`expandedDevices` in place.
///
/// `available_profiles` is the full profile catalog the instance's
/// `profiles` list is resolved against (the database collaborator, in
/// practice). Profiles are folded in declaration order, local last — local
/// always wins.
pub fn expand(instance: &mut Instance, available_profiles: &[Profile]) -> CoreResult<()> {
    let mut seen = HashSet::with_capacity(instance.profiles.len());
    for name in &instance.profiles {
        if !seen.insert(name.as_str()) {
            return Err(CoreError::DuplicateProfile(name.clone()));
        }
    }

    let mut config = BTreeMap::new();
    let mut devices = BTreeMap::new();

    for name in &instance.profiles {
        let profile = available_profiles
            .iter()
            .find(|p| &p.name == name)
            .ok_or_else(|| CoreError::ProfileNotFound(name.clone()))?;

        fold_config(&mut config, &profile.config);
        fold_devices(&mut devices, &profile.devices);
    }

    fold_config(&mut config, &instance.local_config);
    fold_devices(&mut devices, &instance.local_devices);

    instance.expanded_config = Some(config);
    instance.expanded_devices = Some(devices);
    Ok(())
}
