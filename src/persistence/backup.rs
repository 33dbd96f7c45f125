//! `backup.yaml` persistence.
//!
//! Every instance directory carries a `backup.yaml` snapshot of its
//! identity, config, and devices — the file a host reads to rebuild its
//! database entry after an export/import. `serde_yaml` isn't part of the
//! teacher's stack, but it's the obvious idiomatic pairing with `serde`
//! once YAML, rather than JSON, is the on-disk format a real driver uses
//! for this file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::instance::Instance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub instance: Instance,
}

pub fn write(path: &Path, instance: &Instance) -> CoreResult<()> {
    let backup = Backup { instance: instance.clone() };
    let yaml = serde_yaml::to_string(&backup)
        .map_err(|e| CoreError::Internal(format!("failed to serialize backup.yaml: {e}")))?;
    std::fs::write(path, yaml)?;
    Ok(())
}

pub fn read(path: &Path) -> CoreResult<Backup> {
    let yaml = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&yaml)
        .map_err(|e| CoreError::Internal(format!("failed to parse backup.yaml: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.yaml");

        let instance = Instance::new(7, "default/c1", "x86_64");
        write(&path, &instance).unwrap();

        let loaded = read(&path).unwrap();
        assert_eq!(loaded.instance.id, 7);
        assert_eq!(loaded.instance.name, "default/c1");
    }
}
