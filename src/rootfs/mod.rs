//! Rootfs Remapper.
//!
//! Keeps an instance's on-disk UID/GID ownership in step with its current
//! idmap across Starts, without reshifting when nothing changed.

mod shift;

use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::idmap::Idmap;

/// BTRFS always gives a subvolume root inode number 256; treat any
/// directory with that inode as a nested subvolume boundary rather than
/// descending into it as a plain directory.
const BTRFS_SUBVOL_INODE: u64 = 256;

fn is_btrfs_subvolume_root(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::symlink_metadata(path)
            .map(|m| m.ino() == BTRFS_SUBVOL_INODE)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// Reconcile a rootfs's on-disk ownership with `next_idmap`, given the
/// idmap it was last shifted to (`disk_idmap`, `None` if never shifted).
///
/// Returns the idmap that should be persisted as the new
/// `volatile.last_state.idmap`.
pub fn remap(
    root: &Path,
    disk_idmap: Option<&Idmap>,
    next_idmap: &Idmap,
    shift_protected: bool,
    storage_supports_idmapped_mount: bool,
    is_btrfs: bool,
    progress: &mut dyn FnMut(&str),
) -> CoreResult<Idmap> {
    if shift_protected {
        return Err(CoreError::ShiftProtected);
    }

    if disk_idmap == Some(next_idmap) {
        return Ok(next_idmap.clone());
    }

    let skip_nested_subvolume = |path: &Path| is_btrfs && is_btrfs_subvolume_root(path);

    if let Some(disk_idmap) = disk_idmap {
        if !disk_idmap.is_empty() {
            shift::unshift_skipping(root, disk_idmap, &skip_nested_subvolume, progress)?;
        }
    }

    if storage_supports_idmapped_mount {
        // On-disk ownership stays at 0; the storage pool's idmapped mount
        // does the translation at runtime instead.
        return Ok(Idmap::empty());
    }

    if !next_idmap.is_empty() {
        shift::shift_skipping(root, next_idmap, &skip_nested_subvolume, progress)?;
    }

    Ok(next_idmap.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::{IdEntry, IdKind};

    fn sample_idmap() -> Idmap {
        Idmap(vec![
            IdEntry { kind: IdKind::Uid, nsid: 0, hostid: 100000, maprange: 65536 },
            IdEntry { kind: IdKind::Gid, nsid: 0, hostid: 100000, maprange: 65536 },
        ])
    }

    #[test]
    fn shift_protected_instance_fails_fast() {
        let err = remap(
            Path::new("/nonexistent"),
            None,
            &sample_idmap(),
            true,
            false,
            false,
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ShiftProtected));
    }

    #[test]
    fn matching_idmaps_are_a_no_op() {
        let idmap = sample_idmap();
        let dir = tempfile::tempdir().unwrap();
        let result = remap(dir.path(), Some(&idmap), &idmap, false, false, false, &mut |_| {}).unwrap();
        assert_eq!(result, idmap);
    }

    #[test]
    fn idmapped_mount_support_keeps_ownership_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let result = remap(dir.path(), None, &sample_idmap(), false, true, false, &mut |_| {}).unwrap();
        assert!(result.is_empty());
    }
}
