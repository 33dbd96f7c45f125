//! On-disk UID/GID shifting.
//!
//! Walks a rootfs tree and rewrites every inode's owning uid/gid according
//! to an idmap, skipping filesystem-specific metadata directories that must
//! never be touched.

use std::path::Path;

use nix::unistd::{Gid, Uid, chown};
use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult};
use crate::idmap::{IdKind, Idmap};

/// Directories a shift walk must never descend into or rewrite.
const SKIP_DIRS: &[&str] = &[".zfs"];

fn map_id(idmap: &Idmap, kind: IdKind, id: u32) -> u32 {
    for entry in &idmap.0 {
        if entry.kind != kind {
            continue;
        }
        if id >= entry.nsid && id < entry.nsid + entry.maprange {
            return entry.hostid + (id - entry.nsid);
        }
    }
    id
}

fn unmap_id(idmap: &Idmap, kind: IdKind, id: u32) -> u32 {
    for entry in &idmap.0 {
        if entry.kind != kind {
            continue;
        }
        if id >= entry.hostid && id < entry.hostid + entry.maprange {
            return entry.nsid + (id - entry.hostid);
        }
    }
    id
}

/// Visit every entry under `root`, calling `f(path, uid, nsid-relative-uid,
/// gid, nsid-relative-gid)` is unnecessary detail — callers supply a
/// translation closure instead so unshift and shift share this walk.
fn walk_and_chown(
    root: &Path,
    mut translate: impl FnMut(u32, u32) -> (u32, u32),
    skip: &dyn Fn(&Path) -> bool,
    progress: &mut dyn FnMut(&str),
) -> CoreResult<()> {
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        !SKIP_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()) && !skip(entry.path())
    });

    for entry in walker {
        let entry = entry.map_err(|e| CoreError::Internal(e.to_string()))?;
        let meta = entry.metadata().map_err(|e| CoreError::Internal(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let (new_uid, new_gid) = translate(meta.uid(), meta.gid());
            chown(
                entry.path(),
                Some(Uid::from_raw(new_uid)),
                Some(Gid::from_raw(new_gid)),
            )
            .map_err(|e| CoreError::Internal(format!("chown {}: {e}", entry.path().display())))?;
        }

        progress(&entry.path().display().to_string());
    }
    Ok(())
}

/// Shift every inode's owner from namespace-relative ids to `idmap`'s host
/// ids (ownership currently matches the container's view; make it match
/// the host's), skipping any subtree `skip` rejects (BTRFS nested
/// subvolumes).
pub fn shift_skipping(
    root: &Path,
    idmap: &Idmap,
    skip: &dyn Fn(&Path) -> bool,
    progress: &mut dyn FnMut(&str),
) -> CoreResult<()> {
    walk_and_chown(
        root,
        |uid, gid| (map_id(idmap, IdKind::Uid, uid), map_id(idmap, IdKind::Gid, gid)),
        skip,
        progress,
    )
}

/// Inverse of [`shift_skipping`]: rewrite host-relative ownership back to
/// namespace-relative ids under `idmap`.
pub fn unshift_skipping(
    root: &Path,
    idmap: &Idmap,
    skip: &dyn Fn(&Path) -> bool,
    progress: &mut dyn FnMut(&str),
) -> CoreResult<()> {
    walk_and_chown(
        root,
        |uid, gid| (unmap_id(idmap, IdKind::Uid, uid), unmap_id(idmap, IdKind::Gid, gid)),
        skip,
        progress,
    )
}
