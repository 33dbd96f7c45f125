//! First-fit host id range allocator.
//!
//! A process-wide `parking_lot::Mutex` serializes allocation, matching every
//! other lock in this crate.

use parking_lot::Mutex;
use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{CoreError, CoreResult};

use super::raw;
use super::types::{IdEntry, IdKind, Idmap};

/// A host id range already claimed by a currently-isolated instance (loaded
/// from the database collaborator) or reserved by an in-flight allocation
/// that hasn't been persisted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostIdClaim {
    pub host_id: u32,
    pub map_range: u32,
}

const SCAN_OFFSET: u32 = 65536;

/// Process-wide idmap allocator.
///
/// The mutex guards only the scan-and-reserve step; persisting the
/// allocation to the instance's volatile keys happens outside the lock, so
/// `pending` tracks reservations not yet visible in the caller-supplied
/// `committed` claim list. [`release`](Self::release) drops a reservation
/// once it is either persisted (and so counted in `committed` from then on)
/// or abandoned. Without this release path, ranges would be monotonically
/// consumed and a host would eventually run out, since a reservation must
/// never overlap any currently-isolated instance's range.
pub struct IdmapAllocator {
    pending: Mutex<BTreeSet<HostIdClaim>>,
}

impl Default for IdmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdmapAllocator {
    pub fn new() -> Self {
        Self { pending: Mutex::new(BTreeSet::new()) }
    }

    /// Resolve a `size`-wide host id range for an unprivileged, isolated
    /// instance.
    ///
    /// `initial_base`/`delegated_size` describe the host's delegated
    /// sub-id range; `committed` is the set of ranges already claimed by
    /// other currently-isolated instances (sorted by host id is not
    /// required — this sorts internally). `explicit_base`, when set,
    /// bypasses scanning entirely.
    pub fn allocate(
        &self,
        initial_base: u32,
        delegated_size: u32,
        size: u32,
        committed: &[HostIdClaim],
        explicit_base: Option<u32>,
    ) -> CoreResult<(Idmap, u32)> {
        let base = if let Some(base) = explicit_base {
            debug!(base, size, "idmap: using explicit security.idmap.base");
            base
        } else {
            let mut pending = self.pending.lock();
            let base = self.scan_locked(initial_base, delegated_size, size, committed, &pending)?;
            pending.insert(HostIdClaim { host_id: base, map_range: size });
            debug!(base, size, "idmap: allocated via first-fit scan");
            base
        };

        let idmap = Idmap(vec![
            IdEntry { kind: IdKind::Uid, nsid: 0, hostid: base, maprange: size },
            IdEntry { kind: IdKind::Gid, nsid: 0, hostid: base, maprange: size },
        ]);
        Ok((idmap, base))
    }

    fn scan_locked(
        &self,
        initial_base: u32,
        delegated_size: u32,
        size: u32,
        committed: &[HostIdClaim],
        pending: &BTreeSet<HostIdClaim>,
    ) -> CoreResult<u32> {
        let end = initial_base.saturating_add(delegated_size);
        let mut claims: Vec<HostIdClaim> = committed.to_vec();
        claims.extend(pending.iter().copied());
        claims.sort_by_key(|c| c.host_id);

        let mut cursor = initial_base.saturating_add(SCAN_OFFSET);
        for claim in &claims {
            if claim.host_id >= cursor && claim.host_id - cursor >= size {
                return Ok(cursor);
            }
            cursor = cursor.max(claim.host_id.saturating_add(claim.map_range));
        }

        if end.saturating_sub(cursor) >= size {
            return Ok(cursor);
        }

        Err(CoreError::IdmapExhausted(size))
    }

    /// Free a previously-claimed range, e.g. once an instance is deleted or
    /// its isolation mode changes.
    pub fn release(&self, base: u32, size: u32) {
        self.pending.lock().remove(&HostIdClaim { host_id: base, map_range: size });
    }
}

/// Resolve the idmap for a container: privileged containers get none,
/// non-isolated containers get the full delegated range (base 0) plus any
/// merged raw entries, isolated containers go through the allocator.
#[allow(clippy::too_many_arguments)]
pub fn resolve(
    allocator: &IdmapAllocator,
    privileged: bool,
    isolated: bool,
    initial_base: u32,
    delegated_size: u32,
    size: u32,
    committed: &[HostIdClaim],
    explicit_base: Option<u32>,
    raw_idmap: Option<&str>,
) -> CoreResult<Idmap> {
    if privileged {
        return Ok(Idmap::empty());
    }

    let mut idmap = if isolated {
        let (idmap, _base) =
            allocator.allocate(initial_base, delegated_size, size, committed, explicit_base)?;
        idmap
    } else {
        Idmap(vec![
            IdEntry { kind: IdKind::Uid, nsid: 0, hostid: 0, maprange: delegated_size },
            IdEntry { kind: IdKind::Gid, nsid: 0, hostid: 0, maprange: delegated_size },
        ])
    };

    if let Some(raw) = raw_idmap {
        for entry in raw::parse_and_check(raw, initial_base)? {
            idmap.push(entry);
        }
    }

    Ok(idmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_skips_reserved_head_and_existing_claims() {
        let allocator = IdmapAllocator::new();
        let committed = [HostIdClaim { host_id: 1_000_000 + 65536, map_range: 65536 }];
        let (idmap, base) = allocator
            .allocate(1_000_000, 1 << 20, 65536, &committed, None)
            .unwrap();
        assert_eq!(base, 1_000_000 + 65536 + 65536);
        assert_eq!(idmap.0.len(), 2);
    }

    #[test]
    fn explicit_base_bypasses_scan() {
        let allocator = IdmapAllocator::new();
        let (_idmap, base) = allocator
            .allocate(1_000_000, 1 << 20, 65536, &[], Some(42))
            .unwrap();
        assert_eq!(base, 42);
    }

    #[test]
    fn exhaustion_when_no_gap_fits() {
        let allocator = IdmapAllocator::new();
        let committed = [HostIdClaim { host_id: 1_000_000 + 65536, map_range: 1000 }];
        let err = allocator
            .allocate(1_000_000, 65536 + 1000, 65536, &committed, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::IdmapExhausted(65536)));
    }

    #[test]
    fn concurrent_allocations_do_not_overlap() {
        let allocator = IdmapAllocator::new();
        let (_first, base1) = allocator.allocate(1_000_000, 1 << 20, 65536, &[], None).unwrap();
        let (_second, base2) = allocator.allocate(1_000_000, 1 << 20, 65536, &[], None).unwrap();
        assert_ne!(base1, base2);
        assert!(base2 >= base1 + 65536 || base1 >= base2 + 65536);
    }

    #[test]
    fn release_frees_a_pending_range_for_reuse() {
        let allocator = IdmapAllocator::new();
        let (_idmap, base) = allocator.allocate(1_000_000, 1 << 20, 65536, &[], None).unwrap();
        allocator.release(base, 65536);
        let (_idmap2, base2) = allocator.allocate(1_000_000, 1 << 20, 65536, &[], None).unwrap();
        assert_eq!(base, base2);
    }

    #[test]
    fn privileged_gets_no_idmap() {
        let allocator = IdmapAllocator::new();
        let idmap = resolve(&allocator, true, true, 1_000_000, 1 << 20, 65536, &[], None, None).unwrap();
        assert!(idmap.is_empty());
    }

    #[test]
    fn non_isolated_gets_full_delegated_range() {
        let allocator = IdmapAllocator::new();
        let idmap =
            resolve(&allocator, false, false, 1_000_000, 1 << 20, 65536, &[], None, None).unwrap();
        assert_eq!(idmap.0[0].hostid, 0);
        assert_eq!(idmap.0[0].maprange, 1 << 20);
    }

    #[test]
    fn raw_idmap_merges_in_addition_to_allocation() {
        let allocator = IdmapAllocator::new();
        let idmap = resolve(
            &allocator,
            false,
            true,
            1_000_000,
            1 << 20,
            65536,
            &[],
            None,
            Some("uid 65536 1165536 10\ngid 65536 1165536 10"),
        )
        .unwrap();
        assert_eq!(idmap.0.len(), 4);
    }
}
