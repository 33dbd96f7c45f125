//! Idmap Allocator.
//!
//! Chooses a non-overlapping host UID/GID base for isolated unprivileged
//! instances, merges `raw.idmap` overrides, and tracks the current/next/
//! last-applied idmap triple that C8 diffs against on Start.

mod allocator;
mod raw;
mod types;

pub use allocator::{HostIdClaim, IdmapAllocator, resolve};
pub use types::{IdEntry, IdKind, Idmap};
