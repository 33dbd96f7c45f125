//! Persistence collaborator.
//!
//! The actual database is an external collaborator outside this crate's
//! boundary; this module defines the trait boundary onto it
//! (`InstanceStore`), the volatile-key insert-or-read write path every
//! other component goes through, and the `backup.yaml` on-disk snapshot
//! format.

mod backup;
mod store;
mod volatile;

pub use backup::{Backup, read as read_backup, write as write_backup};
pub use store::{InMemoryInstanceStore, InstanceStore};
pub use volatile::{StoreVolatileWriter, VolatileWriter};

/// Default root of the per-instance state tree when a host binary doesn't
/// override it explicitly. Falls back to `/var/lib/ctnrd` if the system
/// data directory can't be resolved.
pub fn default_state_dir() -> std::path::PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ctnrd"))
        .unwrap_or_else(|| std::path::PathBuf::from("/var/lib/ctnrd"))
}
