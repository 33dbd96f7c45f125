//! Volatile-key writes.
//!
//! Generated state (NIC MAC addresses, chosen interface names, the
//! current/next/last-state idmap triple) is written through here rather
//! than directly into an instance's config map, so concurrent Starts racing
//! to fill the same key converge on one winner instead of each overwriting
//! the other.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CoreResult;
use crate::instance::Instance;

use super::store::InstanceStore;

/// Insert-or-read semantics for a single instance's config map: on a race,
/// the caller adopts whichever value won rather than erroring.
pub trait VolatileWriter: Send + Sync {
    /// Insert `key = value` if absent; if another writer already set it,
    /// return the stored value instead.
    fn insert_if_absent(&self, instance_id: u64, key: &str, value: String) -> CoreResult<String>;

    fn set(&self, instance_id: u64, key: &str, value: String) -> CoreResult<()>;

    /// Remove every key with the given prefix, e.g. `volatile.eth0.`.
    fn clear_prefix(&self, instance_id: u64, prefix: &str) -> CoreResult<()>;

    /// Remove `{prefix}{suffix}` for each of `suffixes`, leaving every other
    /// key under `prefix` alone — used when a device is replaced in place
    /// and only some of its resolved fields need to be re-derived.
    fn clear_suffixes(&self, instance_id: u64, prefix: &str, suffixes: &[&str]) -> CoreResult<()>;
}

/// `VolatileWriter` backed by an [`InstanceStore`], serializing writes with
/// a process-wide mutex the way the idmap allocator serializes its scan —
/// the store itself is already internally locked, but the read-modify-write
/// of insert-or-read needs to be atomic across that round trip too.
pub struct StoreVolatileWriter<S> {
    store: Arc<S>,
    lock: Mutex<()>,
}

impl<S: InstanceStore> StoreVolatileWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, lock: Mutex::new(()) }
    }

    fn mutate(&self, instance_id: u64, f: impl FnOnce(&mut Instance)) -> CoreResult<Instance> {
        let _guard = self.lock.lock();
        let mut instance = self.store.get(instance_id)?;
        f(&mut instance);
        self.store.save(&instance)?;
        Ok(instance)
    }
}

impl<S: InstanceStore> VolatileWriter for StoreVolatileWriter<S> {
    fn insert_if_absent(&self, instance_id: u64, key: &str, value: String) -> CoreResult<String> {
        let _guard = self.lock.lock();
        let mut instance = self.store.get(instance_id)?;
        if let Some(existing) = instance.local_config.get(key) {
            return Ok(existing.clone());
        }
        instance.local_config.insert(key.to_string(), value.clone());
        self.store.save(&instance)?;
        Ok(value)
    }

    fn set(&self, instance_id: u64, key: &str, value: String) -> CoreResult<()> {
        self.mutate(instance_id, |inst| {
            inst.local_config.insert(key.to_string(), value);
        })
        .map(|_| ())
    }

    fn clear_prefix(&self, instance_id: u64, prefix: &str) -> CoreResult<()> {
        self.mutate(instance_id, |inst| {
            inst.local_config.retain(|k, _| !k.starts_with(prefix));
        })
        .map(|_| ())
    }

    fn clear_suffixes(&self, instance_id: u64, prefix: &str, suffixes: &[&str]) -> CoreResult<()> {
        self.mutate(instance_id, |inst| {
            for suffix in suffixes {
                inst.local_config.remove(&format!("{prefix}{suffix}"));
            }
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::InMemoryInstanceStore;

    #[test]
    fn insert_if_absent_wins_on_first_write() {
        let store = Arc::new(InMemoryInstanceStore::new());
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        let writer = StoreVolatileWriter::new(store.clone());

        let value = writer
            .insert_if_absent(1, "volatile.eth0.hwaddr", "00:11:22:33:44:55".to_string())
            .unwrap();
        assert_eq!(value, "00:11:22:33:44:55");
    }

    #[test]
    fn insert_if_absent_adopts_existing_value_on_race() {
        let store = Arc::new(InMemoryInstanceStore::new());
        store.save(&Instance::new(1, "default/c1", "x86_64")).unwrap();
        let writer = StoreVolatileWriter::new(store.clone());

        writer
            .insert_if_absent(1, "volatile.eth0.name", "eth0".to_string())
            .unwrap();
        let second = writer
            .insert_if_absent(1, "volatile.eth0.name", "eth1".to_string())
            .unwrap();
        assert_eq!(second, "eth0");
    }

    #[test]
    fn clear_suffixes_only_removes_the_named_keys() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let mut instance = Instance::new(1, "default/c1", "x86_64");
        instance.local_config.insert("volatile.eth0.hwaddr".into(), "x".into());
        instance.local_config.insert("volatile.eth0.name".into(), "eth0".into());
        store.save(&instance).unwrap();

        let writer = StoreVolatileWriter::new(store.clone());
        writer.clear_suffixes(1, "volatile.eth0.", &["hwaddr"]).unwrap();

        let after = store.get(1).unwrap();
        assert!(!after.local_config.contains_key("volatile.eth0.hwaddr"));
        assert!(after.local_config.contains_key("volatile.eth0.name"));
    }

    #[test]
    fn clear_prefix_only_touches_matching_keys() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let mut instance = Instance::new(1, "default/c1", "x86_64");
        instance.local_config.insert("volatile.eth0.hwaddr".into(), "x".into());
        instance.local_config.insert("volatile.eth1.hwaddr".into(), "y".into());
        store.save(&instance).unwrap();

        let writer = StoreVolatileWriter::new(store.clone());
        writer.clear_prefix(1, "volatile.eth0.").unwrap();

        let after = store.get(1).unwrap();
        assert!(!after.local_config.contains_key("volatile.eth0.hwaddr"));
        assert!(after.local_config.contains_key("volatile.eth1.hwaddr"));
    }
}
