//! The restricted guest-facing API socket ("devlxd") and its event feed.
//!
//! Serving the socket itself is outside this crate's boundary, the same
//! way the cluster event bus is — `DevlxdEventQueue` is the trait a host
//! binary wires a real per-instance socket server into. This crate only
//! decides *when* an event fires (`user.*` config changes, device
//! add/update/remove) and hands it off.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CoreResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevlxdEventKind {
    ConfigChanged,
    DeviceAdded,
    DeviceUpdated,
    DeviceRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevlxdEvent {
    pub kind: DevlxdEventKind,
    /// Config key for `ConfigChanged`, device name for the device events.
    pub name: String,
}

#[async_trait]
pub trait DevlxdEventQueue: Send + Sync {
    async fn push(&self, instance_id: u64, event: DevlxdEvent) -> CoreResult<()>;
}

/// Stand-in for hosts that haven't wired a real devlxd socket server yet.
pub struct NoopDevlxdEventQueue;

#[async_trait]
impl DevlxdEventQueue for NoopDevlxdEventQueue {
    async fn push(&self, _instance_id: u64, _event: DevlxdEvent) -> CoreResult<()> {
        Ok(())
    }
}

/// In-process stand-in used by tests, mirroring `VecEventSink`.
#[derive(Default)]
pub struct VecDevlxdEventQueue {
    events: Mutex<Vec<(u64, DevlxdEvent)>>,
}

impl VecDevlxdEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(u64, DevlxdEvent)> {
        std::mem::take(&mut self.events.lock())
    }
}

#[async_trait]
impl DevlxdEventQueue for VecDevlxdEventQueue {
    async fn push(&self, instance_id: u64, event: DevlxdEvent) -> CoreResult<()> {
        self.events.lock().push((instance_id, event));
        Ok(())
    }
}
