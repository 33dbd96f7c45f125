//! Lifecycle event publication. The cluster event bus is outside this
//! crate entirely; `VecEventSink` is the in-process stand-in used by
//! tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleEventKind {
    Created,
    Started,
    Stopped,
    ShuttingDown,
    Restarted,
    Frozen,
    Unfrozen,
    Restored,
    Deleted,
    Renamed,
    DeviceAdded,
    DeviceUpdated,
    DeviceRemoved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub instance_id: u64,
    pub kind: LifecycleEventKind,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> CoreResult<()>;
}

#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

#[async_trait]
impl EventSink for VecEventSink {
    async fn publish(&self, event: LifecycleEvent) -> CoreResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
