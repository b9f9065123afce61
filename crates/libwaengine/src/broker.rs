use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use waengine_protocol::{InstanceId, ViewerEvent};

const DEFAULT_CAPACITY: usize = 16;

/// Per-instance fan-out of viewer events.
///
/// Channels are created lazily by whichever side arrives first, so a viewer
/// may subscribe before the instance has ever been connected. Delivery is
/// best-effort: lagging or absent receivers never hold up the sender.
pub struct ViewerHub {
    channels: DashMap<InstanceId, broadcast::Sender<ViewerEvent>>,
    capacity: usize,
}

impl ViewerHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, instance_id: &str) -> broadcast::Sender<ViewerEvent> {
        self.channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<ViewerEvent> {
        self.sender(instance_id).subscribe()
    }

    /// Push an event to the current subscribers of `instance_id`.
    /// Returns how many receivers it reached.
    pub fn broadcast(&self, instance_id: &str, event: ViewerEvent) -> usize {
        let Some(tx) = self.channels.get(instance_id).map(|r| r.value().clone()) else {
            trace!(instance_id, "no viewers registered");
            return 0;
        };
        tx.send(event).unwrap_or(0)
    }

    pub fn viewer_count(&self, instance_id: &str) -> usize {
        self.channels
            .get(instance_id)
            .map(|r| r.value().receiver_count())
            .unwrap_or(0)
    }
}

impl Default for ViewerHub {
    fn default() -> Self {
        Self::new()
    }
}
