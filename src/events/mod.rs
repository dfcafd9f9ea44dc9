//! Event bus for lifecycle notifications
//!
//! Registries and the broadcaster publish here; `main` runs a subscriber
//! that turns events into log lines.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`SystemEvent`]s to every subscriber
///
/// Publishing never blocks and never fails: events sent while nobody is
/// subscribed are discarded, and each subscriber only sees events published
/// after it subscribed. Shared as `Arc<EventBus>` between the resource
/// registry, the broadcaster and the logger in `main`.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to 256 undelivered events per subscriber
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped when nobody is subscribed
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `Lagged` and skips ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
