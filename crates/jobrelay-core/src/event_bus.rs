use tokio::sync::broadcast;

use jobrelay_types::RelayEvent;

/// Per-observer queue depth. A receiver that falls further behind loses the
/// oldest events and is told how many it missed.
pub const OBSERVER_QUEUE_CAPACITY: usize = 2048;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(OBSERVER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    /// Never blocks; with no observers connected the event is discarded.
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Notice delivered in place of events a slow observer missed.
pub fn lag_notice(skipped: u64) -> RelayEvent {
    RelayEvent::log(format!(
        "[relay] observer fell behind; {skipped} events dropped"
    ))
}
