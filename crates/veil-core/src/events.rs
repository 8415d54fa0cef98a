//! Lifecycle event bus
//!
//! Process-wide broadcast of state transitions. Delivery is a synchronous
//! fan-out to every receiver registered at the moment of publication; there
//! is no acknowledgement and no replay. Observers that fall behind the
//! channel capacity simply lag (tokio broadcast semantics).

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::FilterMeta;

/// Default broadcast capacity; slow observers past this lag.
const EVENT_CAPACITY: usize = 256;

/// State transitions published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterEvent {
    /// First-run installation (seeding) completed.
    Installed,
    /// The engine could not be brought up (store unusable).
    NotInstalled,
    /// Post-initialization: the store is usable.
    Ready,
    /// A sync pass will attempt a merge.
    UpdateStarted,
    /// A sync request was refused: already updating, or metadata already
    /// current.
    UpdateDidNotStart,
    /// One filter was merged; fired per filter for progress UI.
    UpdatePartCompleted { filter_id: i32 },
    /// The merge transaction committed.
    UpdateFinished { updated: Vec<FilterMeta> },
    /// The sync pass failed; the store is unchanged.
    UpdateFailed,
    /// Some filter's rule set changed outside a sync pass.
    FilterRulesUpdated,
    /// A filter's enabled flag changed.
    FilterEnabledChanged {
        filter_id: i32,
        enabled: bool,
        from_ui: bool,
    },
}

/// Broadcast-only event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FilterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Register an observer. Only events published after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<FilterEvent> {
        self.tx.subscribe()
    }

    /// Publish to all currently registered observers. A send with no
    /// observers is not an error.
    pub fn publish(&self, event: FilterEvent) {
        trace!("event: {:?}", event);
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
