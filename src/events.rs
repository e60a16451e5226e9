//! Typed event bus connecting the watcher, observer, cache, and bridge
//!
//! Replaces ad hoc window-event wiring with one broadcast channel of typed
//! variants. Each component subscribes and matches only the variants it
//! needs; everything else is skipped.

use tokio::sync::broadcast;
use tracing::trace;

use crate::auth::AuthState;
use crate::history::NavState;

/// Default channel capacity; lagging receivers drop the oldest events
const DEFAULT_CAPACITY: usize = 64;

/// Events carried on the bus
#[derive(Debug, Clone)]
pub enum Event {
    /// Auth state transitioned (probe result or explicit logout)
    AuthChanged(AuthState),
    /// The composed location signature changed, already deduplicated
    RouteChanged { pathname: String, search: String },
    /// A mutation elsewhere in the app invalidated the dataset cache
    CacheInvalidated,
    /// Browser back/forward traversal landed on an entry
    PopState {
        pathname: String,
        search: String,
        state: Option<NavState>,
    },
    /// Location hash changed without a full navigation
    HashChanged { pathname: String, search: String },
    /// The tab became visible again
    VisibilityVisible,
    /// The window regained focus
    WindowFocus,
}

/// Broadcast bus for typed events
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers
    ///
    /// Emitting with no subscribers is not an error; the event is dropped.
    pub fn emit(&self, event: Event) {
        trace!("bus emit: {:?}", event);
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
