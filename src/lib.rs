//! Portico - client-side content cache and navigation synchronization
//!
//! Keeps three independently-mutating inputs consistent: a remote dataset
//! of content records where a subset is access-restricted, the session's
//! authentication state, and the navigation stack (URL, query parameter,
//! back/forward history).
//!
//! ## Components
//!
//! - **Cache**: atomic dataset snapshots with epoch-ordered installs
//! - **Sanitize**: the only path from raw payloads into the cache
//! - **Auth**: tri-state session watcher with coalesced probing
//! - **History**: normalized, no-op-guarded history mutation
//! - **Observer**: deduplicated route change delivery
//! - **Bridge**: the state machine tying the triad together

pub mod auth;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod events;
pub mod fetch;
pub mod history;
pub mod observer;
pub mod record;
pub mod sanitize;
pub mod types;

pub use auth::{AuthState, AuthWatcher, AuthWatcherConfig};
pub use bridge::{Bridge, BridgeConfig, BridgeState, RefreshReason};
pub use cache::{DatasetCache, InitializeOptions};
pub use config::PorticoConfig;
pub use events::{Event, EventBus};
pub use fetch::{AuthProbe, DatasetFetcher, DatasetShape, FetchedPayload, HttpAuthProbe, HttpFetcher};
pub use history::{
    HistoryBackend, HistoryConfig, HistorySynchronizer, MemoryHistory, NavState, PushOutcome,
};
pub use observer::{DeliveryMode, ObserverConfig, RouteObserver};
pub use record::{DatasetSnapshot, Record, RecordOutcome};
pub use sanitize::CONFIDENTIAL_PLACEHOLDER;
pub use types::{PorticoError, Result};
