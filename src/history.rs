//! History synchronizer
//!
//! The imperative layer that mutates the history backend. URLs are
//! normalized to one canonical composed form before any comparison, pushes
//! are guarded against no-ops, and an opt-in double-push fallback works
//! around browsers that coalesce rapid pushes made without a recent trusted
//! user gesture. Backend failures (sandboxed contexts) degrade to logged
//! no-ops and never crash the navigation flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::types::{PorticoError, Result};

/// State payload attached to each history entry
///
/// Carries the record id so traversal can restore without re-parsing the
/// URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavState {
    /// Active record id at the time of the push
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl NavState {
    /// State carrying a record id
    pub fn for_record(id: impl Into<String>) -> Self {
        Self {
            record_id: Some(id.into()),
        }
    }
}

/// Split a URL into (pathname, search, hash), all without delimiters
pub fn split_url(url: &str) -> (String, String, String) {
    let (rest, hash) = match url.split_once('#') {
        Some((r, h)) => (r, h.to_string()),
        None => (url, String::new()),
    };
    let (path, search) = match rest.split_once('?') {
        Some((p, s)) => (p.to_string(), s.to_string()),
        None => (rest.to_string(), String::new()),
    };
    (path, search, hash)
}

/// Normalize a URL to its canonical composed form
///
/// The pathname gets a canonical trailing slash (unless the final segment
/// looks like a file), query and hash are preserved verbatim, and the
/// result is a single composed string so query-only or hash-only
/// differences always compare correctly.
pub fn normalize_url(url: &str) -> String {
    let (mut path, search, hash) = split_url(url);
    if path.is_empty() {
        path = "/".to_string();
    }
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    let last_segment = path.rsplit('/').next().unwrap_or("");
    if !path.ends_with('/') && !last_segment.contains('.') {
        path.push('/');
    }
    let mut out = path;
    if !search.is_empty() {
        out.push('?');
        out.push_str(&search);
    }
    if !hash.is_empty() {
        out.push('#');
        out.push_str(&hash);
    }
    out
}

/// Extract and decode a single query parameter from a search string
pub fn query_param(search: &str, key: &str) -> Option<String> {
    search
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| urlencoding::decode(v).ok().map(|c| c.into_owned()))
}

/// Mutable history surface the synchronizer writes through
pub trait HistoryBackend: Send + Sync {
    /// Add a new entry
    fn push(&self, url: &str, state: &NavState) -> Result<()>;
    /// Overwrite the current entry without adding one
    fn replace(&self, url: &str, state: &NavState) -> Result<()>;
    /// URL of the current entry
    fn current(&self) -> String;
    /// State payload of the current entry
    fn current_state(&self) -> NavState;
    /// Total number of entries
    fn entry_count(&self) -> usize;
}

/// One entry in the in-memory history
#[derive(Debug, Clone)]
struct HistoryEntry {
    url: String,
    state: NavState,
}

#[derive(Debug)]
struct MemoryHistoryInner {
    entries: Vec<HistoryEntry>,
    cursor: usize,
}

/// In-memory history backend for tests and native embedding
///
/// Supports back/forward traversal, emitting `PopState` on the bus the way
/// a browser would.
pub struct MemoryHistory {
    inner: Mutex<MemoryHistoryInner>,
    bus: Option<EventBus>,
    /// Simulates a sandboxed context that rejects history mutation
    deny: AtomicBool,
}

impl MemoryHistory {
    /// Create a history with a single initial entry
    pub fn new(initial_url: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(MemoryHistoryInner {
                entries: vec![HistoryEntry {
                    url: initial_url.into(),
                    state: NavState::default(),
                }],
                cursor: 0,
            }),
            bus: None,
            deny: AtomicBool::new(false),
        }
    }

    /// Emit `PopState` on this bus on back/forward traversal
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Toggle mutation denial (sandboxed-context simulation)
    pub fn set_denied(&self, denied: bool) {
        self.deny.store(denied, Ordering::SeqCst);
    }

    fn check_allowed(&self) -> Result<()> {
        if self.deny.load(Ordering::SeqCst) {
            Err(PorticoError::Navigation(
                "history mutation denied by context".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn emit_popstate(&self, entry: &HistoryEntry) {
        if let Some(bus) = &self.bus {
            let (pathname, search, _) = split_url(&entry.url);
            bus.emit(Event::PopState {
                pathname,
                search,
                state: Some(entry.state.clone()),
            });
        }
    }

    /// Traverse one entry back, emitting `PopState`; no-op at the oldest
    pub fn back(&self) {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cursor == 0 {
                return;
            }
            inner.cursor -= 1;
            inner.entries[inner.cursor].clone()
        };
        self.emit_popstate(&entry);
    }

    /// Traverse one entry forward, emitting `PopState`; no-op at the newest
    pub fn forward(&self) {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cursor + 1 >= inner.entries.len() {
                return;
            }
            inner.cursor += 1;
            inner.entries[inner.cursor].clone()
        };
        self.emit_popstate(&entry);
    }
}

impl HistoryBackend for MemoryHistory {
    fn push(&self, url: &str, state: &NavState) -> Result<()> {
        self.check_allowed()?;
        let mut inner = self.inner.lock().unwrap();
        let cursor = inner.cursor;
        // Pushing discards any forward entries, as browsers do
        inner.entries.truncate(cursor + 1);
        inner.entries.push(HistoryEntry {
            url: url.to_string(),
            state: state.clone(),
        });
        inner.cursor = inner.entries.len() - 1;
        Ok(())
    }

    fn replace(&self, url: &str, state: &NavState) -> Result<()> {
        self.check_allowed()?;
        let mut inner = self.inner.lock().unwrap();
        let cursor = inner.cursor;
        inner.entries[cursor] = HistoryEntry {
            url: url.to_string(),
            state: state.clone(),
        };
        Ok(())
    }

    fn current(&self) -> String {
        let inner = self.inner.lock().unwrap();
        inner.entries[inner.cursor].url.clone()
    }

    fn current_state(&self) -> NavState {
        let inner = self.inner.lock().unwrap();
        inner.entries[inner.cursor].state.clone()
    }

    fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// Configuration for the synchronizer
#[derive(Debug, Clone, Default)]
pub struct HistoryConfig {
    /// Opt into the double-push coalescing fallback
    pub double_push: bool,
}

/// Result of a `navigate_to` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Target equals the current location after normalization; nothing done
    Unchanged,
    /// One entry pushed
    Pushed,
    /// Placeholder pushed; the final replace settles on the next tick
    PlaceholderPushed,
}

/// Phase of the double-push sub-machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoublePushPhase {
    /// Intermediate placeholder entry is live
    PlaceholderPushed,
    /// Final URL and state are in place
    Replaced,
}

struct PendingPush {
    url: String,
    state: NavState,
}

/// Writes navigation into the history backend
pub struct HistorySynchronizer {
    backend: Arc<dyn HistoryBackend>,
    config: HistoryConfig,
    initial_replace_done: AtomicBool,
    /// Shared with the spawned settle task
    pending: Arc<Mutex<Option<PendingPush>>>,
    phase: Arc<Mutex<Option<DoublePushPhase>>>,
}

/// Replace the placeholder entry with its final URL and state
fn settle(
    backend: &Arc<dyn HistoryBackend>,
    pending: &Mutex<Option<PendingPush>>,
    phase: &Mutex<Option<DoublePushPhase>>,
) -> bool {
    let Some(push) = pending.lock().unwrap().take() else {
        return false;
    };
    if let Err(e) = backend.replace(&push.url, &push.state) {
        warn!("placeholder replace degraded to no-op: {}", e);
    }
    *phase.lock().unwrap() = Some(DoublePushPhase::Replaced);
    true
}

impl HistorySynchronizer {
    /// Create a synchronizer over the given backend
    pub fn new(backend: Arc<dyn HistoryBackend>, config: HistoryConfig) -> Self {
        Self {
            backend,
            config,
            initial_replace_done: AtomicBool::new(false),
            pending: Arc::new(Mutex::new(None)),
            phase: Arc::new(Mutex::new(None)),
        }
    }

    /// The backend this synchronizer writes through
    pub fn backend(&self) -> &Arc<dyn HistoryBackend> {
        &self.backend
    }

    /// Normalized current location
    pub fn current(&self) -> String {
        normalize_url(&self.backend.current())
    }

    /// Push the target unless it already equals the current location
    ///
    /// With double-push enabled, a placeholder entry goes in immediately and
    /// the final state is settled on the next tick, yielding one net entry.
    pub fn navigate_to(&self, url: &str, state: NavState) -> PushOutcome {
        let target = normalize_url(url);
        if target == self.current() {
            debug!("navigate_to is a no-op: {}", target);
            return PushOutcome::Unchanged;
        }

        if self.config.double_push {
            if let Err(e) = self.backend.push(&target, &NavState::default()) {
                warn!("history push degraded to no-op: {}", e);
                return PushOutcome::Unchanged;
            }
            *self.pending.lock().unwrap() = Some(PendingPush { url: target, state });
            *self.phase.lock().unwrap() = Some(DoublePushPhase::PlaceholderPushed);

            // Settle on the next tick when a runtime is driving us; tests
            // may also call settle_pending directly
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let backend = Arc::clone(&self.backend);
                let pending = Arc::clone(&self.pending);
                let phase = Arc::clone(&self.phase);
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    settle(&backend, &pending, &phase);
                });
            }
            return PushOutcome::PlaceholderPushed;
        }

        match self.backend.push(&target, &state) {
            Ok(()) => PushOutcome::Pushed,
            Err(e) => {
                warn!("history push degraded to no-op: {}", e);
                PushOutcome::Unchanged
            }
        }
    }

    /// Replace the placeholder with the final URL and state
    ///
    /// Returns true when a pending push was settled.
    pub fn settle_pending(&self) -> bool {
        settle(&self.backend, &self.pending, &self.phase)
    }

    /// Current phase of the double-push sub-machine, if it has ever run
    pub fn double_push_phase(&self) -> Option<DoublePushPhase> {
        self.phase.lock().unwrap().clone()
    }

    /// Overwrite the current entry without adding one
    pub fn replace_with(&self, url: &str, state: NavState) {
        let target = normalize_url(url);
        if let Err(e) = self.backend.replace(&target, &state) {
            warn!("history replace degraded to no-op: {}", e);
        }
    }

    /// One-time normalization of the very first URL
    ///
    /// Replaces instead of pushing so arriving at a bare route does not
    /// create a spurious back-step. Subsequent calls are ignored.
    pub fn replace_initial(&self, url: &str, state: NavState) -> bool {
        if self.initial_replace_done.swap(true, Ordering::SeqCst) {
            warn!("replace_initial called more than once, ignoring");
            return false;
        }
        self.replace_with(url, state);
        true
    }
}
