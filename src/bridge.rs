//! Dataset/navigation bridge
//!
//! Orchestration glue between the auth watcher, the dataset cache, and the
//! history synchronizer. On every route or auth change it decides whether
//! the cache must be re-fetched (dataset shape mismatch, missing record)
//! and keeps the active record id in step with the URL.
//!
//! State machine: `Uninitialized → AwaitingAuthProbe → Settled ⇄
//! Refreshing(reason)`. `Refreshing` always resolves back to `Settled`,
//! even on fetch failure; failures are recorded, never strand the machine.
//! The machine is deliberately conservative: an extra redundant fetch is
//! preferred over rendering a mismatched auth/dataset shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::auth::{AuthState, AuthWatcher};
use crate::cache::{DatasetCache, InitializeOptions};
use crate::events::{Event, EventBus};
use crate::fetch::DatasetShape;
use crate::history::{query_param, split_url, HistorySynchronizer, NavState};
use crate::record::RecordOutcome;

/// Why a refresh was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// The URL names a record absent from the current map
    RecordMissing,
    /// Auth state flipped and the shape no longer matches
    AuthChanged,
    /// A mutation elsewhere invalidated the cache
    CacheInvalidated,
}

/// Bridge lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Constructed, not started
    Uninitialized,
    /// Waiting for the first auth probe
    AwaitingAuthProbe,
    /// Auth, dataset shape, and URL are mutually consistent
    Settled,
    /// A re-fetch is in flight
    Refreshing(RefreshReason),
}

/// Configuration for the bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Query parameter carrying the active record id
    pub query_param: String,
    /// Fall back to the last path segment when the parameter is absent
    pub path_segment_fallback: bool,
    /// Whether this surface shows restricted records at all
    pub restricted_route: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            query_param: "item".to_string(),
            path_segment_fallback: false,
            restricted_route: false,
        }
    }
}

/// Orchestrates cache, auth, and history into one consistent view
pub struct Bridge {
    cache: Arc<DatasetCache>,
    auth: Arc<AuthWatcher>,
    history: Arc<HistorySynchronizer>,
    bus: EventBus,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    active: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
    running: AtomicBool,
}

impl Bridge {
    /// Create a bridge and register the logout scrub on the watcher
    ///
    /// The bridge is the only consumer permitted to trigger a cache write
    /// in response to an auth flip; the scrub runs synchronously with the
    /// flip to unauthenticated.
    pub fn new(
        cache: Arc<DatasetCache>,
        auth: Arc<AuthWatcher>,
        history: Arc<HistorySynchronizer>,
        bus: EventBus,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let scrub_cache = Arc::clone(&cache);
        auth.set_unauthenticated_sink(Box::new(move || {
            scrub_cache.scrub_confidential();
        }));

        Arc::new(Self {
            cache,
            auth,
            history,
            bus,
            config,
            state: Mutex::new(BridgeState::Uninitialized),
            active: Mutex::new(None),
            last_error: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Current machine state
    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap()
    }

    /// Last recorded refresh failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Active record id as bound to the URL
    pub fn active_record(&self) -> Option<String> {
        self.active.lock().unwrap().clone()
    }

    /// Resolve the active record through the uniform outcome
    pub fn resolve_active(&self) -> RecordOutcome {
        match self.active_record() {
            Some(id) => self.cache.resolve(&id),
            None => RecordOutcome::NotFound,
        }
    }

    fn set_state(&self, new_state: BridgeState) {
        let mut state = self.state.lock().unwrap();
        debug!("bridge state {:?} -> {:?}", *state, new_state);
        *state = new_state;
    }

    /// Shape the current auth state entitles this surface to
    fn desired_shape(&self, auth: AuthState) -> DatasetShape {
        if !self.config.restricted_route {
            DatasetShape::public()
        } else if auth == AuthState::Authenticated {
            DatasetShape::restricted_full()
        } else {
            DatasetShape::restricted_sanitized()
        }
    }

    /// Extract the desired record id from a location
    fn record_id_from(&self, pathname: &str, search: &str) -> Option<String> {
        if let Some(id) = query_param(search, &self.config.query_param) {
            return Some(id);
        }
        if self.config.path_segment_fallback {
            let segment = pathname
                .split('/')
                .filter(|s| !s.is_empty())
                .next_back()
                .map(|s| s.to_string());
            if segment.is_some() {
                return segment;
            }
        }
        None
    }

    /// Run the auth probe, perform the first fetch, and normalize the URL
    ///
    /// Transitions `Uninitialized → AwaitingAuthProbe → Settled` and starts
    /// the event loop.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("bridge already started");
            return;
        }

        self.set_state(BridgeState::AwaitingAuthProbe);
        let auth = self.auth.refresh().await;

        if let Err(e) = self
            .cache
            .initialize(
                InitializeOptions {
                    shape: self.desired_shape(auth),
                    force_refresh: false,
                },
                auth,
            )
            .await
        {
            warn!("initial fetch failed: {}", e);
            *self.last_error.lock().unwrap() = Some(e.to_string());
        }

        // One-time normalization of the arrival URL; a replace, so no
        // spurious back-step exists before any user action
        let current = self.history.current();
        let (pathname, search, _) = split_url(&current);
        let id = self.record_id_from(&pathname, &search);
        let state = match &id {
            Some(id) => NavState::for_record(id.clone()),
            None => NavState::default(),
        };
        self.history.replace_initial(&current, state);
        *self.active.lock().unwrap() = id;

        self.set_state(BridgeState::Settled);
        info!("bridge settled (auth: {:?})", auth);

        // Subscribe before spawning so nothing emitted from here on is lost
        let mut events = self.bus.subscribe();
        let bridge = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                if !bridge.running.load(Ordering::SeqCst) {
                    break;
                }
                match events.recv().await {
                    Ok(Event::RouteChanged { pathname, search }) => {
                        bridge.handle_route_changed(&pathname, &search).await;
                    }
                    Ok(Event::AuthChanged(auth)) => {
                        bridge.handle_auth_changed(auth).await;
                    }
                    Ok(Event::CacheInvalidated) => {
                        bridge.refresh(RefreshReason::CacheInvalidated).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("bridge lagged {} events, forcing refresh", n);
                        bridge.refresh(RefreshReason::CacheInvalidated).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Stop the event loop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Apply a deduplicated route change
    pub async fn handle_route_changed(&self, pathname: &str, search: &str) {
        let Some(id) = self.record_id_from(pathname, search) else {
            *self.active.lock().unwrap() = None;
            return;
        };
        if self.cache.get_record(&id).is_none() {
            self.refresh(RefreshReason::RecordMissing).await;
        }
        *self.active.lock().unwrap() = Some(id);
    }

    /// React to an auth transition
    pub async fn handle_auth_changed(&self, auth: AuthState) {
        let shape = self.desired_shape(auth);
        if !self.cache.matches_shape(shape) {
            self.refresh(RefreshReason::AuthChanged).await;
        }
    }

    /// Re-fetch through the gate; always resolves back to `Settled`
    ///
    /// Forced: the reasons that get here (missing record, auth flip,
    /// invalidation) all mean the current snapshot is suspect even when its
    /// shape matches.
    pub async fn refresh(&self, reason: RefreshReason) {
        self.set_state(BridgeState::Refreshing(reason));
        let auth = self.auth.state();
        let result = self
            .cache
            .initialize(
                InitializeOptions {
                    shape: self.desired_shape(auth),
                    force_refresh: true,
                },
                auth,
            )
            .await;
        match result {
            Ok(()) => {
                *self.last_error.lock().unwrap() = None;
            }
            Err(e) => {
                warn!("refresh({:?}) failed: {}", reason, e);
                *self.last_error.lock().unwrap() = Some(e.to_string());
            }
        }
        self.set_state(BridgeState::Settled);
    }

    /// Commit a user-driven navigation to a record
    ///
    /// Pushes the record id into the URL; the route observer will pick the
    /// change back up, completing the loop without a duplicate entry thanks
    /// to the signature dedup and the no-op push guard.
    pub fn navigate_to_record(&self, id: &str) {
        let (pathname, _, _) = split_url(&self.history.current());
        let url = format!(
            "{}?{}={}",
            pathname,
            self.config.query_param,
            urlencoding::encode(id)
        );
        *self.active.lock().unwrap() = Some(id.to_string());
        self.history.navigate_to(&url, NavState::for_record(id));
    }

    /// Advance to the next record in display order, wrapping
    pub fn navigate_next(&self) {
        if let Some((_, next)) = self
            .active_record()
            .and_then(|id| self.cache.neighbors(&id))
        {
            self.navigate_to_record(&next);
        }
    }

    /// Step to the previous record in display order, wrapping
    pub fn navigate_prev(&self) {
        if let Some((prev, _)) = self
            .active_record()
            .and_then(|id| self.cache.neighbors(&id))
        {
            self.navigate_to_record(&prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthWatcherConfig;
    use crate::fetch::{AuthProbe, DatasetFetcher, FetchedPayload};
    use crate::history::{HistoryBackend, HistoryConfig, MemoryHistory};
    use crate::record::{ConfidentialFields, Record};
    use crate::types::{PorticoError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StubProbe {
        authenticated: AtomicBool,
    }

    #[async_trait]
    impl AuthProbe for StubProbe {
        async fn probe(&self) -> Result<bool> {
            Ok(self.authenticated.load(Ordering::SeqCst))
        }
    }

    struct StubFetcher {
        calls: AtomicUsize,
        fail: AtomicBool,
        ids: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn new(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                ids: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl DatasetFetcher for StubFetcher {
        async fn fetch(&self, _shape: DatasetShape) -> Result<FetchedPayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(PorticoError::Transient("offline".to_string()));
            }
            let records = self
                .ids
                .lock()
                .unwrap()
                .iter()
                .enumerate()
                .map(|(i, id)| Record {
                    id: id.clone(),
                    order: i as u32,
                    restricted: false,
                    parent: None,
                    title: id.clone(),
                    summary: String::new(),
                    tags: Vec::new(),
                    confidential: ConfidentialFields::default(),
                })
                .collect();
            Ok(FetchedPayload {
                records,
                includes_restricted: false,
                fields_sanitized: true,
            })
        }
    }

    struct Harness {
        bridge: Arc<Bridge>,
        fetcher: Arc<StubFetcher>,
        backend: Arc<MemoryHistory>,
    }

    fn harness(ids: &[&str], authenticated: bool) -> Harness {
        let bus = EventBus::new();
        let fetcher = StubFetcher::new(ids);
        let cache = Arc::new(DatasetCache::new(
            Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>,
            bus.clone(),
        ));
        let probe = Arc::new(StubProbe {
            authenticated: AtomicBool::new(authenticated),
        });
        let auth = Arc::new(AuthWatcher::new(
            probe,
            bus.clone(),
            AuthWatcherConfig::default(),
        ));
        let backend = Arc::new(MemoryHistory::new("/work/").with_bus(bus.clone()));
        let history = Arc::new(HistorySynchronizer::new(
            Arc::clone(&backend) as Arc<dyn HistoryBackend>,
            HistoryConfig::default(),
        ));
        let bridge = Bridge::new(cache, auth, history, bus, BridgeConfig::default());
        Harness {
            bridge,
            fetcher,
            backend,
        }
    }

    #[tokio::test]
    async fn test_start_settles_after_probe_and_fetch() {
        let h = harness(&["a", "b"], false);
        assert_eq!(h.bridge.state(), BridgeState::Uninitialized);

        Arc::clone(&h.bridge).start().await;

        assert_eq!(h.bridge.state(), BridgeState::Settled);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        h.bridge.stop();
    }

    #[tokio::test]
    async fn test_initial_url_is_replaced_not_pushed() {
        let h = harness(&["a"], false);
        let before = h.backend.entry_count();
        Arc::clone(&h.bridge).start().await;
        assert_eq!(h.backend.entry_count(), before);
        assert_eq!(h.backend.current(), "/work/");
        h.bridge.stop();
    }

    #[tokio::test]
    async fn test_route_change_to_known_record_does_not_refetch() {
        let h = harness(&["a", "b"], false);
        Arc::clone(&h.bridge).start().await;

        h.bridge.handle_route_changed("/work/", "item=b").await;

        assert_eq!(h.bridge.active_record().as_deref(), Some("b"));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        h.bridge.stop();
    }

    #[tokio::test]
    async fn test_route_change_to_missing_record_refreshes() {
        let h = harness(&["a"], false);
        Arc::clone(&h.bridge).start().await;

        h.fetcher.ids.lock().unwrap().push("new".to_string());
        h.bridge.handle_route_changed("/work/", "item=new").await;

        // Missing record forced a second fetch, then settled
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.bridge.state(), BridgeState::Settled);
        assert_eq!(h.bridge.active_record().as_deref(), Some("new"));
        h.bridge.stop();
    }

    #[tokio::test]
    async fn test_refresh_failure_still_settles() {
        let h = harness(&["a"], false);
        Arc::clone(&h.bridge).start().await;

        h.fetcher.fail.store(true, Ordering::SeqCst);
        h.bridge.refresh(RefreshReason::CacheInvalidated).await;

        assert_eq!(h.bridge.state(), BridgeState::Settled);
        assert!(h.bridge.last_error().is_some());
        // Stale-but-safe: the previous snapshot is still served
        assert!(matches!(h.bridge.resolve_active(), RecordOutcome::NotFound));
        h.bridge.stop();
    }

    #[tokio::test]
    async fn test_navigate_to_record_pushes_query_url() {
        let h = harness(&["a", "b"], false);
        Arc::clone(&h.bridge).start().await;

        h.bridge.navigate_to_record("b");

        assert_eq!(h.backend.current(), "/work/?item=b");
        assert_eq!(h.backend.current_state(), NavState::for_record("b"));
        assert_eq!(h.bridge.active_record().as_deref(), Some("b"));
        h.bridge.stop();
    }

    #[tokio::test]
    async fn test_navigate_next_wraps() {
        let h = harness(&["a", "b"], false);
        Arc::clone(&h.bridge).start().await;
        h.bridge.navigate_to_record("b");

        h.bridge.navigate_next();
        assert_eq!(h.bridge.active_record().as_deref(), Some("a"));

        h.bridge.navigate_prev();
        assert_eq!(h.bridge.active_record().as_deref(), Some("b"));
        h.bridge.stop();
    }

    #[tokio::test]
    async fn test_path_segment_fallback() {
        let bus = EventBus::new();
        let fetcher = StubFetcher::new(&["about"]);
        let cache = Arc::new(DatasetCache::new(
            Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>,
            bus.clone(),
        ));
        let auth = Arc::new(AuthWatcher::new(
            Arc::new(StubProbe {
                authenticated: AtomicBool::new(false),
            }),
            bus.clone(),
            AuthWatcherConfig::default(),
        ));
        let backend = Arc::new(MemoryHistory::new("/work/about/"));
        let history = Arc::new(HistorySynchronizer::new(
            Arc::clone(&backend) as Arc<dyn HistoryBackend>,
            HistoryConfig::default(),
        ));
        let bridge = Bridge::new(
            cache,
            auth,
            history,
            bus,
            BridgeConfig {
                path_segment_fallback: true,
                ..Default::default()
            },
        );

        Arc::clone(&bridge).start().await;
        assert_eq!(bridge.active_record().as_deref(), Some("about"));
        bridge.stop();
    }
}
