//! Dataset cache
//!
//! Holds the last-fetched snapshot of content records plus the shape it was
//! fetched with. Snapshots are replaced atomically under one lock; readers
//! never observe a partial update. All installs go through the sanitization
//! gate, and results are applied in epoch order so a slow, earlier-issued
//! fetch can never clobber a newer one.
//!
//! Failure semantics: a failed fetch leaves the previous snapshot in place
//! (stale but safe); an integrity violation discards the payload entirely.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::events::{Event, EventBus};
use crate::fetch::{DatasetFetcher, DatasetShape, FetchedPayload};
use crate::record::{DatasetSnapshot, Record, RecordOutcome};
use crate::sanitize::{sanitize_snapshot, verify_snapshot, SanitizedSnapshot};
use crate::types::{PorticoError, Result};

/// Options for [`DatasetCache::initialize`]
#[derive(Debug, Clone, Copy)]
pub struct InitializeOptions {
    /// Requested dataset shape
    pub shape: DatasetShape,
    /// Fetch even if the current shape already matches
    pub force_refresh: bool,
}

/// In-memory dataset cache, explicitly constructed and injected
///
/// One instance per page lifetime; never persisted across reloads.
pub struct DatasetCache {
    fetcher: Arc<dyn DatasetFetcher>,
    /// Current snapshot; `None` until the first install
    snapshot: RwLock<Option<Arc<DatasetSnapshot>>>,
    /// Issue counter for epochs, bumped before every suspension point
    issue: AtomicU64,
    /// Set by `invalidate`, cleared by the next successful install
    dirty: AtomicBool,
    bus: EventBus,
}

impl DatasetCache {
    /// Create an empty cache backed by the given fetcher
    pub fn new(fetcher: Arc<dyn DatasetFetcher>, bus: EventBus) -> Self {
        Self {
            fetcher,
            snapshot: RwLock::new(None),
            issue: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            bus,
        }
    }

    /// Fetch a fresh snapshot and replace the cache atomically
    ///
    /// A request for restricted records with sanitization disabled while not
    /// authenticated is rejected before any network call. A failed fetch
    /// keeps the previous snapshot and returns a recoverable error.
    pub async fn initialize(&self, opts: InitializeOptions, auth: AuthState) -> Result<()> {
        let shape = opts.shape;
        if shape.include_restricted && !shape.sanitized && auth != AuthState::Authenticated {
            return Err(PorticoError::Integrity(
                "refusing to fetch unsanitized restricted data while not authenticated"
                    .to_string(),
            ));
        }

        if !opts.force_refresh && !self.dirty.load(Ordering::SeqCst) && self.matches_shape(shape) {
            debug!("cache shape already matches, skipping fetch");
            return Ok(());
        }

        // Issue the epoch before suspending so completion order cannot
        // reorder application order
        let epoch = self.issue.fetch_add(1, Ordering::SeqCst) + 1;

        let payload = self.fetcher.fetch(shape).await?;
        let sanitized = self.admit(payload, auth, shape)?;
        self.install(sanitized, epoch);
        Ok(())
    }

    /// Install a pre-fetched snapshot synchronously, without a network trip
    ///
    /// Used for server-rendered payloads to avoid a loading flash on first
    /// paint. The payload still passes through the gate.
    pub fn hydrate(&self, payload: FetchedPayload, auth: AuthState, shape: DatasetShape) -> Result<()> {
        let epoch = self.issue.fetch_add(1, Ordering::SeqCst) + 1;
        let sanitized = self.admit(payload, auth, shape)?;
        self.install(sanitized, epoch);
        Ok(())
    }

    /// Validate a raw payload against its own claims, then mirror the
    /// server-side sanitization for the requested shape
    fn admit(
        &self,
        payload: FetchedPayload,
        auth: AuthState,
        shape: DatasetShape,
    ) -> Result<SanitizedSnapshot> {
        let raw = DatasetSnapshot::new(
            payload.records,
            payload.includes_restricted,
            payload.fields_sanitized,
        );
        let verified = verify_snapshot(raw, auth)?;
        // Defense in depth: re-shape locally even when the server already
        // claims the right shape
        Ok(sanitize_snapshot(
            verified.snapshot(),
            auth,
            shape.include_restricted,
        ))
    }

    /// Atomically replace the snapshot, discarding stale results
    fn install(&self, sanitized: SanitizedSnapshot, epoch: u64) {
        let mut inner = sanitized.into_inner();
        inner.epoch = epoch;
        let mut guard = self.snapshot.write().unwrap();
        if let Some(current) = guard.as_ref() {
            if current.epoch >= epoch {
                debug!(
                    "discarding stale fetch result (epoch {} <= installed {})",
                    epoch, current.epoch
                );
                return;
            }
        }
        info!(
            "cache replaced: {} records, includes_restricted={}, sanitized={}, epoch={}",
            inner.len(),
            inner.includes_restricted,
            inner.fields_sanitized,
            epoch
        );
        *guard = Some(Arc::new(inner));
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Look up a record by id; never errors
    pub fn get_record(&self, id: &str) -> Option<Record> {
        self.snapshot
            .read()
            .unwrap()
            .as_ref()
            .and_then(|s| s.get(id).cloned())
    }

    /// Previous/next id in display order, wrapping circularly
    pub fn neighbors(&self, id: &str) -> Option<(String, String)> {
        self.snapshot
            .read()
            .unwrap()
            .as_ref()
            .and_then(|s| s.neighbors(id))
    }

    /// Read-only view of the current snapshot
    pub fn snapshot(&self) -> Option<Arc<DatasetSnapshot>> {
        self.snapshot.read().unwrap().clone()
    }

    /// Shape of the current snapshot, `None` before the first install
    pub fn shape(&self) -> Option<DatasetShape> {
        self.snapshot.read().unwrap().as_ref().map(|s| DatasetShape {
            include_restricted: s.includes_restricted,
            sanitized: s.fields_sanitized,
        })
    }

    /// Whether the current snapshot already satisfies the requested shape
    pub fn matches_shape(&self, shape: DatasetShape) -> bool {
        self.shape() == Some(shape)
    }

    /// Epoch of the installed snapshot, 0 before the first install
    pub fn epoch(&self) -> u64 {
        self.snapshot
            .read()
            .unwrap()
            .as_ref()
            .map(|s| s.epoch)
            .unwrap_or(0)
    }

    /// Mark the cache stale and notify subscribers
    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.bus.emit(Event::CacheInvalidated);
    }

    /// Whether an invalidation is pending
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Synchronously redact every confidential field in place
    ///
    /// Runs when the session ends; no network, no await point, so no frame
    /// can observe the pre-scrub snapshot after this returns.
    pub fn scrub_confidential(&self) {
        let mut guard = self.snapshot.write().unwrap();
        let Some(current) = guard.as_ref() else {
            return;
        };
        let epoch = self.issue.fetch_add(1, Ordering::SeqCst) + 1;
        let scrubbed = sanitize_snapshot(
            current,
            AuthState::Unauthenticated,
            current.includes_restricted,
        );
        let mut inner = scrubbed.into_inner();
        inner.epoch = epoch;
        warn!("scrubbed confidential fields from cached snapshot");
        *guard = Some(Arc::new(inner));
    }

    /// Resolve a record to a uniform outcome
    ///
    /// Wrong auth, fetch failure, and a genuinely absent record all yield
    /// `NotFound`; the distinction is not surfaced.
    pub fn resolve(&self, id: &str) -> RecordOutcome {
        match self.get_record(id) {
            Some(record) => RecordOutcome::Found(record),
            None => RecordOutcome::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ConfidentialFields, Record};
    use crate::sanitize::CONFIDENTIAL_PLACEHOLDER;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn public_record(id: &str, order: u32) -> Record {
        Record {
            id: id.to_string(),
            order,
            restricted: false,
            parent: None,
            title: format!("Title {id}"),
            summary: String::new(),
            tags: Vec::new(),
            confidential: ConfidentialFields::default(),
        }
    }

    fn restricted_record(id: &str, order: u32, client: &str) -> Record {
        Record {
            id: id.to_string(),
            order,
            restricted: true,
            parent: None,
            title: format!("Title {id}"),
            summary: String::new(),
            tags: Vec::new(),
            confidential: ConfidentialFields {
                client_name: Some(client.to_string()),
                contact_email: None,
                internal_notes: None,
            },
        }
    }

    /// Scripted fetcher: each call pops the next (delay, payload) entry
    struct StubFetcher {
        calls: AtomicUsize,
        script: std::sync::Mutex<Vec<(Duration, Result<FetchedPayload>)>>,
    }

    impl StubFetcher {
        fn new(script: Vec<(Duration, Result<FetchedPayload>)>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: std::sync::Mutex::new(script),
            })
        }

        fn single(payload: FetchedPayload) -> Arc<Self> {
            Self::new(vec![(Duration::ZERO, Ok(payload))])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DatasetFetcher for StubFetcher {
        async fn fetch(&self, _shape: DatasetShape) -> Result<FetchedPayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, result) = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    return Err(PorticoError::Transient("script exhausted".to_string()));
                }
                script.remove(0)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }

    fn public_payload(ids: &[&str]) -> FetchedPayload {
        FetchedPayload {
            records: ids
                .iter()
                .enumerate()
                .map(|(i, id)| public_record(id, i as u32))
                .collect(),
            includes_restricted: false,
            fields_sanitized: true,
        }
    }

    fn opts(shape: DatasetShape) -> InitializeOptions {
        InitializeOptions {
            shape,
            force_refresh: false,
        }
    }

    #[tokio::test]
    async fn test_initialize_installs_snapshot() {
        let fetcher = StubFetcher::single(public_payload(&["a", "b"]));
        let cache = DatasetCache::new(fetcher, EventBus::new());

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();

        assert!(cache.get_record("a").is_some());
        assert_eq!(
            cache.neighbors("a").unwrap(),
            ("b".to_string(), "b".to_string())
        );
        assert_eq!(cache.epoch(), 1);
    }

    #[tokio::test]
    async fn test_matching_shape_skips_fetch() {
        let fetcher = StubFetcher::new(vec![
            (Duration::ZERO, Ok(public_payload(&["a"]))),
            (Duration::ZERO, Ok(public_payload(&["b"]))),
        ]);
        let cache = DatasetCache::new(Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>, EventBus::new());

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();
        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert!(cache.get_record("a").is_some());
    }

    #[tokio::test]
    async fn test_force_refresh_fetches_again() {
        let fetcher = StubFetcher::new(vec![
            (Duration::ZERO, Ok(public_payload(&["a"]))),
            (Duration::ZERO, Ok(public_payload(&["b"]))),
        ]);
        let cache = DatasetCache::new(Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>, EventBus::new());

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();
        cache
            .initialize(
                InitializeOptions {
                    shape: DatasetShape::public(),
                    force_refresh: true,
                },
                AuthState::Unauthenticated,
            )
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), 2);
        assert!(cache.get_record("b").is_some());
        assert!(cache.get_record("a").is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_unsanitized_request_rejected_pre_network() {
        let fetcher = StubFetcher::single(public_payload(&["a"]));
        let cache = DatasetCache::new(Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>, EventBus::new());

        let err = cache
            .initialize(opts(DatasetShape::restricted_full()), AuthState::Unauthenticated)
            .await
            .unwrap_err();

        assert!(matches!(err, PorticoError::Integrity(_)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_previous_snapshot() {
        let fetcher = StubFetcher::new(vec![
            (Duration::ZERO, Ok(public_payload(&["a"]))),
            (
                Duration::ZERO,
                Err(PorticoError::Transient("offline".to_string())),
            ),
        ]);
        let cache = DatasetCache::new(fetcher, EventBus::new());

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();
        let err = cache
            .initialize(
                InitializeOptions {
                    shape: DatasetShape::public(),
                    force_refresh: true,
                },
                AuthState::Unauthenticated,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PorticoError::Transient(_)));
        assert!(cache.get_record("a").is_some());
    }

    #[tokio::test]
    async fn test_integrity_violation_discards_payload() {
        // Server claims sanitized but ships a verbatim confidential value
        let bad = FetchedPayload {
            records: vec![restricted_record("priv", 0, "Secret Co.")],
            includes_restricted: true,
            fields_sanitized: true,
        };
        let fetcher = StubFetcher::new(vec![
            (Duration::ZERO, Ok(public_payload(&["a"]))),
            (Duration::ZERO, Ok(bad)),
        ]);
        let cache = DatasetCache::new(fetcher, EventBus::new());

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();
        let err = cache
            .initialize(
                InitializeOptions {
                    shape: DatasetShape::restricted_sanitized(),
                    force_refresh: true,
                },
                AuthState::Unauthenticated,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PorticoError::Integrity(_)));
        // Previous snapshot untouched, nothing partially applied
        assert!(cache.get_record("a").is_some());
        assert!(cache.get_record("priv").is_none());
    }

    #[tokio::test]
    async fn test_mirror_drops_restricted_for_public_shape() {
        // Server over-shares restricted records despite the public request
        let oversharing = FetchedPayload {
            records: vec![public_record("pub", 0), restricted_record("priv", 1, "Secret Co.")],
            includes_restricted: true,
            fields_sanitized: false,
        };
        let fetcher = StubFetcher::single(oversharing);
        let cache = DatasetCache::new(fetcher, EventBus::new());

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Authenticated)
            .await
            .unwrap();

        // Existence itself must not leak on the public shape
        assert!(cache.get_record("priv").is_none());
        assert!(cache.get_record("pub").is_some());
        assert!(!cache.snapshot().unwrap().includes_restricted);
    }

    #[tokio::test]
    async fn test_epoch_ordering_later_issue_wins() {
        // First fetch is slow, second resolves immediately
        let fetcher = StubFetcher::new(vec![
            (Duration::from_millis(50), Ok(public_payload(&["slow"]))),
            (Duration::ZERO, Ok(public_payload(&["fast"]))),
        ]);
        let cache = Arc::new(DatasetCache::new(
            Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>,
            EventBus::new(),
        ));

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .initialize(
                        InitializeOptions {
                            shape: DatasetShape::public(),
                            force_refresh: true,
                        },
                        AuthState::Unauthenticated,
                    )
                    .await
            }
        });
        // Make sure the slow fetch is issued before the fast one
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .initialize(
                        InitializeOptions {
                            shape: DatasetShape::public(),
                            force_refresh: true,
                        },
                        AuthState::Unauthenticated,
                    )
                    .await
            }
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // The later-issued fetch wins even though it resolved first
        assert!(cache.get_record("fast").is_some());
        assert!(cache.get_record("slow").is_none());
    }

    #[tokio::test]
    async fn test_hydrate_installs_without_fetch() {
        let fetcher = StubFetcher::new(Vec::new());
        let cache = DatasetCache::new(Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>, EventBus::new());

        cache
            .hydrate(
                public_payload(&["a"]),
                AuthState::Unauthenticated,
                DatasetShape::public(),
            )
            .unwrap();

        assert!(cache.get_record("a").is_some());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_scrub_confidential_is_synchronous() {
        let payload = FetchedPayload {
            records: vec![restricted_record("priv", 0, "Secret Co.")],
            includes_restricted: true,
            fields_sanitized: false,
        };
        let fetcher = StubFetcher::single(payload);
        let cache = DatasetCache::new(fetcher, EventBus::new());

        cache
            .initialize(opts(DatasetShape::restricted_full()), AuthState::Authenticated)
            .await
            .unwrap();
        assert_eq!(
            cache.get_record("priv").unwrap().confidential.client_name.as_deref(),
            Some("Secret Co.")
        );

        cache.scrub_confidential();

        assert_eq!(
            cache.get_record("priv").unwrap().confidential.client_name.as_deref(),
            Some(CONFIDENTIAL_PLACEHOLDER)
        );
        assert!(cache.snapshot().unwrap().fields_sanitized);
    }

    #[tokio::test]
    async fn test_invalidate_emits_and_forces_refetch() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let fetcher = StubFetcher::new(vec![
            (Duration::ZERO, Ok(public_payload(&["a"]))),
            (Duration::ZERO, Ok(public_payload(&["a2"]))),
        ]);
        let cache = DatasetCache::new(Arc::clone(&fetcher) as Arc<dyn DatasetFetcher>, bus);

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();
        cache.invalidate();
        assert!(matches!(rx.recv().await.unwrap(), Event::CacheInvalidated));

        cache
            .initialize(opts(DatasetShape::public()), AuthState::Unauthenticated)
            .await
            .unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(!cache.is_dirty());
    }

    #[tokio::test]
    async fn test_resolve_is_uniform() {
        let fetcher = StubFetcher::new(Vec::new());
        let cache = DatasetCache::new(fetcher, EventBus::new());
        // No snapshot at all: still NotFound, not an error
        assert_eq!(cache.resolve("anything"), RecordOutcome::NotFound);
    }
}
