//! Route change observer
//!
//! Converts external navigation signals (popstate, hash change, synthetic
//! app events) and internal framework navigation into a single deduplicated
//! route-changed notification. The last-delivered composed signature
//! suppresses repeats regardless of origin.
//!
//! `ExternalFirst` exists because some framework routers announce a
//! navigation before the URL actually settles; preferring the external
//! signal within a short grace window avoids consumers reading a stale
//! location.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};

/// Default grace window before falling back to the framework signal
const DEFAULT_GRACE: Duration = Duration::from_millis(150);

/// Which navigation signals the observer reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// React only to the framework router's own notifications
    FrameworkOnly,
    /// React only to external signals, ignoring the framework router
    ExternalOnly,
    /// Prefer an external signal; fall back to the framework one after a
    /// grace window
    ExternalFirst,
}

/// Configuration for the route observer
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Delivery mode
    pub mode: DeliveryMode,
    /// Grace window used by `ExternalFirst`
    pub grace: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::ExternalFirst,
            grace: DEFAULT_GRACE,
        }
    }
}

/// Deduplicating route change observer
pub struct RouteObserver {
    config: ObserverConfig,
    bus: EventBus,
    /// Last delivered composed signature, shared with deferred deliveries
    last: Arc<Mutex<Option<String>>>,
    /// Bumped on every external delivery; cancels pending framework
    /// fallbacks
    external_generation: Arc<AtomicU64>,
    running: AtomicBool,
}

/// Deliver if the signature differs from the last delivered one
fn deliver(bus: &EventBus, last: &Mutex<Option<String>>, pathname: &str, search: &str) -> bool {
    let sig = if search.is_empty() {
        pathname.to_string()
    } else {
        format!("{pathname}?{search}")
    };
    {
        let mut last = last.lock().unwrap();
        if last.as_deref() == Some(sig.as_str()) {
            debug!("route change suppressed, signature unchanged: {}", sig);
            return false;
        }
        *last = Some(sig);
    }
    bus.emit(Event::RouteChanged {
        pathname: pathname.to_string(),
        search: search.to_string(),
    });
    true
}

impl RouteObserver {
    /// Create an observer emitting `RouteChanged` on the given bus
    pub fn new(bus: EventBus, config: ObserverConfig) -> Self {
        Self {
            config,
            bus,
            last: Arc::new(Mutex::new(None)),
            external_generation: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
        }
    }

    /// Feed an external navigation signal (popstate, hash change, synthetic
    /// app event)
    pub fn notify_external(&self, pathname: &str, search: &str) -> bool {
        if self.config.mode == DeliveryMode::FrameworkOnly {
            return false;
        }
        self.external_generation.fetch_add(1, Ordering::SeqCst);
        deliver(&self.bus, &self.last, pathname, search)
    }

    /// Feed a framework router notification
    ///
    /// In `ExternalFirst` mode, delivery is deferred for the grace window;
    /// an external signal arriving first supersedes it.
    pub fn notify_framework(&self, pathname: &str, search: &str) -> bool {
        match self.config.mode {
            DeliveryMode::ExternalOnly => false,
            DeliveryMode::FrameworkOnly => deliver(&self.bus, &self.last, pathname, search),
            DeliveryMode::ExternalFirst => {
                // Without a runtime to defer on, the grace window collapses
                // and the framework signal delivers immediately
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return deliver(&self.bus, &self.last, pathname, search);
                };
                let observed = self.external_generation.load(Ordering::SeqCst);
                let generation = Arc::clone(&self.external_generation);
                let bus = self.bus.clone();
                let last = Arc::clone(&self.last);
                let pathname = pathname.to_string();
                let search = search.to_string();
                let grace = self.config.grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if generation.load(Ordering::SeqCst) != observed {
                        debug!("framework signal superseded by external signal");
                        return;
                    }
                    deliver(&bus, &last, &pathname, &search);
                });
                true
            }
        }
    }

    /// Start forwarding external bus signals into the observer
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("route observer already running");
            return;
        }
        if self.config.mode == DeliveryMode::FrameworkOnly {
            return;
        }
        info!("starting route observer ({:?})", self.config.mode);

        let mut events = self.bus.subscribe();
        let observer = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                if !observer.running.load(Ordering::SeqCst) {
                    break;
                }
                match events.recv().await {
                    Ok(Event::PopState { pathname, search, .. })
                    | Ok(Event::HashChanged { pathname, search }) => {
                        observer.notify_external(&pathname, &search);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("route observer lagged {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Stop the forwarding loop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
