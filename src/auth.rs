//! Auth state watcher
//!
//! Tracks whether the current session is authenticated via an initial
//! probe, periodic re-probing, and event-driven re-probing (tab visibility,
//! window focus). Concurrent `refresh()` callers coalesce onto a single
//! in-flight probe. A transition to unauthenticated runs the registered
//! scrub sink synchronously with the flip, so no frame can render stale
//! confidential data after logout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::fetch::AuthProbe;

/// Default interval between periodic probes
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Default per-probe timeout; a hung probe is treated as unauthenticated
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Session authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Not yet probed
    Unknown,
    /// Probe confirmed an active session
    Authenticated,
    /// Probe found no session, or an explicit logout occurred
    Unauthenticated,
}

/// Configuration for the auth watcher
#[derive(Debug, Clone)]
pub struct AuthWatcherConfig {
    /// Interval between periodic probes
    pub probe_interval: Duration,
    /// Timeout applied to each probe
    pub probe_timeout: Duration,
}

impl Default for AuthWatcherConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Role a `refresh()` caller takes for the in-flight probe
enum ProbeRole {
    Leader(watch::Sender<Option<AuthState>>),
    Follower(watch::Receiver<Option<AuthState>>),
}

/// Watches session authentication state
pub struct AuthWatcher {
    probe: Arc<dyn AuthProbe>,
    state: watch::Sender<AuthState>,
    /// Present while a probe is in flight; followers clone the receiver
    inflight: Mutex<Option<watch::Receiver<Option<AuthState>>>>,
    bus: EventBus,
    config: AuthWatcherConfig,
    /// Invoked synchronously on every transition to unauthenticated
    unauthenticated_sink: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    running: AtomicBool,
}

impl AuthWatcher {
    /// Create a watcher; state starts `Unknown` until the first probe
    pub fn new(probe: Arc<dyn AuthProbe>, bus: EventBus, config: AuthWatcherConfig) -> Self {
        let (state, _) = watch::channel(AuthState::Unknown);
        Self {
            probe,
            state,
            inflight: Mutex::new(None),
            bus,
            config,
            unauthenticated_sink: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Current state
    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Register the sink run synchronously when the session ends
    ///
    /// The bridge installs the confidential-field scrub here; it is the only
    /// consumer permitted to trigger a cache write in response to an auth
    /// flip.
    pub fn set_unauthenticated_sink(&self, sink: Box<dyn Fn() + Send + Sync>) {
        *self.unauthenticated_sink.lock().unwrap() = Some(sink);
    }

    /// Perform a probe, coalescing with any probe already in flight
    ///
    /// Callers arriving while a probe is running await its result instead
    /// of issuing a duplicate request.
    pub async fn refresh(&self) -> AuthState {
        let role = {
            let mut guard = self.inflight.lock().unwrap();
            match guard.as_ref() {
                Some(rx) => ProbeRole::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *guard = Some(rx);
                    ProbeRole::Leader(tx)
                }
            }
        };

        match role {
            ProbeRole::Follower(mut rx) => loop {
                if let Some(state) = *rx.borrow() {
                    return state;
                }
                if rx.changed().await.is_err() {
                    // Leader dropped without publishing; fall back to current state
                    return self.state();
                }
            },
            ProbeRole::Leader(tx) => {
                let outcome =
                    tokio::time::timeout(self.config.probe_timeout, self.probe.probe()).await;
                let authenticated = match outcome {
                    Ok(Ok(v)) => v,
                    Ok(Err(e)) => {
                        warn!("auth probe failed: {}", e);
                        false
                    }
                    Err(_) => {
                        warn!("auth probe timed out after {:?}", self.config.probe_timeout);
                        false
                    }
                };
                let new_state = if authenticated {
                    AuthState::Authenticated
                } else {
                    AuthState::Unauthenticated
                };
                self.apply(new_state);
                *self.inflight.lock().unwrap() = None;
                let _ = tx.send(Some(new_state));
                new_state
            }
        }
    }

    /// Flip to unauthenticated immediately, without waiting for a round trip
    pub fn logout(&self) {
        info!("explicit logout, flipping to unauthenticated");
        self.apply(AuthState::Unauthenticated);
    }

    /// Apply a new state: flip, run the scrub sink, then publish the event
    fn apply(&self, new_state: AuthState) {
        let prev = *self.state.borrow();
        if prev == new_state {
            return;
        }
        debug!("auth state {:?} -> {:?}", prev, new_state);
        self.state.send_replace(new_state);
        if new_state == AuthState::Unauthenticated {
            if let Some(sink) = self.unauthenticated_sink.lock().unwrap().as_ref() {
                sink();
            }
        }
        self.bus.emit(Event::AuthChanged(new_state));
    }

    /// Start periodic and event-driven re-probing
    ///
    /// The first interval tick fires immediately, performing the initial
    /// probe. Visibility and focus events on the bus also trigger probes.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("auth watcher already running");
            return;
        }
        info!("starting auth watcher (interval: {:?})", self.config.probe_interval);

        let mut events = self.bus.subscribe();
        let watcher = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.config.probe_interval);
            loop {
                if !watcher.running.load(Ordering::SeqCst) {
                    info!("auth watcher stopped");
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {
                        watcher.refresh().await;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(Event::VisibilityVisible) | Ok(Event::WindowFocus) => {
                                watcher.refresh().await;
                            }
                            Ok(_) => {}
                            Err(_) => {}
                        }
                    }
                }
            }
        });
    }

    /// Stop the probing loop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
