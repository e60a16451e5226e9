//! Configuration for portico
//!
//! Plain config structs with defaults and environment overrides. Component
//! configs live next to their components; this module aggregates them and
//! handles the environment.

use std::time::Duration;

use crate::auth::AuthWatcherConfig;
use crate::bridge::BridgeConfig;
use crate::history::HistoryConfig;
use crate::observer::{DeliveryMode, ObserverConfig};

/// Aggregated engine configuration
#[derive(Debug, Clone, Default)]
pub struct PorticoConfig {
    /// Auth watcher settings
    pub auth: AuthWatcherConfig,
    /// History synchronizer settings
    pub history: HistoryConfig,
    /// Route observer settings
    pub observer: ObserverConfig,
    /// Bridge settings
    pub bridge: BridgeConfig,
}

/// Parse a boolean environment value ("1"/"true"/"yes", case-insensitive)
fn parse_bool(val: &str) -> bool {
    matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl PorticoConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PORTICO_PROBE_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.auth.probe_interval = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("PORTICO_PROBE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.auth.probe_timeout = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("PORTICO_DOUBLE_PUSH") {
            config.history.double_push = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("PORTICO_ROUTE_MODE") {
            config.observer.mode = match val.as_str() {
                "framework" => DeliveryMode::FrameworkOnly,
                "external" => DeliveryMode::ExternalOnly,
                _ => DeliveryMode::ExternalFirst,
            };
        }

        if let Ok(val) = std::env::var("PORTICO_ROUTE_GRACE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.observer.grace = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("PORTICO_QUERY_PARAM") {
            if !val.is_empty() {
                config.bridge.query_param = val;
            }
        }

        if let Ok(val) = std::env::var("PORTICO_PATH_SEGMENT_FALLBACK") {
            config.bridge.path_segment_fallback = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("PORTICO_RESTRICTED_ROUTE") {
            config.bridge.restricted_route = parse_bool(&val);
        }

        config
    }
}
