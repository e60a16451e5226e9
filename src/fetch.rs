//! Backend collaborators: dataset fetch and auth probe contracts
//!
//! Both are consumed over plain GET endpoints. Traits keep the engine
//! testable without a network; the HTTP implementations are the production
//! path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::Record;
use crate::types::{PorticoError, Result};

/// The dataset shape a caller is requesting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetShape {
    /// Whether restricted records should be present in the payload at all
    pub include_restricted: bool,
    /// Whether confidential fields must arrive redacted
    pub sanitized: bool,
}

impl DatasetShape {
    /// Public surface: no restricted records, sanitized by definition
    pub fn public() -> Self {
        Self {
            include_restricted: false,
            sanitized: true,
        }
    }

    /// Restricted surface for an unauthenticated caller: records present,
    /// confidential fields redacted
    pub fn restricted_sanitized() -> Self {
        Self {
            include_restricted: true,
            sanitized: true,
        }
    }

    /// Restricted surface for an authenticated caller
    pub fn restricted_full() -> Self {
        Self {
            include_restricted: true,
            sanitized: false,
        }
    }
}

/// Payload returned by the dataset endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPayload {
    /// Records, already shaped by the server
    pub records: Vec<Record>,
    /// Whether restricted records are included
    #[serde(rename = "includesRestricted")]
    pub includes_restricted: bool,
    /// Whether confidential fields were redacted server-side
    #[serde(rename = "fieldsSanitized")]
    pub fields_sanitized: bool,
}

/// Source of dataset snapshots
#[async_trait]
pub trait DatasetFetcher: Send + Sync {
    /// Fetch a payload matching the requested shape
    async fn fetch(&self, shape: DatasetShape) -> Result<FetchedPayload>;
}

/// HTTP dataset fetcher hitting the content endpoint
pub struct HttpFetcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFetcher {
    /// Create a fetcher for the given endpoint URL
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl DatasetFetcher for HttpFetcher {
    async fn fetch(&self, shape: DatasetShape) -> Result<FetchedPayload> {
        let url = format!(
            "{}?includeRestricted={}&sanitized={}",
            self.endpoint, shape.include_restricted, shape.sanitized
        );
        debug!("fetching dataset: {}", url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(PorticoError::Transient(format!(
                "dataset fetch returned {}",
                resp.status()
            )));
        }
        let payload: FetchedPayload = resp.json().await?;
        Ok(payload)
    }
}

/// Source of auth probe results
#[async_trait]
pub trait AuthProbe: Send + Sync {
    /// Probe the session endpoint; `Ok(true)` means authenticated
    async fn probe(&self) -> Result<bool>;
}

/// HTTP auth probe against the identity endpoint
///
/// 200 with an identity object in the body means authenticated; 401 and
/// every other status mean not.
pub struct HttpAuthProbe {
    client: reqwest::Client,
    endpoint: String,
}

/// A probe counts as authenticated only when the identity body is an object
fn identity_confirms(status: reqwest::StatusCode, identity: &serde_json::Value) -> bool {
    status == reqwest::StatusCode::OK && identity.is_object()
}

impl HttpAuthProbe {
    /// Create a probe for the given identity endpoint URL
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AuthProbe for HttpAuthProbe {
    async fn probe(&self) -> Result<bool> {
        let resp = self.client.get(&self.endpoint).send().await?;
        let status = resp.status();
        debug!("auth probe returned {}", status);
        if status != reqwest::StatusCode::OK {
            return Ok(false);
        }
        let identity: serde_json::Value = resp.json().await?;
        Ok(identity_confirms(status, &identity))
    }
}
