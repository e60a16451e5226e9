//! Sanitization gate between raw backend payloads and the dataset cache
//!
//! Pure, deterministic field-level redaction. The server applies the same
//! rules; this module mirrors them client-side for defense in depth and is
//! the only code path that can construct a [`SanitizedSnapshot`], which is
//! the only type the cache accepts for installation.
//!
//! Rules:
//! - Confidential fields pass through verbatim only when the caller is
//!   authenticated.
//! - Otherwise every present confidential field becomes the stable
//!   placeholder, so sanitizing twice is byte-identical to sanitizing once.
//! - A record whose parent restriction could not be resolved is treated as
//!   restricted.

use tracing::warn;

use crate::auth::AuthState;
use crate::record::{DatasetSnapshot, Record};
use crate::types::{PorticoError, Result};

/// Stable placeholder substituted for confidential field values
pub const CONFIDENTIAL_PLACEHOLDER: &str = "[restricted]";

/// A snapshot that has passed through the gate
///
/// The cache's write methods accept only this type; the private field keeps
/// construction confined to this module.
#[derive(Debug, Clone)]
pub struct SanitizedSnapshot(DatasetSnapshot);

impl SanitizedSnapshot {
    /// Consume the wrapper
    pub fn into_inner(self) -> DatasetSnapshot {
        self.0
    }

    /// Borrow the inner snapshot
    pub fn snapshot(&self) -> &DatasetSnapshot {
        &self.0
    }
}

/// Sanitize a single record for the given auth state
///
/// Pure and idempotent: placeholders sanitize to themselves.
pub fn sanitize_record(record: &Record, auth: AuthState) -> Record {
    let mut out = record.clone();
    if auth == AuthState::Authenticated || !record.effective_restriction() {
        return out;
    }
    if let Some(v) = &mut out.confidential.client_name {
        *v = CONFIDENTIAL_PLACEHOLDER.to_string();
    }
    if let Some(v) = &mut out.confidential.contact_email {
        *v = CONFIDENTIAL_PLACEHOLDER.to_string();
    }
    if let Some(v) = &mut out.confidential.internal_notes {
        *v = CONFIDENTIAL_PLACEHOLDER.to_string();
    }
    out
}

/// Sanitize a whole snapshot for the given auth state and requested shape
///
/// When `include_restricted` is false, restricted records are removed
/// entirely; their existence must not leak through key presence. Otherwise
/// they are kept with confidential fields redacted for unauthenticated
/// callers.
pub fn sanitize_snapshot(
    snapshot: &DatasetSnapshot,
    auth: AuthState,
    include_restricted: bool,
) -> SanitizedSnapshot {
    let authenticated = auth == AuthState::Authenticated;
    let inner = if include_restricted {
        snapshot.map_records(true, !authenticated, |r| sanitize_record(r, auth))
    } else {
        snapshot.filter_records(false, true, |r| !r.effective_restriction())
    };
    SanitizedSnapshot(inner)
}

/// Verify a snapshot that claims to already satisfy the shape invariants
///
/// Used for hydration of pre-fetched (server-rendered) payloads. Any
/// violation is an integrity error; the payload is discarded wholesale, not
/// partially repaired.
pub fn verify_snapshot(snapshot: DatasetSnapshot, auth: AuthState) -> Result<SanitizedSnapshot> {
    if !snapshot.includes_restricted {
        if let Some(leaked) = snapshot.records().iter().find(|r| r.effective_restriction()) {
            warn!("discarding payload: restricted id present on exclusive snapshot");
            return Err(PorticoError::Integrity(format!(
                "restricted record '{}' present although includes_restricted=false",
                leaked.id
            )));
        }
        return Ok(SanitizedSnapshot(snapshot));
    }

    if auth != AuthState::Authenticated {
        if !snapshot.fields_sanitized {
            return Err(PorticoError::Integrity(
                "unsanitized snapshot for unauthenticated caller".to_string(),
            ));
        }
        if let Some(bad) = snapshot.records().iter().find(|r| {
            r.effective_restriction() && !r.confidential.all_placeholder(CONFIDENTIAL_PLACEHOLDER)
        }) {
            warn!("discarding payload: confidential value survived sanitization");
            return Err(PorticoError::Integrity(format!(
                "confidential field present verbatim on restricted record '{}'",
                bad.id
            )));
        }
    }

    Ok(SanitizedSnapshot(snapshot))
}
