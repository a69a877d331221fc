//! Request normalization and fingerprinting.
//!
//! A fingerprint is a SHA-256 digest over a canonical, length-prefixed
//! encoding of the request. It depends only on the request contents, so it
//! is stable across process restarts.

use crate::error::{DispatchError, DispatchResult};
use crate::models::AnalysisRequest;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Bumped whenever the canonical encoding changes.
const FINGERPRINT_VERSION: &[u8] = b"earthly-fp-v1";

/// Deterministic identity of a semantically unique request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[allow(dead_code)] // Accessor for embedders; Display covers the CLI
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a request and compute its fingerprint.
///
/// Region and data types are compared case-insensitively and without
/// surrounding whitespace. Data type order and duplicates are irrelevant.
pub fn normalize(request: &AnalysisRequest) -> DispatchResult<Fingerprint> {
    canonicalize(request).map(|(fingerprint, _)| fingerprint)
}

/// Validate a request and return its fingerprint along with the canonical
/// form of the request.
///
/// Every request sharing a fingerprint has the same canonical form, so a
/// backend handed this form produces output that does not depend on which
/// caller spelled the request first.
pub fn canonicalize(request: &AnalysisRequest) -> DispatchResult<(Fingerprint, AnalysisRequest)> {
    let region = request.region().trim().to_lowercase();
    if region.is_empty() {
        return Err(DispatchError::InvalidRequest(
            "region must not be empty".to_string(),
        ));
    }

    let data_types: BTreeSet<String> = request
        .data_types()
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if data_types.is_empty() {
        return Err(DispatchError::InvalidRequest(
            "at least one data type is required".to_string(),
        ));
    }

    if let Some(range) = request.date_range() {
        if range.is_inverted() {
            return Err(DispatchError::InvalidRequest(format!(
                "date range start {} is after end {}",
                range.start.to_rfc3339(),
                range.end.to_rfc3339()
            )));
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION);
    update_field(&mut hasher, region.as_bytes());

    hasher.update((data_types.len() as u64).to_be_bytes());
    for data_type in &data_types {
        update_field(&mut hasher, data_type.as_bytes());
    }

    match request.date_range() {
        Some(range) => {
            hasher.update([1u8]);
            hasher.update(range.start.timestamp().to_be_bytes());
            hasher.update(range.start.timestamp_subsec_nanos().to_be_bytes());
            hasher.update(range.end.timestamp().to_be_bytes());
            hasher.update(range.end.timestamp_subsec_nanos().to_be_bytes());
        }
        None => hasher.update([0u8]),
    }

    let fingerprint = Fingerprint(hex::encode(hasher.finalize()));

    let canonical = AnalysisRequest::new(region, data_types);
    let canonical = match request.date_range() {
        Some(range) => canonical.with_date_range(*range),
        None => canonical,
    };

    Ok((fingerprint, canonical))
}

/// Length-prefix a field so adjacent fields cannot run into each other.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
