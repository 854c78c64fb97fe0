#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod hashing;
pub mod ids;
pub mod scoring;

pub use config::{
    ConnectionDescriptor, FailurePolicy, SampleIdUniqueness, SampleTableConfig, WaldoConfig,
    DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_CON,
};
pub use error::WaldoError;
pub use event::{
    normalize, normalize_callback, CatalogSnapshot, EventRecord, EventRow, EventType,
    LifecycleEvent, NodeRef, NormalizedEvent, PipelineDefinition, PipelineSnapshot, Snapshot,
    SnapshotKind, DEFAULT_PIPELINE_NAME,
};
pub use hashing::{canonical_json, fingerprint, fingerprint_bytes, FINGERPRINT_HEX_LEN};
pub use ids::{ContentHash, ContextId, RunId, SampleId, RUN_ID_LEN};
pub use scoring::{prediction_from_label, ContextKey, OutlierScore, ScoreBatch, ScoredSample};

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

pub type DateTimeUtc = OffsetDateTime;

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// # Errors
/// Returns [`WaldoError::Serialization`] if the timestamp cannot be formatted.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WaldoError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| WaldoError::Serialization(format!("failed to format timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`WaldoError::Validation`] for text that is not RFC3339.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WaldoError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| WaldoError::Validation(format!("invalid RFC3339 timestamp `{value}`: {err}")))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`WaldoError::Validation`] when the value is empty or whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), WaldoError> {
    if value.trim().is_empty() {
        return Err(WaldoError::Validation(format!("{field_name} MUST be non-empty")));
    }
    Ok(())
}
