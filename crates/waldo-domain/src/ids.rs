use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WaldoError;
use crate::hashing::FINGERPRINT_HEX_LEN;

/// Length of the hyphenated textual run identifier stored in `run_id` columns.
pub const RUN_ID_LEN: usize = 36;

/// Identifier of one pipeline execution, stable for the duration of the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(pub Uuid);

impl RunId {
    /// Time-ordered identifier, so runs sort by start time.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parses the 36-character hyphenated form.
    ///
    /// # Errors
    /// Returns [`WaldoError::Validation`] for any other length or an invalid UUID.
    pub fn parse(value: &str) -> Result<Self, WaldoError> {
        if value.len() != RUN_ID_LEN {
            return Err(WaldoError::Validation(format!(
                "run_id MUST be {RUN_ID_LEN} characters, got {}",
                value.len()
            )));
        }
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|err| WaldoError::Validation(format!("invalid run_id: {err}")))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl TryFrom<String> for RunId {
    type Error = WaldoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub i64);

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a row in the caller-owned samples table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SampleId(pub i64);

impl Display for SampleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Truncated content digest used as the primary key of snapshot tables.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub(crate) fn from_hex_unchecked(value: String) -> Self {
        Self(value)
    }

    /// # Errors
    /// Returns [`WaldoError::Validation`] unless the value is
    /// [`FINGERPRINT_HEX_LEN`] lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self, WaldoError> {
        let well_formed = value.len() == FINGERPRINT_HEX_LEN
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if !well_formed {
            return Err(WaldoError::Validation(format!(
                "content hash MUST be {FINGERPRINT_HEX_LEN} lowercase hex characters: {value}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = WaldoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentHash, RunId, RUN_ID_LEN};

    #[test]
    fn run_id_round_trips_through_hyphenated_text() {
        let run_id = RunId::new();
        let text = run_id.to_string();
        assert_eq!(text.len(), RUN_ID_LEN);
        assert_eq!(RunId::parse(&text), Ok(run_id));
    }

    #[test]
    fn run_id_rejects_simple_and_short_forms() {
        assert!(RunId::parse("11111111111111111111111111111111").is_err());
        assert!(RunId::parse("1111-1111").is_err());
        assert!(RunId::parse("11111111-1111-1111-1111-111111111111").is_ok());
    }

    #[test]
    fn run_id_deserialization_applies_length_check() {
        let accepted: Result<RunId, _> =
            serde_json::from_str(r#""11111111-1111-1111-1111-111111111111""#);
        assert!(accepted.is_ok());

        for rejected in [
            r#""11111111111111111111111111111111""#,
            r#""urn:uuid:11111111-1111-1111-1111-111111111111""#,
        ] {
            assert!(serde_json::from_str::<RunId>(rejected).is_err(), "{rejected}");
        }
    }

    #[test]
    fn run_id_serializes_as_hyphenated_text() {
        let run_id = RunId::new();
        match serde_json::to_value(run_id) {
            Ok(value) => assert_eq!(value, serde_json::Value::String(run_id.to_string())),
            Err(err) => panic!("failed to serialize run id: {err}"),
        }
    }

    #[test]
    fn content_hash_requires_lowercase_hex_of_fixed_width() {
        assert!(ContentHash::parse("0123456789abcdef").is_ok());
        assert!(ContentHash::parse("0123456789ABCDEF").is_err());
        assert!(ContentHash::parse("0123456789abcde").is_err());
        assert!(ContentHash::parse("0123456789abcdeg").is_err());
    }
}
