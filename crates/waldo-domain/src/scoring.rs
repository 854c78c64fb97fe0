use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WaldoError;
use crate::hashing::canonical_json;
use crate::ids::{ContextId, RunId, SampleId};

/// Natural key of a scoring context: one row per distinct combination.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ContextKey {
    pub run_id: RunId,
    pub algorithm: String,
    /// Canonical JSON text of the algorithm parameters.
    pub parameters: String,
}

impl ContextKey {
    /// # Errors
    /// Returns [`WaldoError::Validation`] for a blank algorithm name and
    /// [`WaldoError::Serialization`] when the parameters have no canonical form.
    pub fn new(run_id: RunId, algorithm: &str, parameters: &Value) -> Result<Self, WaldoError> {
        crate::ensure_non_empty("algorithm", algorithm)?;
        Ok(Self {
            run_id,
            algorithm: algorithm.trim().to_string(),
            parameters: canonical_json(parameters)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OutlierScore {
    pub context_id: ContextId,
    pub sample_id: SampleId,
    pub score: f64,
    pub prediction: bool,
}

impl OutlierScore {
    /// # Errors
    /// Returns [`WaldoError::InvalidScore`] for NaN or infinite scores.
    pub fn validate(&self) -> Result<(), WaldoError> {
        ensure_finite(self.sample_id, self.score)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoredSample {
    pub sample_id: SampleId,
    pub score: f64,
    /// `true` marks the sample as an outlier.
    pub prediction: bool,
}

impl ScoredSample {
    #[must_use]
    pub fn with_context(self, context_id: ContextId) -> OutlierScore {
        OutlierScore {
            context_id,
            sample_id: self.sample_id,
            score: self.score,
            prediction: self.prediction,
        }
    }
}

/// All scores one algorithm produced for one run, written under a single context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBatch {
    pub run_id: RunId,
    pub algorithm: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
    pub scores: Vec<ScoredSample>,
}

impl ScoreBatch {
    /// # Errors
    /// Returns the first [`WaldoError::InvalidScore`] in the batch.
    pub fn validate(&self) -> Result<(), WaldoError> {
        self.scores
            .iter()
            .try_for_each(|scored| ensure_finite(scored.sample_id, scored.score))
    }
}

fn empty_parameters() -> Value {
    Value::Object(serde_json::Map::new())
}

fn ensure_finite(sample_id: SampleId, score: f64) -> Result<(), WaldoError> {
    if score.is_finite() {
        Ok(())
    } else {
        Err(WaldoError::InvalidScore { sample_id, score })
    }
}

/// Maps the `1` inlier / `-1` outlier label convention onto the stored flag.
#[must_use]
pub fn prediction_from_label(label: i8) -> bool {
    label == -1
}
