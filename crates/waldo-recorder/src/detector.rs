use serde::{Deserialize, Serialize};
use serde_json::Value;
use waldo_domain::{SampleId, WaldoError};

/// One row of the samples table as seen by a detector: its id and the
/// numeric feature columns selected for scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub id: SampleId,
    pub features: Vec<f64>,
}

impl Sample {
    #[must_use]
    pub fn new(id: SampleId, features: Vec<f64>) -> Self {
        Self { id, features }
    }
}

/// Raw detector output for one sample. `label` follows the `1` inlier /
/// `-1` outlier convention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub score: f64,
    pub label: i8,
}

/// A pluggable anomaly-detection algorithm.
pub trait OutlierDetector {
    fn algorithm(&self) -> &str;

    fn parameters(&self) -> Value;

    /// Returns one detection per sample, in input order.
    #[allow(clippy::missing_errors_doc)]
    fn detect(&self, samples: &[Sample]) -> Result<Vec<Detection>, WaldoError>;
}
