use serde_json::Value;
use tracing::{debug, info};
use waldo_domain::{
    prediction_from_label, ContextId, ContextKey, OutlierScore, RunId, SampleId, ScoreBatch,
    ScoredSample, WaldoError,
};
use waldo_store_core::{GatewayTransaction, Row, StorageGateway};

use crate::detector::{OutlierDetector, Sample};

/// Groups per-sample outlier scores under a (run, algorithm, parameters) context.
pub struct Correlator<G> {
    gateway: G,
}

impl<G: StorageGateway> Correlator<G> {
    #[must_use]
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Returns the id of the context for this combination, creating it on
    /// first use. Parameters are compared in canonical form.
    ///
    /// # Errors
    /// Returns [`WaldoError::Validation`] for a blank algorithm,
    /// [`WaldoError::Serialization`] for parameters without a canonical form,
    /// and any gateway error.
    pub fn resolve_context(
        &mut self,
        run_id: RunId,
        algorithm: &str,
        parameters: &Value,
    ) -> Result<ContextId, WaldoError> {
        let key = ContextKey::new(run_id, algorithm, parameters)?;
        self.gateway.with_transaction(|tx| resolve_in(tx, &key))
    }

    /// Writes or overwrites the score of one sample under a context.
    ///
    /// # Errors
    /// Returns [`WaldoError::InvalidScore`] for a non-finite score,
    /// [`WaldoError::UnknownSample`] when the sample does not exist, and
    /// [`WaldoError::UnknownContext`] when the context does not exist.
    pub fn record_score(
        &mut self,
        context_id: ContextId,
        sample_id: SampleId,
        score: f64,
        prediction: bool,
    ) -> Result<(), WaldoError> {
        let row = OutlierScore {
            context_id,
            sample_id,
            score,
            prediction,
        };
        row.validate()?;
        self.gateway
            .with_transaction(|tx| tx.upsert(Row::OutlierScore(&row)))
    }

    /// Resolves the batch's context and writes every score in one transaction.
    /// The batch is validated up front, so an invalid score writes nothing.
    ///
    /// # Errors
    /// See [`Correlator::resolve_context`] and [`Correlator::record_score`].
    /// Any failure rolls back the whole batch, including a newly created context.
    pub fn record_scores(&mut self, batch: &ScoreBatch) -> Result<ContextId, WaldoError> {
        batch.validate()?;
        let key = ContextKey::new(batch.run_id, &batch.algorithm, &batch.parameters)?;

        let context_id = self.gateway.with_transaction(|tx| {
            let context_id = resolve_in(tx, &key)?;
            for scored in &batch.scores {
                tx.upsert(Row::OutlierScore(&scored.with_context(context_id)))?;
            }
            Ok(context_id)
        })?;

        info!(
            run_id = %batch.run_id,
            algorithm = %key.algorithm,
            context_id = context_id.0,
            rows = batch.scores.len(),
            "outlier scores recorded"
        );
        Ok(context_id)
    }

    /// Runs a detector over the samples and records its output as one batch.
    ///
    /// # Errors
    /// Returns the detector's error, [`WaldoError::Validation`] when it does
    /// not return one result per sample, and the errors of
    /// [`Correlator::record_scores`].
    pub fn score_with(
        &mut self,
        run_id: RunId,
        detector: &dyn OutlierDetector,
        samples: &[Sample],
    ) -> Result<ContextId, WaldoError> {
        let detections = detector.detect(samples)?;
        if detections.len() != samples.len() {
            return Err(WaldoError::Validation(format!(
                "{} returned {} results for {} samples",
                detector.algorithm(),
                detections.len(),
                samples.len()
            )));
        }

        let scores = samples
            .iter()
            .zip(detections)
            .map(|(sample, detection)| ScoredSample {
                sample_id: sample.id,
                score: detection.score,
                prediction: prediction_from_label(detection.label),
            })
            .collect();

        self.record_scores(&ScoreBatch {
            run_id,
            algorithm: detector.algorithm().to_string(),
            parameters: detector.parameters(),
            scores,
        })
    }
}

fn resolve_in(tx: &mut dyn GatewayTransaction, key: &ContextKey) -> Result<ContextId, WaldoError> {
    let inserted = tx.insert_if_absent(Row::Context(key))?;
    let context_id = tx.find_context(key)?.ok_or_else(|| {
        WaldoError::Storage(format!(
            "context for {} / {} missing after insert",
            key.run_id, key.algorithm
        ))
    })?;
    debug!(
        run_id = %key.run_id,
        algorithm = %key.algorithm,
        context_id = context_id.0,
        inserted,
        "context resolved"
    );
    Ok(context_id)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use serde_json::json;
    use waldo_domain::{
        ContextId, RunId, SampleId, ScoreBatch, ScoredSample, WaldoConfig, WaldoError,
    };
    use waldo_store_core::{StorageGateway, Table};
    use waldo_store_sqlite::SqliteGateway;

    use super::Correlator;
    use crate::detector::{Detection, OutlierDetector, Sample};

    fn must<T>(result: Result<T, WaldoError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_correlator(samples: &[i64]) -> Correlator<SqliteGateway> {
        let mut gateway = must(SqliteGateway::open_in_memory(&WaldoConfig::default()));
        must(gateway.create_minimal_samples_table());
        must(gateway.migrate());
        for id in samples {
            must(gateway.seed_sample(SampleId(*id)));
        }
        Correlator::new(gateway)
    }

    struct FirstIsOutlier;

    impl OutlierDetector for FirstIsOutlier {
        fn algorithm(&self) -> &str {
            "Isolation Forest"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({"cols": ["amount"]})
        }

        fn detect(&self, samples: &[Sample]) -> Result<Vec<Detection>, WaldoError> {
            Ok(samples
                .iter()
                .enumerate()
                .map(|(index, sample)| Detection {
                    score: sample.features.iter().sum(),
                    label: if index == 0 { -1 } else { 1 },
                })
                .collect())
        }
    }

    struct Truncating;

    impl OutlierDetector for Truncating {
        fn algorithm(&self) -> &str {
            "broken"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({})
        }

        fn detect(&self, _samples: &[Sample]) -> Result<Vec<Detection>, WaldoError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn record_score_rejects_non_finite_before_writing() {
        let mut correlator = fixture_correlator(&[1]);
        let context_id = must(correlator.resolve_context(RunId::new(), "iforest", &json!({})));

        let result = correlator.record_score(context_id, SampleId(1), f64::NAN, false);
        assert!(matches!(
            result,
            Err(WaldoError::InvalidScore { sample_id: SampleId(1), .. })
        ));
        assert_eq!(must(correlator.gateway().count_rows(Table::OutlierScore)), 0);
    }

    #[test]
    fn record_score_surfaces_unknown_sample() {
        let mut correlator = fixture_correlator(&[1]);
        let context_id = must(correlator.resolve_context(RunId::new(), "iforest", &json!({})));
        assert_eq!(
            correlator.record_score(context_id, SampleId(2), 0.4, false),
            Err(WaldoError::UnknownSample(SampleId(2)))
        );
    }

    #[test]
    fn record_score_surfaces_unknown_context() {
        let mut correlator = fixture_correlator(&[1]);
        assert_eq!(
            correlator.record_score(ContextId(77), SampleId(1), 0.4, false),
            Err(WaldoError::UnknownContext(ContextId(77)))
        );
    }

    #[test]
    fn failed_batch_leaves_no_context_or_scores() {
        let mut correlator = fixture_correlator(&[1]);
        let batch = ScoreBatch {
            run_id: RunId::new(),
            algorithm: "iforest".to_string(),
            parameters: json!({"n_estimators": 100}),
            scores: vec![
                ScoredSample {
                    sample_id: SampleId(1),
                    score: 0.2,
                    prediction: false,
                },
                ScoredSample {
                    sample_id: SampleId(99),
                    score: 0.9,
                    prediction: true,
                },
            ],
        };

        assert_eq!(
            correlator.record_scores(&batch),
            Err(WaldoError::UnknownSample(SampleId(99)))
        );
        assert_eq!(must(correlator.gateway().count_rows(Table::Contexts)), 0);
        assert_eq!(must(correlator.gateway().count_rows(Table::OutlierScore)), 0);
    }

    #[test]
    fn detector_output_becomes_batch() {
        let mut correlator = fixture_correlator(&[10, 11, 12]);
        let samples = vec![
            Sample::new(SampleId(10), vec![5.0, 5.0]),
            Sample::new(SampleId(11), vec![0.5]),
            Sample::new(SampleId(12), vec![0.25, 0.25]),
        ];

        let run_id = RunId::new();
        let context_id = must(correlator.score_with(run_id, &FirstIsOutlier, &samples));

        let first = must(correlator.gateway().get_score(context_id, SampleId(10)));
        assert_eq!(first.map(|row| (row.score, row.prediction)), Some((10.0, true)));
        let last = must(correlator.gateway().get_score(context_id, SampleId(12)));
        assert_eq!(last.map(|row| (row.score, row.prediction)), Some((0.5, false)));

        let context = must(correlator.gateway().get_context(context_id));
        assert_eq!(
            context.map(|key| key.algorithm),
            Some("Isolation Forest".to_string())
        );
    }

    #[test]
    fn detector_result_count_must_match() {
        let mut correlator = fixture_correlator(&[1]);
        let samples = vec![Sample::new(SampleId(1), vec![1.0])];
        assert!(matches!(
            correlator.score_with(RunId::new(), &Truncating, &samples),
            Err(WaldoError::Validation(_))
        ));
    }
}
