use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error};
use waldo_domain::{
    normalize, LifecycleEvent, NormalizedEvent, RunId, Snapshot, SnapshotKind, WaldoError,
};
use waldo_store_core::{Row, StorageGateway};

/// Rows written for one lifecycle callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub event_id: i64,
    pub target_id: Option<String>,
    /// `Some(true)` when this callback stored a new snapshot, `Some(false)`
    /// when an identical snapshot already existed.
    pub snapshot_inserted: Option<bool>,
}

/// Writes exactly one event row per lifecycle callback, plus the catalog or
/// pipeline snapshot it references, inside a single transaction.
pub struct Recorder<G> {
    gateway: G,
}

impl<G: StorageGateway> Recorder<G> {
    #[must_use]
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    /// Normalizes and persists one callback.
    ///
    /// # Errors
    /// Returns [`WaldoError::Serialization`] when snapshot content cannot be
    /// canonicalized (nothing is written), and any gateway error otherwise.
    pub fn record(
        &mut self,
        run_id: RunId,
        timestamp: OffsetDateTime,
        event: &LifecycleEvent,
    ) -> Result<RecordOutcome, WaldoError> {
        let normalized = normalize(run_id, timestamp, event).map_err(|err| {
            if matches!(err, WaldoError::Serialization(_)) {
                error!(
                    run_id = %run_id,
                    event_type = event.event_type().as_str(),
                    error = %err,
                    "lifecycle event dropped: content is not serializable"
                );
            }
            err
        })?;
        self.record_normalized(&normalized)
    }

    /// Persists a callback given by name with its raw payload.
    ///
    /// # Errors
    /// Returns [`WaldoError::UnknownEventType`] for an unrecognized name,
    /// [`WaldoError::InvalidPayload`] for a payload of the wrong shape, and
    /// otherwise the errors of [`Recorder::record`].
    pub fn record_callback(
        &mut self,
        event_type: &str,
        run_id: RunId,
        payload: Value,
        timestamp: OffsetDateTime,
    ) -> Result<RecordOutcome, WaldoError> {
        let event = LifecycleEvent::from_callback(event_type, payload)?;
        self.record(run_id, timestamp, &event)
    }

    /// # Errors
    /// Returns any gateway error; on error no row of this callback is visible.
    pub fn record_normalized(
        &mut self,
        normalized: &NormalizedEvent,
    ) -> Result<RecordOutcome, WaldoError> {
        let outcome = self.gateway.with_transaction(|tx| {
            let snapshot_inserted = match &normalized.snapshot {
                Some(snapshot) => Some(tx.insert_if_absent(Row::snapshot(snapshot))?),
                None => None,
            };
            let event_id = tx.insert(Row::Event(&normalized.event))?;
            Ok(RecordOutcome {
                event_id,
                target_id: normalized.event.target_id.clone(),
                snapshot_inserted,
            })
        })?;

        if let (Some(snapshot), Some(inserted)) = (&normalized.snapshot, outcome.snapshot_inserted) {
            debug!(
                kind = snapshot_label(snapshot),
                hash = %snapshot.hash(),
                inserted,
                "snapshot dedup"
            );
        }
        Ok(outcome)
    }
}

fn snapshot_label(snapshot: &Snapshot) -> &'static str {
    match snapshot.kind() {
        SnapshotKind::Catalog => "catalog",
        SnapshotKind::Pipeline => "pipeline",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use waldo_domain::{
        fingerprint, now_utc, EventType, LifecycleEvent, NodeRef, PipelineDefinition, RunId,
        WaldoConfig, WaldoError,
    };
    use waldo_store_core::{StorageGateway, Table};
    use waldo_store_sqlite::SqliteGateway;

    use super::Recorder;

    fn must<T>(result: Result<T, WaldoError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_recorder() -> Recorder<SqliteGateway> {
        let mut gateway = must(SqliteGateway::open_in_memory(&WaldoConfig::default()));
        must(gateway.create_minimal_samples_table());
        must(gateway.migrate());
        Recorder::new(gateway)
    }

    #[test]
    fn repeated_catalog_is_stored_once_with_two_events() {
        let mut recorder = fixture_recorder();
        let run_id = RunId::new();
        let event = LifecycleEvent::AfterCatalogCreated {
            catalog: json!({"companies": {"type": "pandas.CSVDataSet"}}),
        };

        let first = must(recorder.record(run_id, now_utc(), &event));
        let second = must(recorder.record(run_id, now_utc(), &event));

        assert_eq!(first.snapshot_inserted, Some(true));
        assert_eq!(second.snapshot_inserted, Some(false));
        assert_eq!(first.target_id, second.target_id);
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(must(recorder.gateway().count_rows(Table::Catalogs)), 1);
        assert_eq!(must(recorder.gateway().count_rows(Table::Events)), 2);
    }

    #[test]
    fn node_events_write_no_snapshot() {
        let mut recorder = fixture_recorder();
        let run_id = RunId::new();
        let node = NodeRef::new("train_model");

        let outcome = must(recorder.record(
            run_id,
            now_utc(),
            &LifecycleEvent::BeforeNodeRun {
                node,
                inputs: serde_json::Map::new(),
            },
        ));

        assert_eq!(outcome.snapshot_inserted, None);
        assert_eq!(
            outcome.target_id,
            Some(must(fingerprint("train_model")).to_string())
        );
        assert_eq!(must(recorder.gateway().count_rows(Table::Catalogs)), 0);
        assert_eq!(must(recorder.gateway().count_rows(Table::Pipelines)), 0);
    }

    #[test]
    fn unknown_callback_writes_nothing() {
        let mut recorder = fixture_recorder();
        let result = recorder.record_callback("after_everything", RunId::new(), json!({}), now_utc());
        assert_eq!(
            result,
            Err(WaldoError::UnknownEventType("after_everything".to_string()))
        );
        assert_eq!(must(recorder.gateway().count_rows(Table::Events)), 0);
    }

    #[test]
    fn pipeline_callbacks_share_one_snapshot() {
        let mut recorder = fixture_recorder();
        let run_id = RunId::new();
        let pipeline = PipelineDefinition::new("__default__", json!({"nodes": ["a", "b"]}));

        must(recorder.record(
            run_id,
            now_utc(),
            &LifecycleEvent::BeforePipelineRun {
                pipeline: pipeline.clone(),
            },
        ));
        must(recorder.record(
            run_id,
            now_utc(),
            &LifecycleEvent::AfterPipelineRun { pipeline },
        ));

        let events = must(recorder.gateway().list_events_for_run(run_id));
        let types: Vec<EventType> = events.iter().map(|row| row.event.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::BeforePipelineRun, EventType::AfterPipelineRun]
        );
        assert_eq!(events[0].event.target_id, events[1].event.target_id);
        assert_eq!(must(recorder.gateway().count_rows(Table::Pipelines)), 1);
    }
}
