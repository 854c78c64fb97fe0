use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{info, warn};
use waldo_domain::{
    FailurePolicy, LifecycleEvent, NodeRef, PipelineDefinition, RunId, WaldoError,
};
use waldo_store_core::StorageGateway;

use crate::clock::RunClock;
use crate::correlator::Correlator;
use crate::recorder::{RecordOutcome, Recorder};
use crate::validate::ValidatorRegistry;

/// Per-run glue between a pipeline's lifecycle hooks and the recorder.
///
/// Validator failures always propagate. Persistence failures propagate only
/// under [`FailurePolicy::Propagate`]; otherwise they are logged and the hook
/// returns `Ok(None)` so the pipeline keeps running.
pub struct RunSession<G> {
    recorder: Recorder<G>,
    run_id: RunId,
    clock: RunClock,
    validators: ValidatorRegistry,
    policy: FailurePolicy,
}

impl<G: StorageGateway> RunSession<G> {
    #[must_use]
    pub fn new(gateway: G) -> Self {
        Self {
            recorder: Recorder::new(gateway),
            run_id: RunId::new(),
            clock: RunClock::new(),
            validators: ValidatorRegistry::new(),
            policy: FailurePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn recorder(&self) -> &Recorder<G> {
        &self.recorder
    }

    /// Scores written through the returned correlator share this session's gateway.
    pub fn correlator(&mut self) -> Correlator<&mut G> {
        Correlator::new(self.recorder.gateway_mut())
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn after_catalog_created(
        &mut self,
        catalog: &Value,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::AfterCatalogCreated {
                catalog: catalog.clone(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn before_node_run(
        &mut self,
        node: &NodeRef,
        inputs: &Map<String, Value>,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::BeforeNodeRun {
                node: node.clone(),
                inputs: inputs.clone(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn after_node_run(
        &mut self,
        node: &NodeRef,
        outputs: &Map<String, Value>,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::AfterNodeRun {
                node: node.clone(),
                outputs: outputs.clone(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn on_node_error(
        &mut self,
        node: &NodeRef,
        error: Option<&str>,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::OnNodeError {
                node: node.clone(),
                error: error.map(str::to_string),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn before_pipeline_run(
        &mut self,
        pipeline: &PipelineDefinition,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::BeforePipelineRun {
                pipeline: pipeline.clone(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn after_pipeline_run(
        &mut self,
        pipeline: &PipelineDefinition,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::AfterPipelineRun {
                pipeline: pipeline.clone(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn on_pipeline_error(
        &mut self,
        pipeline: &PipelineDefinition,
        error: Option<&str>,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::OnPipelineError {
                pipeline: pipeline.clone(),
                error: error.map(str::to_string),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn before_dataset_loaded(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::BeforeDatasetLoaded {
                dataset_name: dataset_name.to_string(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn after_dataset_loaded(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::AfterDatasetLoaded {
                dataset_name: dataset_name.to_string(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn before_dataset_saved(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::BeforeDatasetSaved {
                dataset_name: dataset_name.to_string(),
            },
            None,
        )
    }

    /// # Errors
    /// See [`RunSession::dispatch`].
    pub fn after_dataset_saved(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        self.dispatch(
            &LifecycleEvent::AfterDatasetSaved {
                dataset_name: dataset_name.to_string(),
            },
            None,
        )
    }

    /// Dispatches a callback delivered by name.
    ///
    /// # Errors
    /// Unknown names and malformed payloads are integration bugs and always
    /// propagate, regardless of policy. Otherwise see [`RunSession::dispatch`].
    pub fn dispatch_callback(
        &mut self,
        event_type: &str,
        payload: Value,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        let event = LifecycleEvent::from_callback(event_type, payload)?;
        self.dispatch(&event, timestamp)
    }

    /// Validates, logs and records one callback. Without a timestamp the
    /// session clock supplies one.
    ///
    /// # Errors
    /// Returns [`WaldoError::Validation`] when a node validator rejects the
    /// callback (nothing is recorded), and persistence errors when the policy
    /// is [`FailurePolicy::Propagate`].
    pub fn dispatch(
        &mut self,
        event: &LifecycleEvent,
        timestamp: Option<OffsetDateTime>,
    ) -> Result<Option<RecordOutcome>, WaldoError> {
        match event {
            LifecycleEvent::BeforeNodeRun { node, inputs } => {
                self.validators.validate_input(node, inputs)?;
            }
            LifecycleEvent::AfterNodeRun { node, outputs } => {
                self.validators.validate_output(node, outputs)?;
            }
            _ => {}
        }

        announce(event);
        let timestamp = match timestamp {
            Some(value) => self.clock.observe(value),
            None => self.clock.tick(),
        };

        match self.recorder.record(self.run_id, timestamp, event) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) if self.policy == FailurePolicy::LogAndContinue => {
                warn!(
                    run_id = %self.run_id,
                    event_type = event.event_type().as_str(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "lifecycle event not recorded; continuing run"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn announce(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::AfterCatalogCreated { .. } => info!("catalog loaded"),
        LifecycleEvent::BeforeNodeRun { node, .. } => info!("running node {}", node.name),
        LifecycleEvent::AfterNodeRun { node, .. } => info!("node {} run successfully", node.name),
        LifecycleEvent::OnNodeError { node, .. } => info!("running node {} failed", node.name),
        LifecycleEvent::BeforePipelineRun { pipeline } => {
            info!("before running pipeline {}", pipeline.resolved_name());
        }
        LifecycleEvent::AfterPipelineRun { pipeline } => {
            info!("pipeline {} run successfully", pipeline.resolved_name());
        }
        LifecycleEvent::OnPipelineError { pipeline, .. } => {
            info!("running pipeline {} failed", pipeline.resolved_name());
        }
        LifecycleEvent::BeforeDatasetLoaded { dataset_name } => {
            info!("loading dataset {dataset_name}");
        }
        LifecycleEvent::AfterDatasetLoaded { dataset_name } => {
            info!("dataset {dataset_name} loaded successfully");
        }
        LifecycleEvent::BeforeDatasetSaved { dataset_name } => {
            info!("saving dataset {dataset_name}");
        }
        LifecycleEvent::AfterDatasetSaved { dataset_name } => {
            info!("dataset {dataset_name} saved successfully");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};
    use time::Duration;
    use waldo_domain::{
        now_utc, EventType, FailurePolicy, NodeRef, PipelineDefinition, RunId, SampleId,
        WaldoConfig, WaldoError,
    };
    use waldo_store_core::{StorageGateway, Table};
    use waldo_store_sqlite::SqliteGateway;

    use super::RunSession;
    use crate::validate::{NumericColumnsValidator, ValidatorRegistry};

    fn must<T>(result: Result<T, WaldoError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_gateway() -> SqliteGateway {
        let mut gateway = must(SqliteGateway::open_in_memory(&WaldoConfig::default()));
        must(gateway.create_minimal_samples_table());
        must(gateway.migrate());
        gateway
    }

    #[test]
    fn full_run_records_every_hook_in_order() {
        let mut session = RunSession::new(fixture_gateway());
        let pipeline = PipelineDefinition::new("__default__", json!({"nodes": ["detect"]}));
        let node = NodeRef::new("detect");

        must(session.after_catalog_created(&json!({"transactions": {"type": "sql"}})));
        must(session.before_pipeline_run(&pipeline));
        must(session.before_dataset_loaded("transactions"));
        must(session.after_dataset_loaded("transactions"));
        must(session.before_node_run(&node, &Map::new()));
        must(session.after_node_run(&node, &Map::new()));
        must(session.before_dataset_saved("scores"));
        must(session.after_dataset_saved("scores"));
        must(session.after_pipeline_run(&pipeline));

        let events = must(session.recorder().gateway().list_events_for_run(session.run_id()));
        let types: Vec<EventType> = events.iter().map(|row| row.event.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::AfterCatalogCreated,
                EventType::BeforePipelineRun,
                EventType::BeforeDatasetLoaded,
                EventType::AfterDatasetLoaded,
                EventType::BeforeNodeRun,
                EventType::AfterNodeRun,
                EventType::BeforeDatasetSaved,
                EventType::AfterDatasetSaved,
                EventType::AfterPipelineRun,
            ]
        );
        assert!(events
            .windows(2)
            .all(|pair| pair[0].event.timestamp <= pair[1].event.timestamp));
    }

    #[test]
    fn rejected_node_input_records_nothing() {
        let validators = ValidatorRegistry::new().with(NumericColumnsValidator::new());
        let mut session = RunSession::new(fixture_gateway()).with_validators(validators);
        let node = NodeRef::new("detect").with_tag(NumericColumnsValidator::NAME);
        let inputs = match json!({
            "transactions": [{"id": 1, "amount": "oops"}],
            "params:iforest": {"cols": ["amount"]}
        }) {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        };

        let result = session.before_node_run(&node, &inputs);
        assert!(matches!(result, Err(WaldoError::Validation(_))));
        assert_eq!(
            must(session.recorder().gateway().count_rows(Table::Events)),
            0
        );
    }

    #[test]
    fn out_of_order_timestamps_are_clamped_within_run() {
        let run_id = RunId::new();
        let mut session = RunSession::new(fixture_gateway()).with_run_id(run_id);
        let start = now_utc();

        must(session.dispatch_callback(
            "before_dataset_loaded",
            json!({"dataset_name": "a"}),
            Some(start),
        ));
        must(session.dispatch_callback(
            "after_dataset_loaded",
            json!({"dataset_name": "a"}),
            Some(start - Duration::minutes(1)),
        ));

        let events = must(session.recorder().gateway().list_events_for_run(run_id));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.timestamp, events[1].event.timestamp);
    }

    #[test]
    fn unknown_callback_propagates_under_any_policy() {
        let mut session =
            RunSession::new(fixture_gateway()).with_policy(FailurePolicy::LogAndContinue);
        let result = session.dispatch_callback("after_tea_break", json!({}), None);
        assert_eq!(
            result,
            Err(WaldoError::UnknownEventType("after_tea_break".to_string()))
        );
    }

    #[test]
    fn persistence_failure_follows_policy() {
        // No migrate: every insert fails with a storage error.
        let bare = || must(SqliteGateway::open_in_memory(&WaldoConfig::default()));

        let mut lenient = RunSession::new(bare());
        assert_eq!(lenient.before_dataset_saved("scores"), Ok(None));

        let mut strict = RunSession::new(bare()).with_policy(FailurePolicy::Propagate);
        assert!(matches!(
            strict.before_dataset_saved("scores"),
            Err(WaldoError::Storage(_))
        ));
    }

    #[test]
    fn session_correlator_shares_gateway() {
        let gateway = fixture_gateway();
        must(gateway.seed_sample(SampleId(1)));
        let mut session = RunSession::new(gateway);
        let run_id = session.run_id();

        let context_id = {
            let mut correlator = session.correlator();
            let context_id = must(correlator.resolve_context(run_id, "iforest", &json!({})));
            must(correlator.record_score(context_id, SampleId(1), 0.3, false));
            context_id
        };

        let stored = must(session.recorder().gateway().get_score(context_id, SampleId(1)));
        assert!(stored.is_some());
        assert_eq!(
            must(session.recorder().gateway().count_rows(Table::OutlierScore)),
            1
        );
    }
}
