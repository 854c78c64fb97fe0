use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::error::WaldoError;
use crate::hashing::{canonical_json, fingerprint};
use crate::ids::{ContentHash, RunId};

/// Name recorded for a pipeline run without an explicit pipeline name.
pub const DEFAULT_PIPELINE_NAME: &str = "__default__";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AfterCatalogCreated,
    BeforeNodeRun,
    AfterNodeRun,
    OnNodeError,
    BeforePipelineRun,
    AfterPipelineRun,
    OnPipelineError,
    BeforeDatasetLoaded,
    AfterDatasetLoaded,
    BeforeDatasetSaved,
    AfterDatasetSaved,
}

impl EventType {
    pub const ALL: [Self; 11] = [
        Self::AfterCatalogCreated,
        Self::BeforeNodeRun,
        Self::AfterNodeRun,
        Self::OnNodeError,
        Self::BeforePipelineRun,
        Self::AfterPipelineRun,
        Self::OnPipelineError,
        Self::BeforeDatasetLoaded,
        Self::AfterDatasetLoaded,
        Self::BeforeDatasetSaved,
        Self::AfterDatasetSaved,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AfterCatalogCreated => "after_catalog_created",
            Self::BeforeNodeRun => "before_node_run",
            Self::AfterNodeRun => "after_node_run",
            Self::OnNodeError => "on_node_error",
            Self::BeforePipelineRun => "before_pipeline_run",
            Self::AfterPipelineRun => "after_pipeline_run",
            Self::OnPipelineError => "on_pipeline_error",
            Self::BeforeDatasetLoaded => "before_dataset_loaded",
            Self::AfterDatasetLoaded => "after_dataset_loaded",
            Self::BeforeDatasetSaved => "before_dataset_saved",
            Self::AfterDatasetSaved => "after_dataset_saved",
        }
    }

    /// # Errors
    /// Returns [`WaldoError::UnknownEventType`] for names outside the fixed set.
    pub fn parse(value: &str) -> Result<Self, WaldoError> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == value)
            .ok_or_else(|| WaldoError::UnknownEventType(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SnapshotKind {
    Catalog,
    Pipeline,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeRef {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl NodeRef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub content: Value,
}

impl PipelineDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, content: Value) -> Self {
        Self {
            name: Some(name.into()),
            content,
        }
    }

    #[must_use]
    pub fn resolved_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_PIPELINE_NAME)
    }
}

/// One lifecycle callback with the payload specific to its type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum LifecycleEvent {
    AfterCatalogCreated {
        catalog: Value,
    },
    BeforeNodeRun {
        node: NodeRef,
        #[serde(default)]
        inputs: Map<String, Value>,
    },
    AfterNodeRun {
        node: NodeRef,
        #[serde(default)]
        outputs: Map<String, Value>,
    },
    OnNodeError {
        node: NodeRef,
        #[serde(default)]
        error: Option<String>,
    },
    BeforePipelineRun {
        pipeline: PipelineDefinition,
    },
    AfterPipelineRun {
        pipeline: PipelineDefinition,
    },
    OnPipelineError {
        pipeline: PipelineDefinition,
        #[serde(default)]
        error: Option<String>,
    },
    BeforeDatasetLoaded {
        dataset_name: String,
    },
    AfterDatasetLoaded {
        dataset_name: String,
    },
    BeforeDatasetSaved {
        dataset_name: String,
    },
    AfterDatasetSaved {
        dataset_name: String,
    },
}

impl LifecycleEvent {
    /// Builds an event from a callback name and its raw payload.
    ///
    /// # Errors
    /// Returns [`WaldoError::UnknownEventType`] when `event_type` is not one of
    /// the lifecycle names, and [`WaldoError::InvalidPayload`] when the payload
    /// does not have the shape that name requires.
    pub fn from_callback(event_type: &str, payload: Value) -> Result<Self, WaldoError> {
        let parsed = EventType::parse(event_type)?;
        serde_json::from_value(json!({
            "event_type": parsed.as_str(),
            "payload": payload,
        }))
        .map_err(|err| WaldoError::InvalidPayload {
            event_type: parsed.as_str().to_string(),
            message: err.to_string(),
        })
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AfterCatalogCreated { .. } => EventType::AfterCatalogCreated,
            Self::BeforeNodeRun { .. } => EventType::BeforeNodeRun,
            Self::AfterNodeRun { .. } => EventType::AfterNodeRun,
            Self::OnNodeError { .. } => EventType::OnNodeError,
            Self::BeforePipelineRun { .. } => EventType::BeforePipelineRun,
            Self::AfterPipelineRun { .. } => EventType::AfterPipelineRun,
            Self::OnPipelineError { .. } => EventType::OnPipelineError,
            Self::BeforeDatasetLoaded { .. } => EventType::BeforeDatasetLoaded,
            Self::AfterDatasetLoaded { .. } => EventType::AfterDatasetLoaded,
            Self::BeforeDatasetSaved { .. } => EventType::BeforeDatasetSaved,
            Self::AfterDatasetSaved { .. } => EventType::AfterDatasetSaved,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogSnapshot {
    pub hash: ContentHash,
    /// Canonical JSON text of the catalog configuration.
    pub content: String,
}

impl CatalogSnapshot {
    /// # Errors
    /// Returns [`WaldoError::Serialization`] when the catalog has no canonical form.
    pub fn from_content(catalog: &Value) -> Result<Self, WaldoError> {
        Ok(Self {
            hash: fingerprint(catalog)?,
            content: canonical_json(catalog)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSnapshot {
    pub hash: ContentHash,
    pub name: String,
    /// Canonical JSON text of the pipeline structure.
    pub content: String,
}

impl PipelineSnapshot {
    /// The digest covers the structure only. A structure run under several
    /// names is stored once and keeps the name of its first run; each event
    /// still carries its own run's name.
    ///
    /// # Errors
    /// Returns [`WaldoError::Serialization`] when the structure has no canonical form.
    pub fn from_definition(pipeline: &PipelineDefinition) -> Result<Self, WaldoError> {
        Ok(Self {
            hash: fingerprint(&pipeline.content)?,
            name: pipeline.resolved_name().to_string(),
            content: canonical_json(&pipeline.content)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Catalog(CatalogSnapshot),
    Pipeline(PipelineSnapshot),
}

impl Snapshot {
    #[must_use]
    pub fn hash(&self) -> &ContentHash {
        match self {
            Self::Catalog(snapshot) => &snapshot.hash,
            Self::Pipeline(snapshot) => &snapshot.hash,
        }
    }

    #[must_use]
    pub fn kind(&self) -> SnapshotKind {
        match self {
            Self::Catalog(_) => SnapshotKind::Catalog,
            Self::Pipeline(_) => SnapshotKind::Pipeline,
        }
    }
}

/// Canonical row of the append-only `events` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub run_id: RunId,
    pub event_type: EventType,
    pub target_id: Option<String>,
    pub target_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A stored event row together with its assigned id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRow {
    pub id: i64,
    pub event: EventRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event: EventRecord,
    pub snapshot: Option<Snapshot>,
}

/// Maps one lifecycle callback onto the event row and, for catalog and
/// pipeline callbacks, the snapshot row the event points at.
///
/// # Errors
/// Returns [`WaldoError::Serialization`] when snapshot content or a target
/// name cannot be canonicalized.
pub fn normalize(
    run_id: RunId,
    timestamp: OffsetDateTime,
    event: &LifecycleEvent,
) -> Result<NormalizedEvent, WaldoError> {
    let event_type = event.event_type();
    let (target_name, snapshot) = match event {
        LifecycleEvent::AfterCatalogCreated { catalog } => (
            None,
            Some(Snapshot::Catalog(CatalogSnapshot::from_content(catalog)?)),
        ),
        LifecycleEvent::BeforePipelineRun { pipeline }
        | LifecycleEvent::AfterPipelineRun { pipeline }
        | LifecycleEvent::OnPipelineError { pipeline, .. } => {
            let snapshot = PipelineSnapshot::from_definition(pipeline)?;
            (
                Some(snapshot.name.clone()),
                Some(Snapshot::Pipeline(snapshot)),
            )
        }
        LifecycleEvent::BeforeNodeRun { node, .. }
        | LifecycleEvent::AfterNodeRun { node, .. }
        | LifecycleEvent::OnNodeError { node, .. } => (Some(node.name.clone()), None),
        LifecycleEvent::BeforeDatasetLoaded { dataset_name }
        | LifecycleEvent::AfterDatasetLoaded { dataset_name }
        | LifecycleEvent::BeforeDatasetSaved { dataset_name }
        | LifecycleEvent::AfterDatasetSaved { dataset_name } => (Some(dataset_name.clone()), None),
    };

    let target_id = match (&snapshot, &target_name) {
        (Some(snapshot), _) => Some(snapshot.hash().to_string()),
        (None, Some(name)) => Some(fingerprint(name)?.to_string()),
        (None, None) => None,
    };

    Ok(NormalizedEvent {
        event: EventRecord {
            run_id,
            event_type,
            target_id,
            target_name,
            timestamp,
        },
        snapshot,
    })
}

/// Normalizes a callback given by name, as delivered by a hook dispatcher.
///
/// # Errors
/// See [`LifecycleEvent::from_callback`] and [`normalize`].
pub fn normalize_callback(
    event_type: &str,
    run_id: RunId,
    payload: Value,
    timestamp: OffsetDateTime,
) -> Result<NormalizedEvent, WaldoError> {
    let event = LifecycleEvent::from_callback(event_type, payload)?;
    normalize(run_id, timestamp, &event)
}
