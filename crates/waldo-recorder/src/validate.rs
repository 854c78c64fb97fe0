//! Node input/output validators.
//!
//! A validator applies to every node that carries one of its tags. A
//! validator's own name is always one of its tags, so tagging a node with
//! `NumericColumnsValidator` enables that check without extra configuration.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::info;
use waldo_domain::{NodeRef, WaldoError};

/// Prefix of node inputs that carry parameters rather than datasets.
pub const PARAMS_PREFIX: &str = "params:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorTags {
    tags: BTreeSet<String>,
}

impl ValidatorTags {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            tags: BTreeSet::from([name.to_string()]),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn applies_to(&self, node: &NodeRef) -> bool {
        !self.tags.is_disjoint(&node.tags)
    }
}

pub trait NodeValidator {
    fn tags(&self) -> &ValidatorTags;

    /// Runs before the node with the node's inputs.
    #[allow(clippy::missing_errors_doc)]
    fn validate_input(
        &self,
        _node: &NodeRef,
        _inputs: &Map<String, Value>,
    ) -> Result<(), WaldoError> {
        Ok(())
    }

    /// Runs after the node with the node's outputs.
    #[allow(clippy::missing_errors_doc)]
    fn validate_output(
        &self,
        _node: &NodeRef,
        _outputs: &Map<String, Value>,
    ) -> Result<(), WaldoError> {
        Ok(())
    }
}

/// Validators consulted by a run session, in registration order.
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: Vec<Box<dyn NodeValidator>>,
}

impl ValidatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, validator: impl NodeValidator + 'static) {
        self.validators.push(Box::new(validator));
    }

    #[must_use]
    pub fn with(mut self, validator: impl NodeValidator + 'static) -> Self {
        self.register(validator);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// # Errors
    /// Returns the first validator failure for this node.
    pub fn validate_input(
        &self,
        node: &NodeRef,
        inputs: &Map<String, Value>,
    ) -> Result<(), WaldoError> {
        self.validators
            .iter()
            .filter(|validator| validator.tags().applies_to(node))
            .try_for_each(|validator| validator.validate_input(node, inputs))
    }

    /// # Errors
    /// Returns the first validator failure for this node.
    pub fn validate_output(
        &self,
        node: &NodeRef,
        outputs: &Map<String, Value>,
    ) -> Result<(), WaldoError> {
        self.validators
            .iter()
            .filter(|validator| validator.tags().applies_to(node))
            .try_for_each(|validator| validator.validate_output(node, outputs))
    }
}

/// Logs that a tagged node's input and output passed through.
#[derive(Debug, Clone)]
pub struct LoggingValidator {
    tags: ValidatorTags,
}

impl LoggingValidator {
    pub const NAME: &'static str = "LoggingValidator";

    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: ValidatorTags::new(Self::NAME),
        }
    }
}

impl Default for LoggingValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeValidator for LoggingValidator {
    fn tags(&self) -> &ValidatorTags {
        &self.tags
    }

    fn validate_input(
        &self,
        node: &NodeRef,
        _inputs: &Map<String, Value>,
    ) -> Result<(), WaldoError> {
        info!(node = %node.name, "input validated");
        Ok(())
    }

    fn validate_output(
        &self,
        node: &NodeRef,
        _outputs: &Map<String, Value>,
    ) -> Result<(), WaldoError> {
        info!(node = %node.name, "output validated");
        Ok(())
    }
}

/// Requires every column listed in a `params:*` input's `cols` to be numeric
/// in the node's tabular input (an array of record objects).
#[derive(Debug, Clone)]
pub struct NumericColumnsValidator {
    tags: ValidatorTags,
}

impl NumericColumnsValidator {
    pub const NAME: &'static str = "NumericColumnsValidator";

    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: ValidatorTags::new(Self::NAME),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags = self.tags.with_tag(tag);
        self
    }
}

impl Default for NumericColumnsValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeValidator for NumericColumnsValidator {
    fn tags(&self) -> &ValidatorTags {
        &self.tags
    }

    fn validate_input(
        &self,
        node: &NodeRef,
        inputs: &Map<String, Value>,
    ) -> Result<(), WaldoError> {
        let mut dataset: Option<(&str, &Vec<Value>)> = None;
        let mut columns: Vec<&str> = Vec::new();

        for (key, value) in inputs {
            if let Some(records) = value.as_array().filter(|rows| rows.iter().all(Value::is_object)) {
                dataset = Some((key.as_str(), records));
            } else if key.starts_with(PARAMS_PREFIX) {
                if let Some(cols) = value.get("cols").and_then(Value::as_array) {
                    columns = cols.iter().filter_map(Value::as_str).collect();
                }
            }
        }

        let (dataset_name, records) = match dataset {
            Some((name, records)) if !records.is_empty() && !columns.is_empty() => (name, records),
            _ => {
                return Err(WaldoError::Validation(format!(
                    "node {}: either the dataset or the parameters are missing in the node input",
                    node.name
                )));
            }
        };

        for column in &columns {
            let numeric = records
                .iter()
                .all(|record| record.get(*column).is_some_and(Value::is_number));
            if !numeric {
                return Err(WaldoError::Validation(format!(
                    "node {}: column `{column}` of input dataset `{dataset_name}` is not numeric",
                    node.name
                )));
            }
        }

        info!(
            node = %node.name,
            dataset = dataset_name,
            columns = ?columns,
            "all parameter columns are numeric"
        );
        Ok(())
    }
}
