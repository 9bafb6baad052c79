//! Pipeline and step configuration.
//!
//! Definitions arrive either from the YAML file read at startup or from
//! `Pipeline` resources watched by the reloader; both deserialize into the
//! same structs. The linear order of `steps` is the application order.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::activation::ActivationFunction;
use super::request::Domain;

/// Errors that can occur while loading pipeline definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The definitions file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML payload did not parse.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A resource spec did not parse.
    #[error("Invalid pipeline spec: {0}")]
    Json(#[from] serde_json::Error),

    /// Two pipelines share a name.
    #[error("Duplicate pipeline name '{0}'")]
    DuplicateName(String),
}

/// One configured step instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Logical step name looked up in the registry.
    pub name: String,
    /// Instance id; defaults to the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Typed options passed verbatim to the step's init.
    #[serde(default)]
    pub options: serde_json::Value,
    /// Aliases this step must run after.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Validations this step opts out of (see `wrappers`).
    #[serde(default)]
    pub disabled_validations: Vec<String>,
}

impl StepConfig {
    /// Creates a step config with defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            options: serde_json::Value::Null,
            depends_on: Vec::new(),
            disabled_validations: Vec::new(),
        }
    }

    /// Sets the instance alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sets the options payload.
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Adds a dependency on another step's alias.
    pub fn with_dependency(mut self, alias: impl Into<String>) -> Self {
        self.depends_on.push(alias.into());
        self
    }

    /// Disables a named validation for this step.
    pub fn without_validation(mut self, validation: impl Into<String>) -> Self {
        self.disabled_validations.push(validation.into());
        self
    }

    /// The effective instance id.
    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// One configured pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub domain: Domain,
    /// The composition law, global across this pipeline's steps.
    #[serde(default)]
    pub activation: ActivationFunction,
    /// Whether runs of this pipeline produce decision records.
    #[serde(default)]
    pub create_decisions: bool,
    /// Steps in application order.
    pub steps: Vec<StepConfig>,
}

/// One column of a declared feature table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
}

/// A SQL-declared feature extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub name: String,
    /// Table semantic; the `feature_` prefix is applied when absent.
    pub table: String,
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub indexes: Vec<String>,
    /// Age in seconds beyond which the table counts as stale.
    #[serde(default = "default_recency_secs")]
    pub recency_window_secs: u64,
    /// The select producing the table's columns in order.
    pub query: String,
    /// Bus topics that trigger a re-extraction.
    #[serde(default)]
    pub triggers: Vec<String>,
}

fn default_recency_secs() -> u64 {
    900
}

/// Root of the startup definitions file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,
    #[serde(default)]
    pub extractors: Vec<ExtractorConfig>,
}

impl PipelineFile {
    /// Loads and checks the startup definitions file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let raw = std::fs::read_to_string(path)?;
        let file: PipelineFile = serde_yaml::from_str(&raw)?;
        file.check_unique_names()?;
        Ok(file)
    }

    fn check_unique_names(&self) -> Result<(), DefinitionError> {
        let mut seen = std::collections::HashSet::new();
        for pipeline in &self.pipelines {
            if !seen.insert(pipeline.name.as_str()) {
                return Err(DefinitionError::DuplicateName(pipeline.name.clone()));
            }
        }
        Ok(())
    }
}

impl PipelineDefinition {
    /// Parses a definition from a `Pipeline` resource spec.
    pub fn from_resource_spec(spec: &serde_json::Value) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_value(spec.clone())?)
    }

    /// Serializes this definition into a resource spec.
    pub fn to_resource_spec(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
