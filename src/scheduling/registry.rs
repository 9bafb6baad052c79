//! Step registry.
//!
//! A compile-time mapping from logical step names to constructors, closed
//! under the domain. Pipelines fail fast at build time when a configured
//! name is unknown; there is no dynamic discovery.

use std::collections::HashMap;

use thiserror::Error;

use super::request::PipelineRequest;
use super::step::WeighingStep;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested step name has no registered constructor.
    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    /// A step name was registered twice.
    #[error("Step '{0}' already registered")]
    DuplicateStep(String),
}

/// Constructor producing a fresh, uninitialised step instance.
pub type StepConstructor<R> = fn() -> Box<dyn WeighingStep<R>>;

/// Name-to-constructor registry for one request domain.
pub struct StepRegistry<R: PipelineRequest> {
    constructors: HashMap<String, StepConstructor<R>>,
}

impl<R: PipelineRequest> Default for StepRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: PipelineRequest> StepRegistry<R> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers a constructor under a logical name.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateStep` when the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: StepConstructor<R>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(RegistryError::DuplicateStep(name));
        }
        self.constructors.insert(name, constructor);
        Ok(())
    }

    /// Builds a fresh step instance for the given name.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownStep` for unregistered names; the
    /// caller treats that as a fatal configuration error.
    pub fn build(&self, name: &str) -> Result<Box<dyn WeighingStep<R>>, RegistryError> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| RegistryError::UnknownStep(name.to_string()))
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered constructors.
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::request::ExternalSchedulerRequest;
    use crate::scheduling::step::{StepError, StepHandles, StepResult};
    use crate::scheduling::request::RequestContext;
    use async_trait::async_trait;

    #[derive(Default)]
    struct NoopStep {
        alias: String,
    }

    #[async_trait]
    impl crate::scheduling::step::WeighingStep<ExternalSchedulerRequest> for NoopStep {
        fn name(&self) -> &str {
            "noop"
        }

        fn alias(&self) -> &str {
            &self.alias
        }

        async fn init(
            &mut self,
            alias: String,
            _handles: StepHandles,
            _options: serde_json::Value,
        ) -> Result<(), StepError> {
            self.alias = alias;
            Ok(())
        }

        async fn run(
            &self,
            _ctx: &RequestContext,
            _request: &ExternalSchedulerRequest,
        ) -> Result<StepResult, StepError> {
            Ok(StepResult::default())
        }
    }

    #[test]
    fn test_register_and_build() {
        let mut registry: StepRegistry<ExternalSchedulerRequest> = StepRegistry::new();
        registry
            .register("noop", || Box::new(NoopStep::default()))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["noop"]);

        let step = registry.build("noop").unwrap();
        assert_eq!(step.name(), "noop");
    }

    #[test]
    fn test_unknown_step_is_an_error() {
        let registry: StepRegistry<ExternalSchedulerRequest> = StepRegistry::new();
        assert!(matches!(
            registry.build("missing"),
            Err(RegistryError::UnknownStep(ref name)) if name == "missing"
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry: StepRegistry<ExternalSchedulerRequest> = StepRegistry::new();
        registry
            .register("noop", || Box::new(NoopStep::default()))
            .unwrap();
        assert!(matches!(
            registry.register("noop", || Box::new(NoopStep::default())),
            Err(RegistryError::DuplicateStep(_))
        ));
    }
}
