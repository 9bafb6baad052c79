//! The scheduling pipeline runtime.
//!
//! This is the core of Cortex: a framework, generic over the request
//! domain, that loads a DAG of weighing steps from configuration, executes
//! them with parallelism where the declared dependencies allow it, composes
//! their activations in strict application order, and emits a totally
//! ordered subject list with the per-step reasoning attached.

pub mod activation;
pub mod definition;
pub mod pipeline;
pub mod registry;
pub mod reloader;
pub mod request;
pub mod schedule;
pub mod step;
pub mod steps;
pub mod wrappers;

pub use activation::ActivationFunction;
pub use definition::{PipelineDefinition, StepConfig};
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineState, StepOutcome};
pub use registry::StepRegistry;
pub use reloader::{PipelineReloader, PipelineSet};
pub use request::{Domain, ExternalSchedulerRequest, PipelineRequest, RequestContext};
pub use step::{StepHandles, StepResult, WeighingStep};
