//! Cortex external scheduling advisor.
//!
//! Upstream cloud schedulers delegate their weighing phase to Cortex over
//! HTTP. Cortex runs a configured pipeline of weighing steps against the
//! candidate hosts, consults feature tables maintained by the extractor
//! runtime, and returns a totally ordered preference list.

// Core modules
pub mod bus;
pub mod cli;
pub mod config;
pub mod decisions;
pub mod descheduler;
pub mod extractor;
pub mod identity;
pub mod metrics;
pub mod scheduling;
pub mod server;
pub mod store;

// Re-export the types adapters interact with most.
pub use config::CortexConfig;
pub use scheduling::pipeline::{Pipeline, PipelineError, PipelineOutcome};
pub use scheduling::request::{Domain, ExternalSchedulerRequest, PipelineRequest};
pub use scheduling::step::{StepResult, WeighingStep};
