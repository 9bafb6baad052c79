//! The feature extractor runtime.
//!
//! Extractor plugins keep aggregate feature tables fresh. The dispatcher
//! subscribes to the union of all plugin triggers on the message bus,
//! coalesces duplicate triggers down to one pending job per extractor,
//! and drains the queue with a bounded worker pool. Each successful run
//! announces `feature/<table>/synced`, which downstream extractors and
//! pipelines may depend on; cycles in that graph are rejected at startup.

pub mod dispatcher;
pub mod plugin;

pub use dispatcher::ExtractorRuntime;
pub use plugin::{ExtractorError, FeatureExtractor, SqlFeatureExtractor};
