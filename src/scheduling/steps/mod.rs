//! Built-in weighing steps.
//!
//! Domain plugins live with their operators; the crate itself ships only
//! the generic [`TableWeigherStep`], which turns any numeric feature
//! table column into activations. Everything else registers through
//! [`builtin_registry`] at startup.

pub mod table_weigher;

pub use table_weigher::TableWeigherStep;

use super::registry::StepRegistry;
use super::request::ExternalSchedulerRequest;

/// The registry of steps compiled into this binary.
pub fn builtin_registry() -> StepRegistry<ExternalSchedulerRequest> {
    let mut registry = StepRegistry::new();
    registry
        .register("table_weigher", || Box::new(TableWeigherStep::default()))
        .expect("builtin step names are unique");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_contents() {
        let registry = builtin_registry();
        assert_eq!(registry.names(), vec!["table_weigher"]);

        let step = registry.build("table_weigher").unwrap();
        assert_eq!(step.name(), "table_weigher");
    }
}
