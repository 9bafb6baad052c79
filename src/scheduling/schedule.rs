//! Execution scheduling.
//!
//! Turns the linear step configuration into a sequence of parallel groups
//! honouring the declared dependencies. The application order stays the
//! configuration order no matter how the groups complete; the schedule
//! only decides what may run concurrently.

use std::collections::HashMap;

use thiserror::Error;

use super::definition::StepConfig;

/// Errors in the declared step dependency structure.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Two configured steps share an alias.
    #[error("Duplicate step alias '{0}'")]
    DuplicateAlias(String),

    /// A dependency names an alias that is not configured.
    #[error("Step '{alias}' depends on unknown alias '{dependency}'")]
    UnknownDependency { alias: String, dependency: String },

    /// The dependencies contain a cycle.
    #[error("Dependency cycle involving step '{0}'")]
    CycleDetected(String),
}

/// The parallel-group schedule over step indices.
///
/// Each inner vector is one wave; every wave completes before the next
/// starts. Indices refer to the configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSchedule {
    pub groups: Vec<Vec<usize>>,
}

impl ExecutionSchedule {
    /// Total number of scheduled steps.
    pub fn step_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

/// Partitions the configured steps into parallel groups.
///
/// Kahn layering: every wave takes all steps whose dependencies are
/// already scheduled, in configuration order. Steps with no mutual
/// dependency land in the same wave.
///
/// # Errors
///
/// Returns `ScheduleError` on duplicate aliases, unknown dependencies, or
/// cycles.
pub fn build_schedule(steps: &[StepConfig]) -> Result<ExecutionSchedule, ScheduleError> {
    let mut index_by_alias: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (idx, step) in steps.iter().enumerate() {
        let alias = step.effective_alias();
        if index_by_alias.insert(alias, idx).is_some() {
            return Err(ScheduleError::DuplicateAlias(alias.to_string()));
        }
    }

    // Resolve dependencies to indices up front so unknown aliases fail
    // before any grouping happens.
    let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
    for step in steps {
        let mut resolved = Vec::with_capacity(step.depends_on.len());
        for dependency in &step.depends_on {
            match index_by_alias.get(dependency.as_str()) {
                Some(&idx) => resolved.push(idx),
                None => {
                    return Err(ScheduleError::UnknownDependency {
                        alias: step.effective_alias().to_string(),
                        dependency: dependency.clone(),
                    })
                }
            }
        }
        dependencies.push(resolved);
    }

    let mut scheduled = vec![false; steps.len()];
    let mut groups = Vec::new();
    let mut remaining = steps.len();

    while remaining > 0 {
        let mut wave = Vec::new();
        for idx in 0..steps.len() {
            if scheduled[idx] {
                continue;
            }
            if dependencies[idx].iter().all(|&dep| scheduled[dep]) {
                wave.push(idx);
            }
        }

        if wave.is_empty() {
            // Nothing became schedulable: the rest of the graph is cyclic.
            let stuck = steps
                .iter()
                .enumerate()
                .find(|(idx, _)| !scheduled[*idx])
                .map(|(_, step)| step.effective_alias().to_string())
                .unwrap_or_default();
            return Err(ScheduleError::CycleDetected(stuck));
        }

        for &idx in &wave {
            scheduled[idx] = true;
        }
        remaining -= wave.len();
        groups.push(wave);
    }

    Ok(ExecutionSchedule { groups })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> StepConfig {
        StepConfig::new(name)
    }

    #[test]
    fn test_independent_steps_share_one_wave() {
        let steps = vec![step("a"), step("b"), step("c")];
        let schedule = build_schedule(&steps).unwrap();

        assert_eq!(schedule.groups, vec![vec![0, 1, 2]]);
        assert_eq!(schedule.step_count(), 3);
    }

    #[test]
    fn test_chain_produces_one_wave_each() {
        let steps = vec![
            step("a"),
            step("b").with_dependency("a"),
            step("c").with_dependency("b"),
        ];
        let schedule = build_schedule(&steps).unwrap();

        assert_eq!(schedule.groups, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_diamond_dependencies() {
        let steps = vec![
            step("root"),
            step("left").with_dependency("root"),
            step("right").with_dependency("root"),
            step("join")
                .with_dependency("left")
                .with_dependency("right"),
        ];
        let schedule = build_schedule(&steps).unwrap();

        assert_eq!(schedule.groups, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_wave_order_is_configuration_order() {
        // "b" is configured before "c"; both are independent.
        let steps = vec![step("b"), step("c"), step("a").with_dependency("c")];
        let schedule = build_schedule(&steps).unwrap();

        assert_eq!(schedule.groups, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let steps = vec![step("x"), step("y").with_alias("x")];
        assert!(matches!(
            build_schedule(&steps),
            Err(ScheduleError::DuplicateAlias(ref alias)) if alias == "x"
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let steps = vec![step("a").with_dependency("ghost")];
        match build_schedule(&steps) {
            Err(ScheduleError::UnknownDependency { alias, dependency }) => {
                assert_eq!(alias, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected unknown dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![
            step("a").with_dependency("b"),
            step("b").with_dependency("a"),
        ];
        assert!(matches!(
            build_schedule(&steps),
            Err(ScheduleError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![step("a").with_dependency("a")];
        assert!(matches!(
            build_schedule(&steps),
            Err(ScheduleError::CycleDetected(ref alias)) if alias == "a"
        ));
    }

    #[test]
    fn test_empty_configuration() {
        let schedule = build_schedule(&[]).unwrap();
        assert!(schedule.groups.is_empty());
        assert_eq!(schedule.step_count(), 0);
    }
}
