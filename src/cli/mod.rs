//! Command-line interface for Cortex.
//!
//! Provides the `serve` daemon entry point, a `migrate` helper, and the
//! interactive `spawner` picker for operators.

mod commands;
mod spawner;

pub use commands::{parse_cli, run, run_with_cli};
pub use spawner::SpawnerArgs;
