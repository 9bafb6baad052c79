//! Activation composition.
//!
//! The composition law combining incoming weights with one step's
//! activations. It is injected per pipeline and global across that
//! pipeline's steps; additive is the default the upstream contract
//! assumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The composition law for one pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationFunction {
    /// `w' = w + a`
    #[default]
    Additive,
    /// `w' = w * a`
    Multiplicative,
    /// `w' = max(w, a)`
    Max,
}

impl ActivationFunction {
    /// Combines one weight with one activation.
    pub fn combine(&self, weight: f64, activation: f64) -> f64 {
        match self {
            ActivationFunction::Additive => weight + activation,
            ActivationFunction::Multiplicative => weight * activation,
            ActivationFunction::Max => weight.max(activation),
        }
    }

    /// Applies one step's activations to the running weights in place.
    ///
    /// Subjects outside the activation map keep their weight, unless the
    /// step is allowed to remove subjects, in which case omission removes
    /// them. Activations for subjects no longer in the running weight map
    /// are ignored either way.
    pub fn apply(
        &self,
        weights: &mut HashMap<String, f64>,
        activations: &HashMap<String, f64>,
        allow_removals: bool,
    ) {
        if allow_removals {
            weights.retain(|subject, _| activations.contains_key(subject));
        }
        for (subject, weight) in weights.iter_mut() {
            if let Some(activation) = activations.get(subject) {
                *weight = self.combine(*weight, *activation);
            }
        }
    }
}
