//! Concept activation vectors.

pub mod store;
pub mod trainer;

pub use store::{CavPersistence, CavStore, JsonCavPersistence, MemoryCavPersistence};
pub use trainer::{CavTrainer, TrainerConfig};

use crate::error::{Result, TcavError};
use crate::scorer::SensitivityFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a trained CAV: which concept, at which layer, against which
/// random baseline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CavKey {
    pub concept: String,
    pub layer: String,
    pub baseline: String,
}

impl CavKey {
    pub fn new(
        concept: impl Into<String>,
        layer: impl Into<String>,
        baseline: impl Into<String>,
    ) -> Self {
        Self {
            concept: concept.into(),
            layer: layer.into(),
            baseline: baseline.into(),
        }
    }
}

impl fmt::Display for CavKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} vs {}", self.concept, self.layer, self.baseline)
    }
}

/// A direction in a layer's activation space separating a concept from a
/// random baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cav {
    pub concept: String,
    pub layer: String,
    pub baseline: String,
    /// Normal of the separating hyperplane, in standardized feature space.
    pub direction: Vec<f64>,
    pub intercept: f64,
    /// Regularization strength of the selected classifier.
    pub alpha: f64,
    /// In-sample accuracy of the selected classifier.
    pub accuracy: f64,
    pub feature_mean: Vec<f64>,
    pub feature_scale: Vec<f64>,
    #[serde(default)]
    pub normalized: bool,
    pub trained_at: DateTime<Utc>,
}

impl Cav {
    pub fn key(&self) -> CavKey {
        CavKey::new(&self.concept, &self.layer, &self.baseline)
    }

    pub fn dim(&self) -> usize {
        self.direction.len()
    }

    /// Directional sensitivity of one activation vector.
    pub fn sensitivity(&self, activation: &[f64], frame: SensitivityFrame) -> Result<f64> {
        if activation.len() != self.dim() {
            return Err(TcavError::DimensionMismatch {
                expected: self.dim(),
                actual: activation.len(),
            });
        }
        let dot = match frame {
            SensitivityFrame::Raw => dot(&self.direction, activation),
            SensitivityFrame::Standardized => self
                .direction
                .iter()
                .zip(activation)
                .zip(self.feature_mean.iter().zip(&self.feature_scale))
                .map(|((w, x), (mean, scale))| w * (x - mean) / scale)
                .sum(),
        };
        Ok(dot)
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
