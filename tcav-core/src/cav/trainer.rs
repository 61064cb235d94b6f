//! CAV training: an L2-regularized logistic regression between concept and
//! random activations, keeping the most accurate candidate.

use super::{Cav, CavKey};
use crate::activation::ActivationSet;
use crate::error::{Result, TcavError};
use chrono::Utc;
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

const MIN_EXAMPLES: usize = 2;

/// Optimizer settings for the linear classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Solver iterations per candidate alpha.
    #[serde(default = "default_max_iter")]
    pub max_iter: u64,
    /// Stop once the gradient norm falls below this.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Rescale the direction to unit length. Never changes the score.
    #[serde(default)]
    pub normalize_direction: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            tolerance: default_tolerance(),
            normalize_direction: false,
        }
    }
}

fn default_max_iter() -> u64 {
    100
}

fn default_tolerance() -> f64 {
    1e-4
}

/// Per-feature standardization fitted on the combined design matrix.
struct Standardized {
    design: Array2<f64>,
    mean: Array1<f64>,
    scale: Array1<f64>,
}

fn standardize(raw: Array2<f64>) -> Result<Standardized> {
    let mean = raw
        .mean_axis(Axis(0))
        .ok_or_else(|| TcavError::invalid_input("cannot standardize an empty design matrix"))?;
    // Constant features keep unit scale so they contribute zero, not NaN.
    let scale = raw
        .std_axis(Axis(0), 0.0)
        .mapv(|s| if s <= f64::EPSILON { 1.0 } else { s });
    let design = (&raw - &mean) / &scale;
    Ok(Standardized {
        design,
        mean,
        scale,
    })
}

struct LinearFit {
    weights: Array1<f64>,
    intercept: f64,
    accuracy: f64,
}

/// Trains CAVs. Pure: nothing is persisted here.
#[derive(Debug, Clone, Default)]
pub struct CavTrainer {
    config: TrainerConfig,
}

impl CavTrainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Fit one classifier per alpha and keep the most accurate direction.
    ///
    /// Ties keep the earlier alpha.
    pub fn train(
        &self,
        key: CavKey,
        concept: &ActivationSet,
        random: &ActivationSet,
        alphas: &[f64],
    ) -> Result<Cav> {
        if alphas.is_empty() {
            return Err(TcavError::invalid_input("no regularization candidates given"));
        }
        if let Some(bad) = alphas.iter().find(|a| !a.is_finite() || **a <= 0.0) {
            return Err(TcavError::invalid_input(format!(
                "regularization strength must be positive, got {bad}"
            )));
        }
        if concept.len() < MIN_EXAMPLES {
            return Err(TcavError::insufficient_data(
                &key.concept,
                MIN_EXAMPLES,
                concept.len(),
            ));
        }
        if random.len() < MIN_EXAMPLES {
            return Err(TcavError::insufficient_data(
                &key.baseline,
                MIN_EXAMPLES,
                random.len(),
            ));
        }
        if concept.dim() != random.dim() {
            return Err(TcavError::DimensionMismatch {
                expected: concept.dim(),
                actual: random.dim(),
            });
        }

        let (raw, labels) = design_matrix(concept, random)?;
        let scaled = standardize(raw)?;

        tracing::debug!(
            key = %key,
            samples = scaled.design.nrows(),
            features = scaled.design.ncols(),
            "Training CAV"
        );

        let mut best: Option<(f64, LinearFit)> = None;
        for &alpha in alphas {
            let fit = self.fit_logistic(&scaled.design, &labels, alpha)?;
            tracing::debug!(
                key = %key,
                alpha,
                accuracy = fit.accuracy,
                "Fitted candidate classifier"
            );
            if best.as_ref().is_none_or(|(_, b)| fit.accuracy > b.accuracy) {
                best = Some((alpha, fit));
            }
        }
        let Some((alpha, fit)) = best else {
            return Err(TcavError::invalid_input("no classifier was fitted"));
        };

        let mut direction = fit.weights;
        if self.config.normalize_direction {
            let norm = direction.dot(&direction).sqrt();
            if norm > 0.0 {
                direction.mapv_inplace(|w| w / norm);
            }
        }

        tracing::info!(key = %key, alpha, accuracy = fit.accuracy, "Trained CAV");
        Ok(Cav {
            concept: key.concept,
            layer: key.layer,
            baseline: key.baseline,
            direction: direction.to_vec(),
            intercept: fit.intercept,
            alpha,
            accuracy: fit.accuracy,
            feature_mean: scaled.mean.to_vec(),
            feature_scale: scaled.scale.to_vec(),
            normalized: self.config.normalize_direction,
            trained_at: Utc::now(),
        })
    }

    /// Minimizes `sum(logloss) + alpha / 2 * ||w||^2` with the intercept
    /// unpenalized, i.e. inverse regularization strength `C = 1 / alpha`.
    fn fit_logistic(&self, x: &Array2<f64>, y: &Array1<usize>, alpha: f64) -> Result<LinearFit> {
        let dataset = Dataset::new(x.clone(), y.clone());
        let model = LogisticRegression::default()
            .alpha(alpha)
            .max_iterations(self.config.max_iter)
            .gradient_tolerance(self.config.tolerance)
            .fit(&dataset)
            .map_err(|e| TcavError::Training(format!("logistic regression (alpha {alpha}): {e}")))?;

        let predictions = model.predict(x);
        let mut weights = model.params().clone();
        let mut intercept = model.intercept();

        // The solver picks its own positive class; orient the direction
        // so that positive decision values mean "concept".
        let decisions = x.dot(&weights) + intercept;
        let agreeing = decisions
            .iter()
            .zip(predictions.iter())
            .filter(|(d, p)| (**d > 0.0) == (**p == 1))
            .count();
        if agreeing * 2 < predictions.len() {
            weights.mapv_inplace(|w| -w);
            intercept = -intercept;
        }

        let correct = predictions
            .iter()
            .zip(y.iter())
            .filter(|(p, t)| p == t)
            .count();

        Ok(LinearFit {
            weights,
            intercept,
            accuracy: correct as f64 / y.len() as f64,
        })
    }
}

/// Stack concept rows (label 1) above random rows (label 0).
fn design_matrix(
    concept: &ActivationSet,
    random: &ActivationSet,
) -> Result<(Array2<f64>, Array1<usize>)> {
    let n = concept.len() + random.len();
    let flat: Vec<f64> = concept
        .iter()
        .chain(random.iter())
        .flat_map(|row| row.iter().copied())
        .collect();
    let x = Array2::from_shape_vec((n, concept.dim()), flat)
        .map_err(|e| TcavError::invalid_input(format!("cannot build design matrix: {e}")))?;
    let y: Array1<usize> = std::iter::repeat_n(1, concept.len())
        .chain(std::iter::repeat_n(0, random.len()))
        .collect();
    Ok((x, y))
}
