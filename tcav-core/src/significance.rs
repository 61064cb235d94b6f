//! Aggregation of per-baseline TCAV scores and significance testing.
//!
//! A concept counts as influential only if its scores across independent
//! random baselines differ from the scores random directions get.

use crate::error::{Result, TcavError};
use crate::scorer::TcavScore;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::HashSet;

/// Statistical test of concept scores against a null distribution.
pub trait SignificanceTest: Send + Sync {
    fn name(&self) -> &str;

    /// Two-sided p-value, or `None` when the samples cannot support the test.
    fn p_value(&self, concept: &[f64], null: &[f64]) -> Option<f64>;
}

/// Two-sample t-test without the equal-variance assumption.
#[derive(Debug, Clone, Copy, Default)]
pub struct WelchTTest;

impl SignificanceTest for WelchTTest {
    fn name(&self) -> &str {
        "welch_t_test"
    }

    fn p_value(&self, concept: &[f64], null: &[f64]) -> Option<f64> {
        if concept.len() < 2 || null.len() < 2 {
            return None;
        }
        let (n1, n2) = (concept.len() as f64, null.len() as f64);
        let (m1, m2) = (mean(concept), mean(null));
        let (v1, v2) = (variance(concept, m1) / n1, variance(null, m2) / n2);
        let se2 = v1 + v2;
        if se2 <= 0.0 {
            // Both samples constant: identical means are indistinguishable,
            // different means are as separated as they can be.
            return Some(if (m1 - m2).abs() <= f64::EPSILON { 1.0 } else { 0.0 });
        }

        let t = (m1 - m2) / se2.sqrt();
        let df = se2.powi(2) / (v1.powi(2) / (n1 - 1.0) + v2.powi(2) / (n2 - 1.0));
        let dist = StudentsT::new(0.0, 1.0, df).ok()?;
        Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
    }
}

/// Summary of one (concept, layer) pair across random baselines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub concept: String,
    pub layer: String,
    pub scores: Vec<TcavScore>,
    pub mean: f64,
    pub std_dev: f64,
    /// Random-vs-random scores forming the null distribution.
    #[serde(default)]
    pub null_scores: Vec<f64>,
    pub null_mean: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: Option<bool>,
}

pub struct SignificanceAggregator {
    level: f64,
    test: Box<dyn SignificanceTest>,
}

impl Default for SignificanceAggregator {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl SignificanceAggregator {
    /// Welch's t-test at significance `level`.
    pub fn new(level: f64) -> Self {
        Self::with_test(level, Box::new(WelchTTest))
    }

    pub fn with_test(level: f64, test: Box<dyn SignificanceTest>) -> Self {
        Self { level, test }
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    /// Summarize exactly `num_random_exp` scores, one per distinct baseline.
    pub fn aggregate(
        &self,
        concept: &str,
        layer: &str,
        scores: Vec<TcavScore>,
        num_random_exp: usize,
    ) -> Result<SignificanceResult> {
        if num_random_exp == 0 {
            return Err(TcavError::invalid_input("num_random_exp must be at least 1"));
        }
        if scores.len() != num_random_exp {
            return Err(TcavError::invalid_input(format!(
                "expected {num_random_exp} scores for {concept}@{layer}, got {}",
                scores.len()
            )));
        }

        let mut seen = HashSet::new();
        for s in &scores {
            if s.concept != concept || s.layer != layer {
                return Err(TcavError::invalid_input(format!(
                    "score for {}@{} passed to {concept}@{layer}",
                    s.concept, s.layer
                )));
            }
            let Some(baseline) = s.baseline.as_deref() else {
                return Err(TcavError::invalid_input(format!(
                    "score for {concept}@{layer} has no random baseline"
                )));
            };
            if !seen.insert(baseline) {
                return Err(TcavError::invalid_input(format!(
                    "random baseline '{baseline}' used more than once for {concept}@{layer}"
                )));
            }
        }

        let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
        let m = mean(&values);
        Ok(SignificanceResult {
            concept: concept.to_string(),
            layer: layer.to_string(),
            mean: m,
            std_dev: variance(&values, m).sqrt(),
            scores,
            null_scores: Vec::new(),
            null_mean: None,
            p_value: None,
            significant: None,
        })
    }

    /// Attach random-vs-random scores and the resulting p-value.
    pub fn compare_to_null(
        &self,
        mut result: SignificanceResult,
        null: &[TcavScore],
    ) -> SignificanceResult {
        let concept: Vec<f64> = result.scores.iter().map(|s| s.score).collect();
        let null: Vec<f64> = null.iter().map(|s| s.score).collect();

        result.null_mean = (!null.is_empty()).then(|| mean(&null));
        result.p_value = self.test.p_value(&concept, &null);
        result.significant = result.p_value.map(|p| p < self.level);
        result.null_scores = null;

        tracing::info!(
            concept = %result.concept,
            layer = %result.layer,
            mean = result.mean,
            null_mean = ?result.null_mean,
            p_value = ?result.p_value,
            test = self.test.name(),
            "Significance"
        );
        result
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance; 0 for fewer than two values.
fn variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}
