//! TCAV score: the share of target-class activations that point along a CAV.

use crate::activation::ActivationSet;
use crate::cav::Cav;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Coordinates in which target activations meet the CAV direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityFrame {
    /// Project through the CAV's training standardization first.
    #[default]
    Standardized,
    /// Dot product with the activation as produced by the model.
    Raw,
}

/// Score of one CAV against one target class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcavScore {
    pub concept: String,
    pub layer: String,
    pub baseline: Option<String>,
    /// In `[0, 1]`.
    pub score: f64,
    pub positive: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcavScorer {
    frame: SensitivityFrame,
}

impl TcavScorer {
    pub fn new(frame: SensitivityFrame) -> Self {
        Self { frame }
    }

    pub fn frame(&self) -> SensitivityFrame {
        self.frame
    }

    /// Fraction of `targets` with strictly positive sensitivity along `cav`.
    ///
    /// An empty target set scores 0 rather than failing. That usually means
    /// the target class has no examples, so it is logged as a warning.
    pub fn score(&self, targets: &ActivationSet, cav: &Cav) -> Result<TcavScore> {
        let total = targets.len();
        let mut positive = 0;
        for activation in targets.iter() {
            if cav.sensitivity(activation, self.frame)? > 0.0 {
                positive += 1;
            }
        }

        let score = if total > 0 {
            positive as f64 / total as f64
        } else {
            tracing::warn!(
                concept = %cav.concept,
                layer = %cav.layer,
                "No target activations to score; reporting 0"
            );
            0.0
        };

        tracing::info!(
            concept = %cav.concept,
            layer = %cav.layer,
            baseline = %cav.baseline,
            score,
            "TCAV score"
        );
        Ok(TcavScore {
            concept: cav.concept.clone(),
            layer: cav.layer.clone(),
            baseline: Some(cav.baseline.clone()),
            score,
            positive,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TcavError;
    use chrono::Utc;

    fn cav(direction: Vec<f64>) -> Cav {
        let dim = direction.len();
        Cav {
            concept: "striped".into(),
            layer: "mixed4c".into(),
            baseline: "random500_0".into(),
            direction,
            intercept: 0.0,
            alpha: 0.1,
            accuracy: 1.0,
            feature_mean: vec![0.0; dim],
            feature_scale: vec![1.0; dim],
            normalized: false,
            trained_at: Utc::now(),
        }
    }

    #[test]
    fn test_counts_strictly_positive() {
        let targets = ActivationSet::new(vec![
            vec![1.0, 0.0],
            vec![-1.0, 0.0],
            vec![0.0, 0.0],
            vec![2.0, 1.0],
        ])
        .unwrap();
        let score = TcavScorer::default()
            .score(&targets, &cav(vec![1.0, 0.0]))
            .unwrap();
        assert_eq!(score.positive, 2);
        assert_eq!(score.total, 4);
        assert_eq!(score.score, 0.5);
        assert_eq!(score.baseline.as_deref(), Some("random500_0"));
    }

    #[test]
    fn test_empty_targets_score_zero() {
        let score = TcavScorer::default()
            .score(&ActivationSet::empty(), &cav(vec![1.0, 2.0]))
            .unwrap();
        assert_eq!(score.score, 0.0);
        assert_eq!(score.total, 0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let targets = ActivationSet::new(vec![vec![1.0, 2.0, 3.0]]).unwrap();
        let err = TcavScorer::default()
            .score(&targets, &cav(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, TcavError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_direction_scale_does_not_change_score() {
        let targets =
            ActivationSet::new(vec![vec![0.3, -0.2], vec![-0.5, 0.1], vec![0.4, 0.4]]).unwrap();
        let scorer = TcavScorer::new(SensitivityFrame::Raw);
        let unit = scorer.score(&targets, &cav(vec![0.6, 0.8])).unwrap();
        let scaled = scorer.score(&targets, &cav(vec![6.0, 8.0])).unwrap();
        assert_eq!(unit.score, scaled.score);
    }
}
