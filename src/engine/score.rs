//! Score vectors and the acceptance decision.

use serde::{Deserialize, Serialize};

/// Dimension weights for the overall score.
pub const LAYOUT_WEIGHT: f64 = 0.3;
pub const STYLE_WEIGHT: f64 = 0.3;
pub const A11Y_WEIGHT: f64 = 0.2;
pub const PERCEPTUAL_WEIGHT: f64 = 0.2;

/// Minimum improvement over the best score for a candidate to be accepted.
pub const DEFAULT_EPSILON: f64 = 0.01;

/// Per-dimension similarity scores in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreVector {
    pub layout: f64,
    pub style: f64,
    pub a11y: f64,
    pub perceptual: f64,
}

impl ScoreVector {
    /// Neutral fallback used when a scorer response cannot be parsed.
    pub fn neutral() -> Self {
        Self {
            layout: 0.5,
            style: 0.5,
            a11y: 0.5,
            perceptual: 0.5,
        }
    }

    /// Weighted overall score, rounded to two decimals.
    pub fn overall(&self) -> f64 {
        round2(
            self.layout * LAYOUT_WEIGHT
                + self.style * STYLE_WEIGHT
                + self.a11y * A11Y_WEIGHT
                + self.perceptual * PERCEPTUAL_WEIGHT,
        )
    }

    /// Mean across breakpoints, per dimension, rounded to two decimals.
    pub fn mean(scores: &[ScoreVector]) -> Option<ScoreVector> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as f64;
        Some(ScoreVector {
            layout: round2(scores.iter().map(|s| s.layout).sum::<f64>() / n),
            style: round2(scores.iter().map(|s| s.style).sum::<f64>() / n),
            a11y: round2(scores.iter().map(|s| s.a11y).sum::<f64>() / n),
            perceptual: round2(scores.iter().map(|s| s.perceptual).sum::<f64>() / n),
        })
    }
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Parse a scorer response. Any shape violation (missing key, non-number,
/// out-of-range value) falls back to the neutral vector.
pub fn parse_score_response(value: &serde_json::Value) -> ScoreVector {
    let dim = |key: &str| -> Option<f64> {
        let v = value.get(key)?.as_f64()?;
        (0.0..=1.0).contains(&v).then_some(v)
    };
    match (dim("layout"), dim("style"), dim("a11y"), dim("perceptual")) {
        (Some(layout), Some(style), Some(a11y), Some(perceptual)) => ScoreVector {
            layout,
            style,
            a11y,
            perceptual,
        },
        _ => ScoreVector::neutral(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptReason {
    Improved,
    Regression,
    NoImprovement,
}

impl AcceptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improved => "improved",
            Self::Regression => "regression",
            Self::NoImprovement => "no_improvement",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcceptDecision {
    pub accepted: bool,
    pub reason: AcceptReason,
}

/// Tracks the best overall score seen so far and decides whether each
/// candidate iteration is an improvement.
#[derive(Debug)]
pub struct Scorekeeper {
    epsilon: f64,
    best_score: Option<f64>,
    best_iteration: Option<u32>,
}

impl Scorekeeper {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            best_score: None,
            best_iteration: None,
        }
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    pub fn best_iteration(&self) -> Option<u32> {
        self.best_iteration
    }

    /// Judge a candidate overall score. The first candidate is always
    /// accepted; afterwards a candidate must clear the best score by ε.
    pub fn evaluate(&mut self, iteration: u32, candidate: f64) -> AcceptDecision {
        let Some(best) = self.best_score else {
            self.best_score = Some(candidate);
            self.best_iteration = Some(iteration);
            return AcceptDecision {
                accepted: true,
                reason: AcceptReason::Improved,
            };
        };

        if candidate >= best + self.epsilon {
            self.best_score = Some(candidate);
            self.best_iteration = Some(iteration);
            AcceptDecision {
                accepted: true,
                reason: AcceptReason::Improved,
            }
        } else if candidate < best - self.epsilon {
            AcceptDecision {
                accepted: false,
                reason: AcceptReason::Regression,
            }
        } else {
            AcceptDecision {
                accepted: false,
                reason: AcceptReason::NoImprovement,
            }
        }
    }
}
