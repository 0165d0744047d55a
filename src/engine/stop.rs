//! Run stop conditions, applied in order; the first match wins.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    RegressionLimit,
    Plateau,
    TimeBudget,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxIterations => "max_iterations",
            Self::RegressionLimit => "regression_limit",
            Self::Plateau => "plateau",
            Self::TimeBudget => "time_budget",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopController {
    pub max_iterations: u32,
    pub max_consecutive_rejections: u32,
    pub plateau_window: usize,
    pub plateau_threshold: f64,
    pub time_budget: Duration,
}

/// Inputs the controller judges after each iteration.
pub struct StopInputs<'a> {
    pub iteration: u32,
    pub accepted_scores: &'a [f64],
    pub consecutive_rejections: u32,
    pub start_time: Instant,
}

impl StopController {
    pub fn check(&self, inputs: &StopInputs<'_>) -> Option<StopReason> {
        if inputs.iteration >= self.max_iterations.saturating_sub(1) {
            return Some(StopReason::MaxIterations);
        }
        if inputs.consecutive_rejections >= self.max_consecutive_rejections {
            return Some(StopReason::RegressionLimit);
        }
        if inputs.accepted_scores.len() >= self.plateau_window {
            let window = &inputs.accepted_scores[inputs.accepted_scores.len() - self.plateau_window..];
            let max = window.iter().copied().fold(f64::MIN, f64::max);
            let min = window.iter().copied().fold(f64::MAX, f64::min);
            if max - min < self.plateau_threshold {
                return Some(StopReason::Plateau);
            }
        }
        if inputs.start_time.elapsed() > self.time_budget {
            return Some(StopReason::TimeBudget);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> StopController {
        StopController {
            max_iterations: 10,
            max_consecutive_rejections: 3,
            plateau_window: 3,
            plateau_threshold: 0.01,
            time_budget: Duration::from_secs(900),
        }
    }

    fn inputs<'a>(iteration: u32, scores: &'a [f64], rejections: u32) -> StopInputs<'a> {
        StopInputs {
            iteration,
            accepted_scores: scores,
            consecutive_rejections: rejections,
            start_time: Instant::now(),
        }
    }

    #[test]
    fn test_continues_mid_run() {
        assert_eq!(controller().check(&inputs(2, &[0.5, 0.7], 0)), None);
    }

    #[test]
    fn test_max_iterations_at_last_index() {
        assert_eq!(
            controller().check(&inputs(9, &[], 0)),
            Some(StopReason::MaxIterations)
        );
    }

    #[test]
    fn test_single_iteration_budget_stops_immediately() {
        let c = StopController {
            max_iterations: 1,
            ..controller()
        };
        assert_eq!(c.check(&inputs(0, &[0.4], 0)), Some(StopReason::MaxIterations));
    }

    #[test]
    fn test_regression_limit() {
        assert_eq!(
            controller().check(&inputs(4, &[0.8], 3)),
            Some(StopReason::RegressionLimit)
        );
        assert_eq!(controller().check(&inputs(4, &[0.8], 2)), None);
    }

    #[test]
    fn test_plateau_over_last_window() {
        // Last three accepted scores move by less than the threshold.
        let scores = [0.80, 0.805, 0.806, 0.807];
        assert_eq!(
            controller().check(&inputs(3, &scores, 0)),
            Some(StopReason::Plateau)
        );

        // A widening window entry outside the last three does not matter.
        let scores = [0.10, 0.805, 0.806, 0.807];
        assert_eq!(
            controller().check(&inputs(3, &scores, 0)),
            Some(StopReason::Plateau)
        );

        // Still improving: no plateau.
        let scores = [0.60, 0.70, 0.80];
        assert_eq!(controller().check(&inputs(2, &scores, 0)), None);
    }

    #[test]
    fn test_ordering_max_iterations_beats_plateau() {
        let scores = [0.80, 0.805, 0.806];
        assert_eq!(
            controller().check(&inputs(9, &scores, 0)),
            Some(StopReason::MaxIterations)
        );
    }

    #[test]
    fn test_time_budget() {
        let c = StopController {
            time_budget: Duration::from_millis(0),
            ..controller()
        };
        let inputs = StopInputs {
            iteration: 1,
            accepted_scores: &[0.5],
            consecutive_rejections: 0,
            start_time: Instant::now() - Duration::from_secs(1),
        };
        assert_eq!(c.check(&inputs), Some(StopReason::TimeBudget));
    }
}
