//! Stop policy: plateau, robustness-failure and rate-limit-pause thresholds

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::RobustnessLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopPolicy {
    /// Champion hysteresis: a new score must beat the stored one by more than this
    pub min_delta: Decimal,
    pub plateau_limit: u32,
    pub max_robustness_failures: u32,
    pub max_rate_limit_pauses: u32,
}

impl StopPolicy {
    pub fn for_level(level: RobustnessLevel) -> Self {
        match level {
            RobustnessLevel::Lite => Self {
                min_delta: dec!(0.01),
                plateau_limit: 5,
                max_robustness_failures: 5,
                max_rate_limit_pauses: 5,
            },
            RobustnessLevel::Standard => Self {
                min_delta: dec!(0.02),
                plateau_limit: 4,
                max_robustness_failures: 3,
                max_rate_limit_pauses: 3,
            },
            RobustnessLevel::Strict => Self {
                min_delta: dec!(0.05),
                plateau_limit: 3,
                max_robustness_failures: 2,
                max_rate_limit_pauses: 2,
            },
        }
    }

    /// Reason to end the session as completed after an experiment, if any
    pub fn completion_reason(
        &self,
        no_improvement: u32,
        robustness_failures: u32,
    ) -> Option<StopReason> {
        if no_improvement >= self.plateau_limit {
            Some(StopReason::Plateau(no_improvement))
        } else if robustness_failures >= self.max_robustness_failures {
            Some(StopReason::RobustnessFailures(robustness_failures))
        } else {
            None
        }
    }

    /// Pauses are tolerated up to the limit; one more stops the session
    pub fn rate_limit_exhausted(&self, pauses: u32) -> bool {
        pauses > self.max_rate_limit_pauses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Plateau(u32),
    RobustnessFailures(u32),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Plateau(n) => write!(f, "plateau: {n} experiments without improvement"),
            StopReason::RobustnessFailures(n) => {
                write!(f, "{n} consecutive robustness failures")
            }
        }
    }
}
