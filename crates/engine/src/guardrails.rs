//! Guardrails: hard pass/fail checks of metrics against objective minimums

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::Metrics;

/// Minimum acceptable objective metrics for a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Objective {
    pub min_trades: u32,
    /// Maximum drawdown as a fraction of equity
    pub max_drawdown: Decimal,
    pub min_profit_factor: Option<Decimal>,
    /// Minimum win rate in percent
    pub min_win_rate: Option<Decimal>,
    pub min_sharpe: Option<Decimal>,
}

impl Default for Objective {
    fn default() -> Self {
        Self {
            min_trades: 20,
            max_drawdown: dec!(0.25),
            min_profit_factor: None,
            min_win_rate: None,
            min_sharpe: None,
        }
    }
}

/// Result of checking one metrics block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailCheck {
    pub passed: bool,
    pub failures: Vec<String>,
}

impl Objective {
    pub fn check(&self, metrics: &Metrics) -> GuardrailCheck {
        let mut failures = Vec::new();

        if metrics.total_trades < self.min_trades {
            failures.push(format!(
                "trades {} < min {}",
                metrics.total_trades, self.min_trades
            ));
        }
        if metrics.max_drawdown > self.max_drawdown {
            failures.push(format!(
                "drawdown {} > max {}",
                metrics.max_drawdown, self.max_drawdown
            ));
        }
        if let Some(min_pf) = self.min_profit_factor {
            if metrics.profit_factor < min_pf {
                failures.push(format!(
                    "profit factor {} < min {}",
                    metrics.profit_factor, min_pf
                ));
            }
        }
        if let Some(min_wr) = self.min_win_rate {
            if metrics.win_rate < min_wr {
                failures.push(format!("win rate {} < min {}", metrics.win_rate, min_wr));
            }
        }
        if let Some(min_sharpe) = self.min_sharpe {
            if metrics.sharpe_ratio < min_sharpe {
                failures.push(format!(
                    "sharpe {} < min {}",
                    metrics.sharpe_ratio, min_sharpe
                ));
            }
        }

        GuardrailCheck {
            passed: failures.is_empty(),
            failures,
        }
    }
}
