//! Optimizer collaborator contract
//!
//! The optimizer owns grid search and train/test metric computation. This
//! crate only starts runs, polls them, reads their results, asks for refined
//! search spaces and re-evaluates fixed parameter sets.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ExecutionConfig, ParamGrid, Timing, TimeFilter, ValidationMode};
use crate::error::{CollaboratorError, ExperimentError};
use crate::guardrails::Objective;
use crate::types::{Kline, Metrics};

// ============================================================================
// Types
// ============================================================================

/// One scored parameter set proposed by the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub params: serde_json::Value,
    /// Test-window metrics
    pub metrics: Metrics,
    #[serde(default)]
    pub train_metrics: Option<Metrics>,
    pub score: Decimal,
    #[serde(default)]
    pub penalties: BTreeMap<String, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerRunRequest {
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub grid: ParamGrid,
    pub objective: Objective,
    pub execution: ExecutionConfig,
    pub validation: ValidationMode,
    pub time_filter: Option<TimeFilter>,
    pub bars: Vec<Kline>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerResults {
    pub evaluated: u64,
    pub total_combos: u64,
    pub pareto: Vec<Candidate>,
    pub recommended: Option<Candidate>,
    pub ranked: Vec<Candidate>,
    /// Free-form diagnostics passed back to `refine`
    pub diagnostics: serde_json::Value,
}

impl OptimizerResults {
    /// The recommended candidate, else the top-ranked one
    pub fn select_candidate(&self) -> Option<&Candidate> {
        self.recommended.as_ref().or_else(|| self.ranked.first())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRequest {
    pub strategy: String,
    pub grid: ParamGrid,
    pub results: OptimizerResults,
}

/// Evaluate one fixed parameter set against a bar slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub params: serde_json::Value,
    pub execution: ExecutionConfig,
    pub time_filter: Option<TimeFilter>,
    pub bars: Vec<Kline>,
}

// ============================================================================
// Contract
// ============================================================================

#[async_trait]
pub trait Optimizer: Send + Sync {
    /// Start a search run; returns the optimizer's run id
    async fn start(&self, request: &OptimizerRunRequest) -> Result<String, CollaboratorError>;

    async fn status(&self, run_id: &str) -> Result<RunStatus, CollaboratorError>;

    async fn results(&self, run_id: &str) -> Result<OptimizerResults, CollaboratorError>;

    /// Propose a narrower grid from a run's diagnostics, if any
    async fn refine(
        &self,
        request: &RefinementRequest,
    ) -> Result<Option<ParamGrid>, CollaboratorError>;

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Metrics, CollaboratorError>;
}

/// Run one optimizer round to completion: start, poll at the configured
/// interval until terminal or timed out, then read results.
pub async fn run_round(
    optimizer: &dyn Optimizer,
    request: &OptimizerRunRequest,
    round: u8,
    timing: &Timing,
) -> Result<OptimizerResults, ExperimentError> {
    let run_id = optimizer.start(request).await?;
    let started = Instant::now();
    info!(round, run_id = %run_id, combos = grid_size(&request.grid), "Optimizer round started");

    loop {
        let status = optimizer.status(&run_id).await?;
        debug!(round, run_id = %run_id, state = ?status.state, progress = status.progress, "Round status");

        match status.state {
            RunState::Completed => break,
            RunState::Failed | RunState::Cancelled => {
                return Err(ExperimentError::RoundFailed {
                    round,
                    reason: status
                        .error
                        .unwrap_or_else(|| format!("run ended {:?}", status.state)),
                });
            }
            RunState::Queued | RunState::Running => {}
        }

        if started.elapsed() >= timing.round_timeout() {
            return Err(ExperimentError::RoundTimeout {
                round,
                secs: timing.round_timeout().as_secs(),
            });
        }
        tokio::time::sleep(timing.poll_interval()).await;
    }

    let results = optimizer.results(&run_id).await?;
    info!(
        round,
        run_id = %run_id,
        evaluated = results.evaluated,
        ranked = results.ranked.len(),
        "Optimizer round completed"
    );
    Ok(results)
}

/// Number of combinations in a grid
pub fn grid_size(grid: &ParamGrid) -> usize {
    grid.values().map(|v| v.len().max(1)).product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{candidate, ScriptedOptimizer};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn run_request() -> OptimizerRunRequest {
        let mut grid = ParamGrid::new();
        grid.insert("period".to_string(), vec![json!(10), json!(14), json!(21)]);
        grid.insert("band".to_string(), vec![json!(2.0), json!(2.5)]);
        OptimizerRunRequest {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1h".to_string(),
            strategy: "rsi".to_string(),
            grid,
            objective: Objective::default(),
            execution: ExecutionConfig::default(),
            validation: ValidationMode::default(),
            time_filter: None,
            bars: vec![],
        }
    }

    fn fast_timing(timeout_ms: u64) -> Timing {
        Timing {
            poll_interval_ms: 5,
            round_timeout_ms: timeout_ms,
            ..Timing::default()
        }
    }

    #[test]
    fn test_select_candidate_prefers_recommended() {
        let mut results = OptimizerResults {
            ranked: vec![candidate(dec!(1.0), dec!(0.05)), candidate(dec!(0.5), dec!(0.05))],
            ..OptimizerResults::default()
        };
        assert_eq!(results.select_candidate().unwrap().score, dec!(1.0));

        results.recommended = Some(candidate(dec!(0.7), dec!(0.02)));
        assert_eq!(results.select_candidate().unwrap().score, dec!(0.7));

        assert!(OptimizerResults::default().select_candidate().is_none());
    }

    #[test]
    fn test_grid_size() {
        assert_eq!(grid_size(&run_request().grid), 6);
    }

    #[tokio::test]
    async fn test_round_polls_until_complete() {
        let optimizer = ScriptedOptimizer::new(candidate(dec!(1.2), dec!(0.05))).with_polls_before_done(3);
        let results = run_round(&optimizer, &run_request(), 1, &fast_timing(5_000))
            .await
            .unwrap();
        assert_eq!(results.select_candidate().unwrap().score, dec!(1.2));
        assert_eq!(optimizer.status_calls(), 4);
    }

    #[tokio::test]
    async fn test_round_failure_and_timeout() {
        let failing = ScriptedOptimizer::new(candidate(dec!(1.0), dec!(0.05))).with_round_state(RunState::Failed);
        let err = run_round(&failing, &run_request(), 2, &fast_timing(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::RoundFailed { round: 2, .. }));

        let stuck = ScriptedOptimizer::new(candidate(dec!(1.0), dec!(0.05))).with_round_state(RunState::Running);
        let err = run_round(&stuck, &run_request(), 1, &fast_timing(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::RoundTimeout { round: 1, .. }));
    }
}
