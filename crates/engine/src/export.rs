//! Session export and the performance-dashboard series

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::champion::clears_margin;
use crate::session::{ExperimentRecord, ResearchSession, SessionStep};
use crate::types::Decision;

/// One dashboard point per experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardPoint {
    pub sequence: u32,
    pub experiment_id: String,
    pub timestamp: i64,
    pub decision: Decision,
    pub score: Decimal,
    /// Best non-rejected score so far, after hysteresis
    pub best_score: Option<Decimal>,
    pub max_drawdown: Decimal,
    pub worst_case_drawdown: Option<Decimal>,
    pub regime_pass_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: ResearchSession,
    pub steps: Vec<SessionStep>,
    pub experiments: Vec<ExperimentRecord>,
    pub dashboard: Vec<DashboardPoint>,
    pub exported_at: i64,
}

/// Per-experiment dashboard points. `best_score` follows the same `min_delta`
/// hysteresis as the session champion, so it agrees with `stats.best_score`.
pub fn dashboard_series(experiments: &[ExperimentRecord], min_delta: Decimal) -> Vec<DashboardPoint> {
    let mut ordered: Vec<&ExperimentRecord> = experiments.iter().collect();
    ordered.sort_by_key(|e| e.sequence);

    let mut best: Option<Decimal> = None;
    ordered
        .into_iter()
        .map(|record| {
            let score = record.candidate.score;
            if record.decision != Decision::Reject && clears_margin(score, best, min_delta) {
                best = Some(score);
            }
            DashboardPoint {
                sequence: record.sequence,
                experiment_id: record.id.clone(),
                timestamp: record.created_at,
                decision: record.decision,
                score,
                best_score: best,
                max_drawdown: record.candidate.metrics.max_drawdown,
                worst_case_drawdown: record
                    .robustness
                    .worst_case
                    .as_ref()
                    .map(|w| w.metrics.max_drawdown),
                regime_pass_rate: record.regime_summary.pass_rate,
            }
        })
        .collect()
}
