//! Research session records, progress steps and experiment audit records

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::champion::Champions;
use crate::config::{NormalizedConfig, ParamGrid};
use crate::guardrails::GuardrailCheck;
use crate::optimizer::Candidate;
use crate::regime::{RegimeCoverageSummary, RegimeGateResult, TargetRegimeCheck};
use crate::robustness::RobustnessReport;
use crate::types::Decision;

pub const MAX_WARNINGS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Failed
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable counters and bests of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStats {
    pub experiments_planned: u32,
    pub experiments_run: u32,
    pub duplicates_skipped: u32,
    pub adopted: u32,
    pub investigated: u32,
    pub rejected: u32,
    pub failed_experiments: u32,
    pub rate_limit_pauses: u32,
    pub best_score: Option<Decimal>,
    pub champions: Champions,
    /// Regime label -> number of evaluations observed in it
    pub regime_histogram: BTreeMap<String, u32>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: String,
    pub status: SessionStatus,
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub config: NormalizedConfig,
    pub stats: SessionStats,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

impl ResearchSession {
    pub fn new(id: String, config: NormalizedConfig, now_ms: i64) -> Self {
        Self {
            id,
            status: SessionStatus::Running,
            symbol: config.symbol.clone(),
            timeframe: config.timeframe.clone(),
            strategy: config.strategy.clone(),
            stats: SessionStats {
                experiments_planned: config.max_experiments,
                ..SessionStats::default()
            },
            config,
            last_error: None,
            stop_reason: None,
            created_at: now_ms,
            updated_at: now_ms,
            finished_at: None,
        }
    }

    /// Append a warning, dropping the oldest past the cap
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.stats.warnings.push(warning.into());
        if self.stats.warnings.len() > MAX_WARNINGS {
            let excess = self.stats.warnings.len() - MAX_WARNINGS;
            self.stats.warnings.drain(..excess);
        }
    }

    pub fn finish(&mut self, status: SessionStatus, reason: impl Into<String>, now_ms: i64) {
        self.status = status;
        self.stop_reason = Some(reason.into());
        self.updated_at = now_ms;
        self.finished_at = Some(now_ms);
    }
}

/// `rs-<epoch ms>-<6 hex>`
pub fn new_session_id(now_ms: i64) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("rs-{now_ms}-{suffix:06x}")
}

pub fn experiment_id(session_id: &str, sequence: u32) -> String {
    format!("{session_id}-e{sequence}")
}

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Started,
    HistoryFetched,
    RoundCompleted,
    ExperimentCompleted,
    DuplicateSkipped,
    ExperimentFailed,
    RateLimitPause,
    Resumed,
    StopRequested,
    Finished,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Started => "started",
            StepKind::HistoryFetched => "history_fetched",
            StepKind::RoundCompleted => "round_completed",
            StepKind::ExperimentCompleted => "experiment_completed",
            StepKind::DuplicateSkipped => "duplicate_skipped",
            StepKind::ExperimentFailed => "experiment_failed",
            StepKind::RateLimitPause => "rate_limit_pause",
            StepKind::Resumed => "resumed",
            StepKind::StopRequested => "stop_requested",
            StepKind::Finished => "finished",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStep {
    pub session_id: String,
    pub seq: u64,
    pub kind: StepKind,
    pub message: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

// ============================================================================
// Experiments
// ============================================================================

/// Audit record of one experiment; immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: String,
    pub session_id: String,
    pub sequence: u32,
    pub fingerprint: String,
    /// Grid searched in round 1
    pub grid: ParamGrid,
    /// Grid searched in round 2
    pub refined_grid: Option<ParamGrid>,
    pub decision: Decision,
    pub candidate: Candidate,
    pub params_hash: String,
    pub guardrails: GuardrailCheck,
    pub robustness: RobustnessReport,
    pub regime_summary: RegimeCoverageSummary,
    pub regime_gate: RegimeGateResult,
    pub target_regime: Option<TargetRegimeCheck>,
    pub created_at: i64,
}
