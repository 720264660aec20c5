//! Research session configuration and its normalization
//!
//! `ResearchConfig` is what callers submit (every field optional on the wire);
//! `normalize` validates it and resolves defaults with the precedence
//! explicit value > robustness-level default > global default.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::ValidationError;
use crate::guardrails::Objective;
use crate::policy::StopPolicy;
use crate::regime::RegimeGateThresholds;
use crate::types::normalize_resolution;

/// Dimension name -> candidate values
pub type ParamGrid = BTreeMap<String, Vec<serde_json::Value>>;

pub const MAX_EXPERIMENTS_LIMIT: u32 = 500;
const DEFAULT_MAX_EXPERIMENTS: u32 = 10;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustnessLevel {
    Lite,
    Standard,
    Strict,
}

impl std::fmt::Display for RobustnessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RobustnessLevel::Lite => write!(f, "lite"),
            RobustnessLevel::Standard => write!(f, "standard"),
            RobustnessLevel::Strict => write!(f, "strict"),
        }
    }
}

/// How the held-out test window is carved from the history window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ValidationMode {
    /// Train on the first `train_pct` percent of bars, test on the rest
    Split { train_pct: Decimal },
    /// Test on the trailing `days`
    LastDays { days: u32 },
    /// Test on the final `test_days` window after `train_days` of training
    WalkForward { train_days: u32, test_days: u32 },
}

impl Default for ValidationMode {
    fn default() -> Self {
        ValidationMode::Split {
            train_pct: dec!(70),
        }
    }
}

/// Execution costs applied by the optimizer when evaluating
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub spread: Decimal,
    pub slippage: Decimal,
    pub commission: Decimal,
}

/// Trading-hours filter (UTC hours, `end_hour` exclusive)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeFilter {
    pub start_hour: u8,
    pub end_hour: u8,
}

/// Stress variants to run against every candidate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressPlan {
    pub level: Option<RobustnessLevel>,
    pub spreads: Vec<Decimal>,
    pub slippages: Vec<Decimal>,
    pub oos_shift_days: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeGateOverrides {
    pub min_pass_rate: Option<f64>,
    pub critical_regimes: Option<BTreeSet<String>>,
    pub min_regimes_seen: Option<usize>,
    pub allow_brittle: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopOverrides {
    pub min_delta: Option<Decimal>,
    pub plateau_limit: Option<u32>,
    pub max_robustness_failures: Option<u32>,
    pub max_rate_limit_pauses: Option<u32>,
}

/// A regime the candidate must demonstrably handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRegime {
    pub regime: String,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default)]
    pub allow_brittle: bool,
}

fn default_min_samples() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryWindow {
    pub lookback_days: u32,
    /// Epoch ms; `None` means "now" at fetch time
    pub end_time: Option<i64>,
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            end_time: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOverrides {
    pub poll_interval_ms: Option<u64>,
    pub round_timeout_ms: Option<u64>,
    pub rate_limit_backoff_ms: Option<u64>,
    pub max_runtime_ms: Option<u64>,
}

/// Session configuration as submitted by callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub grid: Option<ParamGrid>,
    /// Saved search-space preset to use when `grid` is absent
    pub preset: Option<String>,
    pub objective: Objective,
    pub execution: ExecutionConfig,
    pub validation: ValidationMode,
    pub time_filter: Option<TimeFilter>,
    pub stress: StressPlan,
    pub regime_gate: RegimeGateOverrides,
    pub target_regime: Option<TargetRegime>,
    pub stop: StopOverrides,
    pub history: HistoryWindow,
    pub timing: TimingOverrides,
    pub max_experiments: Option<u32>,
}

// ============================================================================
// Normalized form
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub poll_interval_ms: u64,
    pub round_timeout_ms: u64,
    pub rate_limit_backoff_ms: u64,
    pub max_runtime_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            round_timeout_ms: 15 * 60 * 1_000,
            rate_limit_backoff_ms: 60_000,
            max_runtime_ms: 120 * 60 * 1_000,
        }
    }
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_millis(self.max_runtime_ms)
    }
}

/// Stress variants with the level resolved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StressVariants {
    pub spreads: Vec<Decimal>,
    pub slippages: Vec<Decimal>,
    pub oos_shift_days: Vec<u32>,
}

/// Fully-resolved configuration a session runs with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedConfig {
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub grid: ParamGrid,
    pub preset: Option<String>,
    pub objective: Objective,
    pub execution: ExecutionConfig,
    pub validation: ValidationMode,
    pub time_filter: Option<TimeFilter>,
    pub stress: StressVariants,
    pub level: RobustnessLevel,
    pub regime_gate: RegimeGateThresholds,
    pub target_regime: Option<TargetRegime>,
    pub stop: StopPolicy,
    pub history: HistoryWindow,
    pub timing: Timing,
    pub max_experiments: u32,
}

/// Validate `config` and resolve every default.
///
/// The grid must already be resolved (presets are loaded by the caller).
pub fn normalize(config: &ResearchConfig) -> Result<NormalizedConfig, ValidationError> {
    let symbol = config.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(ValidationError::Missing("symbol"));
    }
    let strategy = config.strategy.trim().to_string();
    if strategy.is_empty() {
        return Err(ValidationError::Missing("strategy"));
    }
    if config.timeframe.trim().is_empty() {
        return Err(ValidationError::Missing("timeframe"));
    }
    let timeframe = normalize_resolution(&config.timeframe).ok_or_else(|| {
        ValidationError::invalid(
            "timeframe",
            format!("unsupported resolution {:?}", config.timeframe),
        )
    })?;

    let grid = validate_grid(config.grid.as_ref())?;

    let max_experiments = config.max_experiments.unwrap_or(DEFAULT_MAX_EXPERIMENTS);
    if !(1..=MAX_EXPERIMENTS_LIMIT).contains(&max_experiments) {
        return Err(ValidationError::invalid(
            "max_experiments",
            format!("{max_experiments} not in 1..={MAX_EXPERIMENTS_LIMIT}"),
        ));
    }

    validate_validation_mode(&config.validation)?;
    validate_stress(config)?;

    if let Some(filter) = &config.time_filter {
        if filter.start_hour > 23 || filter.end_hour > 24 {
            return Err(ValidationError::invalid(
                "time_filter",
                "hours must be within 0..24",
            ));
        }
    }
    if config.history.lookback_days == 0 {
        return Err(ValidationError::invalid("history.lookback_days", "must be positive"));
    }

    let level = config
        .stress
        .level
        .unwrap_or_else(|| infer_level(&config.stress, &config.execution));

    let regime_gate = resolve_gate(level, &config.regime_gate)?;
    let stop = resolve_stop(level, &config.stop);

    let defaults = Timing::default();
    let timing = Timing {
        poll_interval_ms: config
            .timing
            .poll_interval_ms
            .unwrap_or(defaults.poll_interval_ms),
        round_timeout_ms: config
            .timing
            .round_timeout_ms
            .unwrap_or(defaults.round_timeout_ms),
        rate_limit_backoff_ms: config
            .timing
            .rate_limit_backoff_ms
            .unwrap_or(defaults.rate_limit_backoff_ms),
        max_runtime_ms: config
            .timing
            .max_runtime_ms
            .unwrap_or(defaults.max_runtime_ms),
    };

    Ok(NormalizedConfig {
        symbol,
        timeframe,
        strategy,
        grid,
        preset: config.preset.clone(),
        objective: config.objective.clone(),
        execution: config.execution.clone(),
        validation: config.validation.clone(),
        time_filter: config.time_filter.clone(),
        stress: StressVariants {
            spreads: config.stress.spreads.clone(),
            slippages: config.stress.slippages.clone(),
            oos_shift_days: config.stress.oos_shift_days.clone(),
        },
        level,
        regime_gate,
        target_regime: config.target_regime.clone(),
        stop,
        history: config.history.clone(),
        timing,
        max_experiments,
    })
}

/// Infer a robustness level from how hard the configured stress variants push
pub fn infer_level(stress: &StressPlan, execution: &ExecutionConfig) -> RobustnessLevel {
    let factor = |variant: Decimal, base: Decimal| {
        if base > Decimal::ZERO {
            variant / base
        } else {
            variant
        }
    };

    let max_factor = stress
        .spreads
        .iter()
        .map(|s| factor(*s, execution.spread))
        .chain(stress.slippages.iter().map(|s| factor(*s, execution.slippage)))
        .max()
        .unwrap_or(Decimal::ZERO);
    let max_shift = stress.oos_shift_days.iter().copied().max().unwrap_or(0);

    if max_factor >= dec!(3) || max_shift >= 60 {
        RobustnessLevel::Strict
    } else if max_factor >= dec!(1.5) || max_shift >= 14 {
        RobustnessLevel::Standard
    } else {
        RobustnessLevel::Lite
    }
}

fn validate_grid(grid: Option<&ParamGrid>) -> Result<ParamGrid, ValidationError> {
    let grid = grid.ok_or(ValidationError::Missing("grid"))?;
    if grid.is_empty() {
        return Err(ValidationError::invalid("grid", "no dimensions"));
    }
    if let Some((name, _)) = grid.iter().find(|(_, values)| values.is_empty()) {
        return Err(ValidationError::invalid(
            "grid",
            format!("dimension {name:?} has no values"),
        ));
    }
    Ok(grid.clone())
}

fn validate_validation_mode(mode: &ValidationMode) -> Result<(), ValidationError> {
    match mode {
        ValidationMode::Split { train_pct } => {
            if *train_pct <= Decimal::ZERO || *train_pct >= dec!(100) {
                return Err(ValidationError::invalid(
                    "validation.train_pct",
                    format!("{train_pct} not in (0, 100)"),
                ));
            }
        }
        ValidationMode::LastDays { days } => {
            if *days == 0 {
                return Err(ValidationError::invalid("validation.days", "must be positive"));
            }
        }
        ValidationMode::WalkForward {
            train_days,
            test_days,
        } => {
            if *train_days == 0 || *test_days == 0 {
                return Err(ValidationError::invalid(
                    "validation",
                    "walk-forward windows must be positive",
                ));
            }
        }
    }
    Ok(())
}

fn validate_stress(config: &ResearchConfig) -> Result<(), ValidationError> {
    let stress = &config.stress;
    if stress
        .spreads
        .iter()
        .chain(stress.slippages.iter())
        .any(|v| *v < Decimal::ZERO)
    {
        return Err(ValidationError::invalid(
            "stress",
            "spread and slippage variants must be non-negative",
        ));
    }
    let execution = &config.execution;
    if [execution.spread, execution.slippage, execution.commission]
        .iter()
        .any(|v| *v < Decimal::ZERO)
    {
        return Err(ValidationError::invalid("execution", "costs must be non-negative"));
    }
    Ok(())
}

fn resolve_gate(
    level: RobustnessLevel,
    overrides: &RegimeGateOverrides,
) -> Result<RegimeGateThresholds, ValidationError> {
    let mut gate = RegimeGateThresholds::for_level(level);
    if let Some(rate) = overrides.min_pass_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ValidationError::invalid(
                "regime_gate.min_pass_rate",
                format!("{rate} not in [0, 1]"),
            ));
        }
        gate.min_pass_rate = rate;
    }
    if let Some(critical) = &overrides.critical_regimes {
        gate.critical_regimes = critical.clone();
    }
    if let Some(min_seen) = overrides.min_regimes_seen {
        gate.min_regimes_seen = min_seen;
    }
    if let Some(allow) = overrides.allow_brittle {
        gate.allow_brittle = allow;
    }
    Ok(gate)
}

fn resolve_stop(level: RobustnessLevel, overrides: &StopOverrides) -> StopPolicy {
    let defaults = StopPolicy::for_level(level);
    StopPolicy {
        min_delta: overrides.min_delta.unwrap_or(defaults.min_delta),
        plateau_limit: overrides.plateau_limit.unwrap_or(defaults.plateau_limit),
        max_robustness_failures: overrides
            .max_robustness_failures
            .unwrap_or(defaults.max_robustness_failures),
        max_rate_limit_pauses: overrides
            .max_rate_limit_pauses
            .unwrap_or(defaults.max_rate_limit_pauses),
    }
}
