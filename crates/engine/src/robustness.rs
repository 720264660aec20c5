//! Robustness stress-testing of a selected candidate
//!
//! The held-out test window is derived once from the validation mode. Cost
//! variants (spread, slippage) re-evaluate the candidate on the same test
//! bars with the execution config overridden; out-of-sample shift variants
//! move the window back in time and re-label its regime.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ExecutionConfig, StressVariants, TimeFilter, ValidationMode};
use crate::error::ExperimentError;
use crate::guardrails::Objective;
use crate::optimizer::{EvaluationRequest, Optimizer};
use crate::regime::RegimeClassifier;
use crate::types::{slice_klines, Kline, Metrics, DAY_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Spread,
    Slippage,
    OosShift,
}

/// Metrics of the candidate under one stress variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub kind: VariantKind,
    /// Spread/slippage value, or shift in days
    pub parameter: Decimal,
    pub metrics: Metrics,
    pub regime: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessReport {
    pub window: TestWindow,
    pub base_regime: String,
    pub variants: Vec<VariantResult>,
    pub worst_case: Option<VariantResult>,
}

impl RobustnessReport {
    pub fn all_passed(&self) -> bool {
        self.variants.iter().all(|v| v.passed)
    }

    pub fn any_failed(&self) -> bool {
        !self.all_passed()
    }
}

/// Everything needed to stress one candidate
pub struct RobustnessInput<'a> {
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub strategy: &'a str,
    pub params: &'a serde_json::Value,
    pub bars: &'a [Kline],
    pub validation: &'a ValidationMode,
    pub time_filter: Option<&'a TimeFilter>,
    pub execution: &'a ExecutionConfig,
    pub stress: &'a StressVariants,
    pub objective: &'a Objective,
}

/// Derive the held-out test window from the full series
pub fn derive_test_window(
    bars: &[Kline],
    validation: &ValidationMode,
) -> Result<TestWindow, ExperimentError> {
    let last = bars
        .last()
        .ok_or_else(|| ExperimentError::EmptyTestWindow("no bars".to_string()))?;
    let end_ms = last.open_time;

    let start_ms = match validation {
        ValidationMode::Split { train_pct } => {
            let n = Decimal::from(bars.len() as u64);
            let index = (n * *train_pct / Decimal::from(100))
                .floor()
                .to_usize()
                .unwrap_or(usize::MAX);
            match bars.get(index) {
                Some(first_test) => first_test.open_time,
                None => {
                    return Err(ExperimentError::EmptyTestWindow(format!(
                        "split at {train_pct}% leaves no test bars"
                    )))
                }
            }
        }
        ValidationMode::LastDays { days } => end_ms - i64::from(*days) * DAY_MS,
        ValidationMode::WalkForward { test_days, .. } => end_ms - i64::from(*test_days) * DAY_MS,
    };

    Ok(TestWindow { start_ms, end_ms })
}

/// Variant with the largest drawdown; the first one wins ties
pub fn worst_case(variants: &[VariantResult]) -> Option<VariantResult> {
    let mut worst: Option<&VariantResult> = None;
    for variant in variants {
        match worst {
            Some(current) if variant.metrics.max_drawdown <= current.metrics.max_drawdown => {}
            _ => worst = Some(variant),
        }
    }
    worst.cloned()
}

/// Run every configured stress variant against the candidate
pub async fn evaluate_robustness(
    optimizer: &dyn Optimizer,
    classifier: &dyn RegimeClassifier,
    input: RobustnessInput<'_>,
) -> Result<RobustnessReport, ExperimentError> {
    let window = derive_test_window(input.bars, input.validation)?;
    let test_bars = slice_klines(input.bars, window.start_ms, window.end_ms);
    if test_bars.is_empty() {
        return Err(ExperimentError::EmptyTestWindow(format!(
            "{}..{}",
            window.start_ms, window.end_ms
        )));
    }
    let base_regime = classifier.classify(&test_bars, Some(input.bars));

    let request = |execution: ExecutionConfig, bars: Vec<Kline>| EvaluationRequest {
        symbol: input.symbol.to_string(),
        timeframe: input.timeframe.to_string(),
        strategy: input.strategy.to_string(),
        params: input.params.clone(),
        execution,
        time_filter: input.time_filter.cloned(),
        bars,
    };

    let mut variants = Vec::new();

    for spread in input.stress.spreads.iter().filter(|v| !v.is_zero()) {
        let execution = ExecutionConfig {
            spread: *spread,
            ..input.execution.clone()
        };
        let metrics = optimizer
            .evaluate(&request(execution, test_bars.clone()))
            .await?;
        variants.push(VariantResult {
            kind: VariantKind::Spread,
            parameter: *spread,
            passed: input.objective.check(&metrics).passed,
            metrics,
            regime: base_regime.clone(),
        });
    }

    for slippage in input.stress.slippages.iter().filter(|v| !v.is_zero()) {
        let execution = ExecutionConfig {
            slippage: *slippage,
            ..input.execution.clone()
        };
        let metrics = optimizer
            .evaluate(&request(execution, test_bars.clone()))
            .await?;
        variants.push(VariantResult {
            kind: VariantKind::Slippage,
            parameter: *slippage,
            passed: input.objective.check(&metrics).passed,
            metrics,
            regime: base_regime.clone(),
        });
    }

    for days in input.stress.oos_shift_days.iter().filter(|d| **d > 0) {
        let shift = i64::from(*days) * DAY_MS;
        let shifted = slice_klines(input.bars, window.start_ms - shift, window.end_ms - shift);
        if shifted.is_empty() {
            debug!(days, "Skipping out-of-sample shift with no bars");
            continue;
        }
        let regime = classifier.classify(&shifted, Some(input.bars));
        let metrics = optimizer
            .evaluate(&request(input.execution.clone(), shifted))
            .await?;
        variants.push(VariantResult {
            kind: VariantKind::OosShift,
            parameter: Decimal::from(*days),
            passed: input.objective.check(&metrics).passed,
            metrics,
            regime,
        });
    }

    let worst_case = worst_case(&variants);
    Ok(RobustnessReport {
        window,
        base_regime,
        variants,
        worst_case,
    })
}
