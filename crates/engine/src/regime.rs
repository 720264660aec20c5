//! Market regimes: classification, coverage summaries and the acceptance gate
//!
//! Every evaluation of a candidate (the base test window plus each robustness
//! variant) is tagged with a regime label and a guardrail pass/fail. The gate
//! decides whether that coverage is broad and healthy enough to adopt.

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use ta::indicators::TrueRange;
use ta::{DataItem, Next};

use crate::config::{RobustnessLevel, TargetRegime};
use crate::types::Kline;

pub const UNKNOWN_REGIME: &str = "unknown";

/// One (regime label, pass/fail) observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeEvaluation {
    pub regime: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeTally {
    pub samples: usize,
    pub passes: usize,
}

impl RegimeTally {
    /// Fewer than half of the samples passed
    pub fn is_brittle(&self) -> bool {
        self.samples > 0 && self.passes * 2 < self.samples
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeCoverageSummary {
    pub regimes_seen: usize,
    pub pass_rate: f64,
    pub brittle: BTreeSet<String>,
    pub per_regime: BTreeMap<String, RegimeTally>,
}

impl RegimeCoverageSummary {
    pub fn from_evaluations(evaluations: &[RegimeEvaluation]) -> Self {
        let mut per_regime: BTreeMap<String, RegimeTally> = BTreeMap::new();
        for eval in evaluations {
            let tally = per_regime.entry(eval.regime.clone()).or_default();
            tally.samples += 1;
            if eval.passed {
                tally.passes += 1;
            }
        }

        let total = evaluations.len();
        let passes = evaluations.iter().filter(|e| e.passed).count();
        let pass_rate = if total > 0 {
            passes as f64 / total as f64
        } else {
            0.0
        };

        let brittle = per_regime
            .iter()
            .filter(|(_, t)| t.is_brittle())
            .map(|(r, _)| r.clone())
            .collect();

        Self {
            regimes_seen: per_regime.len(),
            pass_rate,
            brittle,
            per_regime,
        }
    }
}

// ============================================================================
// Classifier contract
// ============================================================================

/// Labels bar windows with a market regime
pub trait RegimeClassifier: Send + Sync {
    /// Label `bars`, optionally relative to a longer `reference` window
    fn classify(&self, bars: &[Kline], reference: Option<&[Kline]>) -> String;

    fn summarize(&self, evaluations: &[RegimeEvaluation]) -> RegimeCoverageSummary {
        RegimeCoverageSummary::from_evaluations(evaluations)
    }
}

const TREND_EFFICIENCY: f64 = 0.3;
const HIGH_VOL_RELATIVE: f64 = 1.2;
const HIGH_VOL_ABSOLUTE: f64 = 0.01;

/// Trend/volatility classifier: `{trending|ranging}_{high|low}_vol`
#[derive(Debug, Clone, Default)]
pub struct TrendVolatilityClassifier;

impl TrendVolatilityClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Kaufman efficiency ratio over the whole window: net move / path length
    fn efficiency(closes: &[f64]) -> f64 {
        let (Some(first), Some(last)) = (closes.first(), closes.last()) else {
            return 0.0;
        };
        let path: f64 = closes.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        if path <= f64::EPSILON {
            return 0.0;
        }
        (last - first).abs() / path
    }

    /// Mean true range relative to close
    fn relative_volatility(bars: &[Kline]) -> Option<f64> {
        let mut tr = TrueRange::new();
        let mut sum = 0.0;
        let mut count = 0usize;

        for kline in bars {
            let close = kline.close.to_f64().unwrap_or(0.0);
            if close <= 0.0 {
                continue;
            }
            let item = DataItem::builder()
                .open(kline.open.to_f64().unwrap_or(close))
                .high(kline.high.to_f64().unwrap_or(close))
                .low(kline.low.to_f64().unwrap_or(close))
                .close(close)
                .volume(kline.volume.to_f64().unwrap_or(0.0))
                .build();
            if let Ok(item) = item {
                sum += tr.next(&item) / close;
                count += 1;
            }
        }

        (count > 0).then(|| sum / count as f64)
    }
}

impl RegimeClassifier for TrendVolatilityClassifier {
    fn classify(&self, bars: &[Kline], reference: Option<&[Kline]>) -> String {
        if bars.len() < 3 {
            return UNKNOWN_REGIME.to_string();
        }

        let closes: Vec<f64> = bars
            .iter()
            .map(|k| k.close.to_f64().unwrap_or(0.0))
            .collect();
        let trend = if Self::efficiency(&closes) >= TREND_EFFICIENCY {
            "trending"
        } else {
            "ranging"
        };

        let vol = Self::relative_volatility(bars).unwrap_or(0.0);
        let threshold = reference
            .and_then(Self::relative_volatility)
            .map(|r| r * HIGH_VOL_RELATIVE)
            .unwrap_or(HIGH_VOL_ABSOLUTE);
        let volatility = if vol > threshold { "high_vol" } else { "low_vol" };

        format!("{trend}_{volatility}")
    }
}

// ============================================================================
// Gate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeGateThresholds {
    pub min_pass_rate: f64,
    pub critical_regimes: BTreeSet<String>,
    pub min_regimes_seen: usize,
    pub allow_brittle: bool,
}

impl RegimeGateThresholds {
    /// Level defaults; stricter levels want broader, higher-confidence coverage
    pub fn for_level(level: RobustnessLevel) -> Self {
        match level {
            RobustnessLevel::Lite => Self {
                min_pass_rate: 0.5,
                critical_regimes: BTreeSet::new(),
                min_regimes_seen: 1,
                allow_brittle: false,
            },
            RobustnessLevel::Standard => Self {
                min_pass_rate: 0.6,
                critical_regimes: BTreeSet::new(),
                min_regimes_seen: 1,
                allow_brittle: false,
            },
            RobustnessLevel::Strict => Self {
                min_pass_rate: 0.75,
                critical_regimes: ["trending_high_vol", "ranging_high_vol"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                min_regimes_seen: 2,
                allow_brittle: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeGateResult {
    pub passed: bool,
    /// Pass rate fell below threshold; an `adopt` becomes `investigate`
    pub downgraded: bool,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
}

/// Apply the gate. Pure in `(summary, thresholds)`.
pub fn evaluate_gate(
    summary: &RegimeCoverageSummary,
    thresholds: &RegimeGateThresholds,
) -> RegimeGateResult {
    let mut reasons = Vec::new();
    let mut warnings = Vec::new();

    if !thresholds.allow_brittle {
        if summary.regimes_seen == 0 {
            reasons.push("no regimes observed".to_string());
        } else if summary.regimes_seen < thresholds.min_regimes_seen {
            reasons.push(format!(
                "observed {} regime(s), need at least {}",
                summary.regimes_seen, thresholds.min_regimes_seen
            ));
        }

        let critical_brittle: Vec<&String> = summary
            .brittle
            .intersection(&thresholds.critical_regimes)
            .collect();
        if !critical_brittle.is_empty() {
            reasons.push(format!("critical regime(s) brittle: {critical_brittle:?}"));
        }
    }

    let mut downgraded = false;
    if summary.pass_rate < thresholds.min_pass_rate {
        downgraded = true;
        warnings.push(format!(
            "regime pass rate {:.2} below {:.2}",
            summary.pass_rate, thresholds.min_pass_rate
        ));
        if !thresholds.allow_brittle {
            reasons.push(format!(
                "regime pass rate {:.2} below {:.2}",
                summary.pass_rate, thresholds.min_pass_rate
            ));
        }
    }

    RegimeGateResult {
        passed: reasons.is_empty(),
        downgraded,
        reasons,
        warnings,
    }
}

// ============================================================================
// Target regime
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRegimeCheck {
    pub regime: String,
    pub samples: usize,
    pub brittle: bool,
    pub satisfied: bool,
    pub reason: Option<String>,
}

pub fn check_target_regime(
    summary: &RegimeCoverageSummary,
    target: &TargetRegime,
) -> TargetRegimeCheck {
    let tally = summary.per_regime.get(&target.regime).cloned().unwrap_or_default();
    let brittle = tally.is_brittle();

    let reason = if tally.samples < target.min_samples {
        Some(format!(
            "target regime {} observed {} time(s), need {}",
            target.regime, tally.samples, target.min_samples
        ))
    } else if brittle && !target.allow_brittle {
        Some(format!("target regime {} is brittle", target.regime))
    } else {
        None
    };

    TargetRegimeCheck {
        regime: target.regime.clone(),
        samples: tally.samples,
        brittle,
        satisfied: reason.is_none(),
        reason,
    }
}
