//! Shared types for the research pipeline

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const MINUTE_MS: i64 = 60_000;
pub const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Test-window metrics reported by the optimizer for one parameter set.
///
/// `max_drawdown` is a fraction of equity (0.05 = 5%), `win_rate` a percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub total_trades: u32,
    pub net_pnl: Decimal,
    pub win_rate: Decimal,
    pub profit_factor: Decimal,
    pub sharpe_ratio: Decimal,
    pub max_drawdown: Decimal,
}

/// Outcome of one research experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Adopt,
    Investigate,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Adopt => "adopt",
            Decision::Investigate => "investigate",
            Decision::Reject => "reject",
        }
    }

    /// One notch down: adopt becomes investigate, the rest are unchanged
    pub fn downgraded(self) -> Self {
        match self {
            Decision::Adopt => Decision::Investigate,
            other => other,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Timeframes
// ============================================================================

const SUPPORTED_TIMEFRAMES: &[(&str, i64)] = &[
    ("1m", MINUTE_MS),
    ("5m", 5 * MINUTE_MS),
    ("15m", 15 * MINUTE_MS),
    ("30m", 30 * MINUTE_MS),
    ("1h", 60 * MINUTE_MS),
    ("4h", 240 * MINUTE_MS),
    ("1d", DAY_MS),
];

/// Normalize a resolution string to the canonical `<n><unit>` form.
///
/// Accepts `15m`, `M15`, `H1`, `d1` and bare minute counts (`15`, `60`).
pub fn normalize_resolution(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }

    let candidate = if SUPPORTED_TIMEFRAMES.iter().any(|(tf, _)| *tf == lowered) {
        lowered
    } else if lowered.chars().all(|c| c.is_ascii_digit()) {
        match lowered.as_str() {
            "60" => "1h".to_string(),
            "240" => "4h".to_string(),
            "1440" => "1d".to_string(),
            minutes => format!("{minutes}m"),
        }
    } else {
        let mut chars = lowered.chars();
        let unit = chars.next().unwrap_or_default();
        let count = chars.as_str();
        if matches!(unit, 'm' | 'h' | 'd') && !count.is_empty() && count.chars().all(|c| c.is_ascii_digit()) {
            format!("{count}{unit}")
        } else {
            return None;
        }
    };

    timeframe_ms(&candidate).map(|_| candidate)
}

/// Bar duration in milliseconds for a canonical timeframe
pub fn timeframe_ms(timeframe: &str) -> Option<i64> {
    SUPPORTED_TIMEFRAMES
        .iter()
        .find(|(tf, _)| *tf == timeframe)
        .map(|(_, ms)| *ms)
}

/// Slice bars whose open time falls within `[start_ms, end_ms]`
pub fn slice_klines(klines: &[Kline], start_ms: i64, end_ms: i64) -> Vec<Kline> {
    klines
        .iter()
        .filter(|k| k.open_time >= start_ms && k.open_time <= end_ms)
        .cloned()
        .collect()
}
