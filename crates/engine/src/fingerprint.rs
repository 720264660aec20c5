//! Stable hashes for experiment dedup and candidate identity

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{
    ExecutionConfig, NormalizedConfig, ParamGrid, RobustnessLevel, StressVariants, TargetRegime,
    TimeFilter, ValidationMode,
};
use crate::guardrails::Objective;
use crate::regime::RegimeGateThresholds;

/// Everything that determines what an experiment computes (no timing or budget knobs)
#[derive(Serialize)]
struct ExperimentInputs<'a> {
    symbol: &'a str,
    timeframe: &'a str,
    strategy: &'a str,
    grid: &'a ParamGrid,
    objective: &'a Objective,
    execution: &'a ExecutionConfig,
    validation: &'a ValidationMode,
    time_filter: &'a Option<TimeFilter>,
    stress: &'a StressVariants,
    level: RobustnessLevel,
    regime_gate: &'a RegimeGateThresholds,
    target_regime: &'a Option<TargetRegime>,
    lookback_days: u32,
    end_time: Option<i64>,
}

/// Fingerprint of one experiment: the normalized config plus the grid it searches
pub fn experiment_fingerprint(config: &NormalizedConfig, grid: &ParamGrid) -> String {
    let inputs = ExperimentInputs {
        symbol: &config.symbol,
        timeframe: &config.timeframe,
        strategy: &config.strategy,
        grid,
        objective: &config.objective,
        execution: &config.execution,
        validation: &config.validation,
        time_filter: &config.time_filter,
        stress: &config.stress,
        level: config.level,
        regime_gate: &config.regime_gate,
        target_regime: &config.target_regime,
        lookback_days: config.history.lookback_days,
        end_time: config.history.end_time,
    };
    canonical_hash(&inputs)
}

/// Hash of a candidate's parameter object
pub fn params_hash(params: &serde_json::Value) -> String {
    canonical_hash(params)
}

/// SHA-256 over the canonical JSON form (object keys sorted)
fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> String {
    // Round-tripping through Value sorts map keys
    let canonical = serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let hash = Sha256::digest(canonical.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{normalize, ResearchConfig};
    use serde_json::json;

    fn config(grid: ParamGrid) -> NormalizedConfig {
        normalize(&ResearchConfig {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1h".to_string(),
            strategy: "rsi".to_string(),
            grid: Some(grid),
            ..ResearchConfig::default()
        })
        .unwrap()
    }

    fn grid(values: &[i64]) -> ParamGrid {
        let mut grid = ParamGrid::new();
        grid.insert("period".to_string(), values.iter().map(|v| json!(v)).collect());
        grid
    }

    #[test]
    fn test_fingerprint_is_stable_and_grid_sensitive() {
        let a = config(grid(&[10, 14]));
        let b = config(grid(&[10, 14]));
        assert_eq!(
            experiment_fingerprint(&a, &a.grid),
            experiment_fingerprint(&b, &b.grid)
        );
        assert_eq!(experiment_fingerprint(&a, &a.grid).len(), 64);

        let refined = grid(&[12, 13]);
        assert_ne!(
            experiment_fingerprint(&a, &a.grid),
            experiment_fingerprint(&a, &refined)
        );
    }

    #[test]
    fn test_timing_does_not_change_fingerprint() {
        let a = config(grid(&[10]));
        let mut b = a.clone();
        b.timing.poll_interval_ms = 1;
        b.max_experiments = 99;
        assert_eq!(
            experiment_fingerprint(&a, &a.grid),
            experiment_fingerprint(&b, &b.grid)
        );

        b.objective.min_trades = 5;
        assert_ne!(
            experiment_fingerprint(&a, &a.grid),
            experiment_fingerprint(&b, &b.grid)
        );
    }

    #[test]
    fn test_params_hash_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"fast": 5, "slow": 20}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"slow": 20, "fast": 5}"#).unwrap();
        assert_eq!(params_hash(&a), params_hash(&b));
        assert_ne!(params_hash(&a), params_hash(&json!({ "fast": 6, "slow": 20 })));
    }
}
