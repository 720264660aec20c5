//! Champion bookkeeping: best known candidate globally and per regime

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::robustness::VariantResult;
use crate::types::{Decision, Metrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionRecord {
    pub experiment_id: String,
    pub params_hash: String,
    pub params: serde_json::Value,
    pub score: Decimal,
    pub decision: Decision,
    pub metrics: Metrics,
    pub worst_case: Option<VariantResult>,
    #[serde(default)]
    pub penalties: BTreeMap<String, Decimal>,
    pub updated_at: i64,
}

/// Global and per-regime champions under a hysteresis rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Champions {
    pub global: Option<ChampionRecord>,
    pub by_regime: BTreeMap<String, ChampionRecord>,
}

/// Whether `score` clears the stored champion by more than `min_delta`.
/// An empty slot always accepts.
pub fn beats(score: Decimal, stored: Option<&ChampionRecord>, min_delta: Decimal) -> bool {
    clears_margin(score, stored.map(|current| current.score), min_delta)
}

/// Score-only form of [`beats`], for series that track a bare best score
pub fn clears_margin(score: Decimal, best: Option<Decimal>, min_delta: Decimal) -> bool {
    best.map_or(true, |best| score > best + min_delta)
}

impl Champions {
    /// Offer a candidate for the global slot; returns true when it was installed
    pub fn offer_global(&mut self, candidate: &ChampionRecord, min_delta: Decimal) -> bool {
        if !beats(candidate.score, self.global.as_ref(), min_delta) {
            return false;
        }
        self.global = Some(candidate.clone());
        true
    }

    pub fn offer_regime(
        &mut self,
        regime: &str,
        candidate: &ChampionRecord,
        min_delta: Decimal,
    ) -> bool {
        if !beats(candidate.score, self.by_regime.get(regime), min_delta) {
            return false;
        }
        self.by_regime.insert(regime.to_string(), candidate.clone());
        true
    }

    pub fn best_score(&self) -> Option<Decimal> {
        self.global.as_ref().map(|c| c.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(id: &str, score: Decimal) -> ChampionRecord {
        ChampionRecord {
            experiment_id: id.to_string(),
            params_hash: format!("hash-{id}"),
            params: serde_json::json!({ "period": 14 }),
            score,
            decision: Decision::Adopt,
            metrics: Metrics::default(),
            worst_case: None,
            penalties: BTreeMap::new(),
            updated_at: 0,
        }
    }

    #[test]
    fn test_empty_slot_accepts_anything() {
        let mut champions = Champions::default();
        assert!(champions.offer_global(&record("e1", dec!(-5)), dec!(0.05)));
        assert_eq!(champions.best_score(), Some(dec!(-5)));
    }

    #[test]
    fn test_hysteresis_requires_strict_margin() {
        let mut champions = Champions::default();
        champions.offer_global(&record("e1", dec!(1.00)), dec!(0.05));

        // exactly at the delta is not enough
        assert!(!champions.offer_global(&record("e2", dec!(1.05)), dec!(0.05)));
        assert!(!champions.offer_global(&record("e3", dec!(1.02)), dec!(0.05)));
        assert_eq!(champions.global.as_ref().unwrap().experiment_id, "e1");

        assert!(champions.offer_global(&record("e4", dec!(1.06)), dec!(0.05)));
        assert_eq!(champions.global.as_ref().unwrap().experiment_id, "e4");
    }

    #[test]
    fn test_regime_slots_are_independent() {
        let mut champions = Champions::default();
        let low = record("e1", dec!(1.0));
        assert!(champions.offer_regime("trending_low_vol", &low, dec!(0.02)));
        assert!(champions.offer_regime("ranging_high_vol", &low, dec!(0.02)));
        assert!(!champions.offer_regime("trending_low_vol", &record("e2", dec!(1.01)), dec!(0.02)));
        assert!(champions.global.is_none());
        assert_eq!(champions.by_regime.len(), 2);
    }
}
