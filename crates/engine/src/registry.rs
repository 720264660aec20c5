//! Experiment registry and saved search-space presets, both kept in ledger memory

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::ParamGrid;
use crate::error::{AutopilotError, ValidationError};
use crate::ledger::Ledger;
use crate::session::ExperimentRecord;
use crate::types::Decision;

pub const REGISTRY_NAMESPACE: &str = "experiment_registry";
pub const PRESET_NAMESPACE: &str = "search_space_presets";

/// Compact per-experiment summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub experiment_id: String,
    pub session_id: String,
    pub sequence: u32,
    pub decision: Decision,
    pub score: Decimal,
    pub params_hash: String,
    pub fingerprint: String,
    pub recorded_at: i64,
}

impl From<&ExperimentRecord> for RegistryEntry {
    fn from(record: &ExperimentRecord) -> Self {
        Self {
            experiment_id: record.id.clone(),
            session_id: record.session_id.clone(),
            sequence: record.sequence,
            decision: record.decision,
            score: record.candidate.score,
            params_hash: record.params_hash.clone(),
            fingerprint: record.fingerprint.clone(),
            recorded_at: record.created_at,
        }
    }
}

/// Upsert the registry summary; failures are logged and swallowed
pub async fn record_experiment(ledger: &dyn Ledger, record: &ExperimentRecord) {
    let entry = RegistryEntry::from(record);
    let value = match serde_json::to_value(&entry) {
        Ok(value) => value,
        Err(e) => {
            warn!(experiment_id = %record.id, error = %e, "Failed to encode registry entry");
            return;
        }
    };
    match ledger.put_memory(REGISTRY_NAMESPACE, &record.id, &value).await {
        Ok(()) => debug!(experiment_id = %record.id, "Registry entry written"),
        Err(e) => warn!(experiment_id = %record.id, error = %e, "Registry write failed"),
    }
}

pub async fn registry_entry(
    ledger: &dyn Ledger,
    experiment_id: &str,
) -> Result<Option<RegistryEntry>, AutopilotError> {
    match ledger.get_memory(REGISTRY_NAMESPACE, experiment_id).await? {
        Some(value) => Ok(serde_json::from_value(value).ok()),
        None => Ok(None),
    }
}

// ============================================================================
// Presets
// ============================================================================

fn validate_preset_name(name: &str) -> Result<&str, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::Missing("preset"));
    }
    Ok(name)
}

pub async fn load_preset(ledger: &dyn Ledger, name: &str) -> Result<ParamGrid, AutopilotError> {
    let name = validate_preset_name(name)?;
    let value = ledger
        .get_memory(PRESET_NAMESPACE, name)
        .await?
        .ok_or_else(|| ValidationError::UnknownPreset(name.to_string()))?;
    let grid: ParamGrid = serde_json::from_value(value)
        .map_err(|e| ValidationError::invalid("preset", format!("{name}: {e}")))?;
    Ok(grid)
}

pub async fn save_preset(
    ledger: &dyn Ledger,
    name: &str,
    grid: &ParamGrid,
) -> Result<(), AutopilotError> {
    let name = validate_preset_name(name)?;
    if grid.is_empty() || grid.values().any(|v| v.is_empty()) {
        return Err(ValidationError::invalid("grid", "preset dimensions must be non-empty").into());
    }
    let value = serde_json::to_value(grid).map_err(crate::error::LedgerError::from)?;
    ledger.put_memory(PRESET_NAMESPACE, name, &value).await?;
    Ok(())
}

pub async fn list_presets(ledger: &dyn Ledger) -> Result<BTreeMap<String, ParamGrid>, AutopilotError> {
    Ok(ledger
        .list_memory(PRESET_NAMESPACE)
        .await?
        .into_iter()
        .filter_map(|(name, value)| Some((name, serde_json::from_value(value).ok()?)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use serde_json::json;

    fn grid() -> ParamGrid {
        let mut grid = ParamGrid::new();
        grid.insert("fast".to_string(), vec![json!(5), json!(8)]);
        grid.insert("slow".to_string(), vec![json!(21)]);
        grid
    }

    #[tokio::test]
    async fn test_preset_round_trip_and_listing() {
        let ledger = MemoryLedger::new();
        save_preset(&ledger, "ema-wide", &grid()).await.unwrap();

        assert_eq!(load_preset(&ledger, " ema-wide ").await.unwrap(), grid());
        let presets = list_presets(&ledger).await.unwrap();
        assert_eq!(presets.len(), 1);
        assert!(presets.contains_key("ema-wide"));
    }

    #[tokio::test]
    async fn test_missing_preset_is_validation_failure() {
        let ledger = MemoryLedger::new();
        let err = load_preset(&ledger, "nope").await.unwrap_err();
        assert!(matches!(
            err,
            AutopilotError::Validation(ValidationError::UnknownPreset(ref name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_empty_preset_rejected() {
        let ledger = MemoryLedger::new();
        let err = save_preset(&ledger, "empty", &ParamGrid::new()).await.unwrap_err();
        assert!(matches!(err, AutopilotError::Validation(_)));
    }
}
