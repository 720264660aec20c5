//! Persistence ledger: sessions, steps, experiment audit notes and memory
//!
//! Callers in the run loop treat every ledger call as best-effort: failures
//! are logged and swallowed, never allowed to abort a session.

use async_trait::async_trait;
use chrono::Utc;
use persistence::repository::{
    ExperimentNoteRecord, ExperimentRepository, MemoryEntryRecord, MemoryRepository,
    SessionRecord, SessionRepository, StepRecord, StepRepository,
};
use persistence::SqlitePool;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::LedgerError;
use crate::session::{ExperimentRecord, ResearchSession, SessionStep, StepKind};

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn save_session(&self, session: &ResearchSession) -> Result<(), LedgerError>;
    async fn get_session(&self, id: &str) -> Result<Option<ResearchSession>, LedgerError>;
    async fn list_sessions(&self, limit: i64) -> Result<Vec<ResearchSession>, LedgerError>;

    async fn append_step(&self, step: &SessionStep) -> Result<(), LedgerError>;
    async fn list_steps(&self, session_id: &str) -> Result<Vec<SessionStep>, LedgerError>;

    /// Write an audit record; an existing record with the same id is kept
    async fn save_experiment(&self, record: &ExperimentRecord) -> Result<(), LedgerError>;
    async fn get_experiment(&self, id: &str) -> Result<Option<ExperimentRecord>, LedgerError>;
    async fn list_experiments(&self, session_id: &str)
        -> Result<Vec<ExperimentRecord>, LedgerError>;

    async fn put_memory(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), LedgerError>;
    async fn get_memory(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, LedgerError>;
    /// All entries of a namespace, ordered by key
    async fn list_memory(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, LedgerError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, ResearchSession>,
    steps: HashMap<String, Vec<SessionStep>>,
    experiments: Vec<ExperimentRecord>,
    memory: HashMap<(String, String), serde_json::Value>,
}

/// Process-local ledger for tests and DB-less runs
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn save_session(&self, session: &ResearchSession) -> Result<(), LedgerError> {
        self.state()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ResearchSession>, LedgerError> {
        Ok(self.state().sessions.get(id).cloned())
    }

    async fn list_sessions(&self, limit: i64) -> Result<Vec<ResearchSession>, LedgerError> {
        let mut sessions: Vec<ResearchSession> = self.state().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions.truncate(limit.max(0) as usize);
        Ok(sessions)
    }

    async fn append_step(&self, step: &SessionStep) -> Result<(), LedgerError> {
        let mut state = self.state();
        let steps = state.steps.entry(step.session_id.clone()).or_default();
        if !steps.iter().any(|s| s.seq == step.seq) {
            steps.push(step.clone());
        }
        Ok(())
    }

    async fn list_steps(&self, session_id: &str) -> Result<Vec<SessionStep>, LedgerError> {
        let mut steps = self
            .state()
            .steps
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| s.seq);
        Ok(steps)
    }

    async fn save_experiment(&self, record: &ExperimentRecord) -> Result<(), LedgerError> {
        let mut state = self.state();
        if !state.experiments.iter().any(|e| e.id == record.id) {
            state.experiments.push(record.clone());
        }
        Ok(())
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<ExperimentRecord>, LedgerError> {
        Ok(self.state().experiments.iter().find(|e| e.id == id).cloned())
    }

    async fn list_experiments(
        &self,
        session_id: &str,
    ) -> Result<Vec<ExperimentRecord>, LedgerError> {
        let mut records: Vec<ExperimentRecord> = self
            .state()
            .experiments
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        records.sort_by_key(|e| e.sequence);
        Ok(records)
    }

    async fn put_memory(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), LedgerError> {
        self.state()
            .memory
            .insert((namespace.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    async fn get_memory(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, LedgerError> {
        Ok(self
            .state()
            .memory
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn list_memory(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, LedgerError> {
        let mut entries: Vec<(String, serde_json::Value)> = self
            .state()
            .memory
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Ledger over the persistence crate's repositories
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn session_to_record(session: &ResearchSession) -> Result<SessionRecord, LedgerError> {
    Ok(SessionRecord {
        id: session.id.clone(),
        status: session.status.as_str().to_string(),
        symbol: session.symbol.clone(),
        timeframe: session.timeframe.clone(),
        strategy: session.strategy.clone(),
        record_json: serde_json::to_string(session)?,
        created_at: session.created_at,
        updated_at: session.updated_at,
        finished_at: session.finished_at,
        last_error: session.last_error.clone(),
    })
}

fn step_from_record(record: StepRecord) -> Result<SessionStep, LedgerError> {
    let kind = StepKind::parse(&record.kind)
        .ok_or_else(|| LedgerError::Unavailable(format!("unknown step kind {}", record.kind)))?;
    Ok(SessionStep {
        session_id: record.session_id,
        seq: record.seq.max(0) as u64,
        kind,
        message: record.message,
        payload: serde_json::from_str(&record.payload_json)?,
        created_at: record.created_at,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn save_session(&self, session: &ResearchSession) -> Result<(), LedgerError> {
        let record = session_to_record(session)?;
        SessionRepository::new(&self.pool).upsert(&record).await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ResearchSession>, LedgerError> {
        match SessionRepository::new(&self.pool).get(id).await? {
            Some(record) => Ok(Some(serde_json::from_str(&record.record_json)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions(&self, limit: i64) -> Result<Vec<ResearchSession>, LedgerError> {
        let records = SessionRepository::new(&self.pool)
            .list_recent(limit, None)
            .await?;
        records
            .iter()
            .map(|r| serde_json::from_str(&r.record_json).map_err(LedgerError::from))
            .collect()
    }

    async fn append_step(&self, step: &SessionStep) -> Result<(), LedgerError> {
        let record = StepRecord {
            id: None,
            session_id: step.session_id.clone(),
            seq: step.seq as i64,
            kind: step.kind.as_str().to_string(),
            message: step.message.clone(),
            payload_json: serde_json::to_string(&step.payload)?,
            created_at: step.created_at,
        };
        StepRepository::new(&self.pool).append(&record).await?;
        Ok(())
    }

    async fn list_steps(&self, session_id: &str) -> Result<Vec<SessionStep>, LedgerError> {
        StepRepository::new(&self.pool)
            .list_by_session(session_id)
            .await?
            .into_iter()
            .map(step_from_record)
            .collect()
    }

    async fn save_experiment(&self, record: &ExperimentRecord) -> Result<(), LedgerError> {
        let note = ExperimentNoteRecord {
            id: record.id.clone(),
            session_id: record.session_id.clone(),
            sequence: i64::from(record.sequence),
            fingerprint: record.fingerprint.clone(),
            decision: record.decision.as_str().to_string(),
            score: Some(record.candidate.score.to_string()),
            record_json: serde_json::to_string(record)?,
            created_at: record.created_at,
        };
        ExperimentRepository::new(&self.pool).save(&note).await?;
        Ok(())
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<ExperimentRecord>, LedgerError> {
        match ExperimentRepository::new(&self.pool).get(id).await? {
            Some(note) => Ok(Some(serde_json::from_str(&note.record_json)?)),
            None => Ok(None),
        }
    }

    async fn list_experiments(
        &self,
        session_id: &str,
    ) -> Result<Vec<ExperimentRecord>, LedgerError> {
        ExperimentRepository::new(&self.pool)
            .list_by_session(session_id)
            .await?
            .iter()
            .map(|n| serde_json::from_str(&n.record_json).map_err(LedgerError::from))
            .collect()
    }

    async fn put_memory(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), LedgerError> {
        let record = MemoryEntryRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value_json: serde_json::to_string(value)?,
            updated_at: Utc::now().timestamp_millis(),
        };
        MemoryRepository::new(&self.pool).upsert(&record).await?;
        Ok(())
    }

    async fn get_memory(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, LedgerError> {
        match MemoryRepository::new(&self.pool).get(namespace, key).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value_json)?)),
            None => Ok(None),
        }
    }

    async fn list_memory(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, LedgerError> {
        MemoryRepository::new(&self.pool)
            .list_namespace(namespace)
            .await?
            .into_iter()
            .map(|entry| Ok((entry.key, serde_json::from_str(&entry.value_json)?)))
            .collect()
    }
}
