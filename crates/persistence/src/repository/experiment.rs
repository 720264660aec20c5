//! Experiment audit notes: one immutable row per research experiment

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExperimentNoteRecord {
    pub id: String,
    pub session_id: String,
    pub sequence: i64,
    pub fingerprint: String,
    pub decision: String,
    pub score: Option<String>,
    pub record_json: String,
    pub created_at: i64,
}

pub struct ExperimentRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ExperimentRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save an audit note (INSERT OR IGNORE: notes are never rewritten)
    pub async fn save(&self, record: &ExperimentNoteRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO experiment_notes (
                id, session_id, sequence, fingerprint, decision, score, record_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(record.sequence)
        .bind(&record.fingerprint)
        .bind(&record.decision)
        .bind(&record.score)
        .bind(&record.record_json)
        .bind(record.created_at)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<ExperimentNoteRecord>> {
        let record = sqlx::query_as::<_, ExperimentNoteRecord>(
            r#"
            SELECT id, session_id, sequence, fingerprint, decision, score, record_json, created_at
            FROM experiment_notes
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_by_session(&self, session_id: &str) -> DbResult<Vec<ExperimentNoteRecord>> {
        let records = sqlx::query_as::<_, ExperimentNoteRecord>(
            r#"
            SELECT id, session_id, sequence, fingerprint, decision, score, record_json, created_at
            FROM experiment_notes
            WHERE session_id = ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Count of notes per decision for a session
    pub async fn decision_counts(&self, session_id: &str) -> DbResult<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT decision, COUNT(*)
            FROM experiment_notes
            WHERE session_id = ?
            GROUP BY decision
            ORDER BY decision
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn note(id: &str, sequence: i64, decision: &str) -> ExperimentNoteRecord {
        ExperimentNoteRecord {
            id: id.to_string(),
            session_id: "rs-1".to_string(),
            sequence,
            fingerprint: format!("fp-{sequence}"),
            decision: decision.to_string(),
            score: Some("1.2".to_string()),
            record_json: format!(r#"{{"decision":"{decision}"}}"#),
            created_at: sequence,
        }
    }

    #[tokio::test]
    async fn test_notes_are_immutable() {
        let db = Database::in_memory().await.unwrap();
        let repo = ExperimentRepository::new(db.pool());

        assert!(repo.save(&note("rs-1-e1", 1, "adopt")).await.unwrap());
        // Second write with the same id must not overwrite the audit trail
        assert!(!repo.save(&note("rs-1-e1", 1, "reject")).await.unwrap());

        let stored = repo.get("rs-1-e1").await.unwrap().unwrap();
        assert_eq!(stored.decision, "adopt");
    }

    #[tokio::test]
    async fn test_list_and_decision_counts() {
        let db = Database::in_memory().await.unwrap();
        let repo = ExperimentRepository::new(db.pool());

        repo.save(&note("rs-1-e2", 2, "investigate")).await.unwrap();
        repo.save(&note("rs-1-e1", 1, "adopt")).await.unwrap();
        repo.save(&note("rs-1-e3", 3, "adopt")).await.unwrap();

        let notes = repo.list_by_session("rs-1").await.unwrap();
        let seqs: Vec<i64> = notes.iter().map(|n| n.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let counts = repo.decision_counts("rs-1").await.unwrap();
        assert_eq!(
            counts,
            vec![("adopt".to_string(), 2), ("investigate".to_string(), 1)]
        );
    }
}
