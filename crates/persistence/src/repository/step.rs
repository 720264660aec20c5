//! Session step repository: append-only progress trail per session

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub seq: i64,
    pub kind: String,
    pub message: String,
    pub payload_json: String,
    pub created_at: i64,
}

pub struct StepRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StepRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a step (INSERT OR IGNORE: a replayed (session_id, seq) is a no-op)
    pub async fn append(&self, record: &StepRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO session_steps (
                session_id, seq, kind, message, payload_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.session_id)
        .bind(record.seq)
        .bind(&record.kind)
        .bind(&record.message)
        .bind(&record.payload_json)
        .bind(record.created_at)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All steps of a session in sequence order
    pub async fn list_by_session(&self, session_id: &str) -> DbResult<Vec<StepRecord>> {
        let records = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT id, session_id, seq, kind, message, payload_json, created_at
            FROM session_steps
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn step(session_id: &str, seq: i64, kind: &str) -> StepRecord {
        StepRecord {
            id: None,
            session_id: session_id.to_string(),
            seq,
            kind: kind.to_string(),
            message: format!("{kind} #{seq}"),
            payload_json: "{}".to_string(),
            created_at: seq * 10,
        }
    }

    #[tokio::test]
    async fn test_steps_are_ordered_and_scoped() {
        let db = Database::in_memory().await.unwrap();
        let repo = StepRepository::new(db.pool());

        repo.append(&step("rs-1", 2, "round_completed")).await.unwrap();
        repo.append(&step("rs-1", 1, "started")).await.unwrap();
        repo.append(&step("rs-2", 1, "started")).await.unwrap();
        // Replayed seq is ignored
        repo.append(&step("rs-1", 1, "started")).await.unwrap();

        let steps = repo.list_by_session("rs-1").await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].seq, 1);
        assert_eq!(steps[1].kind, "round_completed");
    }
}
