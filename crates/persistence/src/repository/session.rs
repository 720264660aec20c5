//! Research session repository: latest snapshot of each autopilot session

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A research session row. `record_json` holds the full serialized session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub record_json: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Repository for research sessions
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the snapshot for a session
    pub async fn upsert(&self, record: &SessionRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO research_sessions (
                id, status, symbol, timeframe, strategy, record_json,
                created_at, updated_at, finished_at, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                record_json = excluded.record_json,
                updated_at = excluded.updated_at,
                finished_at = excluded.finished_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&record.id)
        .bind(&record.status)
        .bind(&record.symbol)
        .bind(&record.timeframe)
        .bind(&record.strategy)
        .bind(&record.record_json)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.finished_at)
        .bind(&record.last_error)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Get a session by id
    pub async fn get(&self, id: &str) -> DbResult<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, status, symbol, timeframe, strategy, record_json,
                   created_at, updated_at, finished_at, last_error
            FROM research_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent sessions, optionally filtered by status
    pub async fn list_recent(&self, limit: i64, status: Option<&str>) -> DbResult<Vec<SessionRecord>> {
        let mut sql = String::from(
            r#"
            SELECT id, status, symbol, timeframe, strategy, record_json,
                   created_at, updated_at, finished_at, last_error
            FROM research_sessions
            WHERE 1=1
            "#,
        );
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, SessionRecord>(&sql);
        if let Some(s) = status {
            query = query.bind(s);
        }
        let records = query.bind(limit).fetch_all(self.pool).await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(id: &str, status: &str, created_at: i64) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            status: status.to_string(),
            symbol: "EURUSD".to_string(),
            timeframe: "15m".to_string(),
            strategy: "breakout".to_string(),
            record_json: "{}".to_string(),
            created_at,
            updated_at: created_at,
            finished_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_snapshot() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool());

        repo.upsert(&record("rs-1", "running", 100)).await.unwrap();

        let mut done = record("rs-1", "completed", 100);
        done.updated_at = 200;
        done.finished_at = Some(200);
        done.record_json = r#"{"status":"completed"}"#.to_string();
        repo.upsert(&done).await.unwrap();

        let stored = repo.get("rs-1").await.unwrap().unwrap();
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.updated_at, 200);
        assert_eq!(stored.finished_at, Some(200));
        assert_eq!(stored.created_at, 100);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recent_filters_by_status() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool());

        repo.upsert(&record("rs-1", "completed", 100)).await.unwrap();
        repo.upsert(&record("rs-2", "running", 200)).await.unwrap();
        repo.upsert(&record("rs-3", "completed", 300)).await.unwrap();

        let all = repo.list_recent(10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "rs-3");

        let completed = repo.list_recent(10, Some("completed")).await.unwrap();
        assert_eq!(completed.len(), 2);
        assert!(completed.iter().all(|r| r.status == "completed"));
    }
}
