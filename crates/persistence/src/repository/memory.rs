//! Keyed memory entries: small JSON documents grouped by namespace

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MemoryEntryRecord {
    pub namespace: String,
    pub key: String,
    pub value_json: String,
    pub updated_at: i64,
}

pub struct MemoryRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MemoryRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, record: &MemoryEntryRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_entries (namespace, key, value_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.namespace)
        .bind(&record.key)
        .bind(&record.value_json)
        .bind(record.updated_at)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, namespace: &str, key: &str) -> DbResult<Option<MemoryEntryRecord>> {
        let record = sqlx::query_as::<_, MemoryEntryRecord>(
            r#"
            SELECT namespace, key, value_json, updated_at
            FROM memory_entries
            WHERE namespace = ? AND key = ?
            "#,
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_namespace(&self, namespace: &str) -> DbResult<Vec<MemoryEntryRecord>> {
        let records = sqlx::query_as::<_, MemoryEntryRecord>(
            r#"
            SELECT namespace, key, value_json, updated_at
            FROM memory_entries
            WHERE namespace = ?
            ORDER BY key ASC
            "#,
        )
        .bind(namespace)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_upsert_overwrites_within_namespace() {
        let db = Database::in_memory().await.unwrap();
        let repo = MemoryRepository::new(db.pool());

        let mut entry = MemoryEntryRecord {
            namespace: "search_space_presets".to_string(),
            key: "breakout-wide".to_string(),
            value_json: r#"{"period":[10,20]}"#.to_string(),
            updated_at: 1,
        };
        repo.upsert(&entry).await.unwrap();

        entry.value_json = r#"{"period":[10,20,30]}"#.to_string();
        entry.updated_at = 2;
        repo.upsert(&entry).await.unwrap();

        let stored = repo
            .get("search_space_presets", "breakout-wide")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value_json, r#"{"period":[10,20,30]}"#);
        assert_eq!(stored.updated_at, 2);

        assert!(repo
            .get("experiment_registry", "breakout-wide")
            .await
            .unwrap()
            .is_none());
        assert_eq!(repo.list_namespace("search_space_presets").await.unwrap().len(), 1);
    }
}
