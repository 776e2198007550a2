use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::time::{timeout, Duration};
use tracing::info;

use spica_shared::OptimizerStore;

// Database operation timeout to prevent indefinite hangs on locks.
const DB_TIMEOUT_SECS: u64 = 10;

pub async fn init_db(pool: &SqlitePool, database_url: &str) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS optimizer_data (
            namespace TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (namespace, key)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            target_id TEXT,
            result TEXT NOT NULL,
            reason TEXT NOT NULL,
            metadata TEXT,
            trace_id TEXT
        )",
    )
    .execute(pool)
    .await?;

    info!("Database initialized at {}", database_url);
    Ok(())
}

fn validate_key(namespace: &str, key: &str) -> anyhow::Result<()> {
    if namespace.contains('\0') || namespace.len() > 255 {
        anyhow::bail!("namespace must not contain null bytes and must be <= 255 chars");
    }
    if key.contains('\0') || key.len() > 255 {
        anyhow::bail!("key must not contain null bytes and must be <= 255 chars");
    }
    Ok(())
}

pub struct SqliteDataStore {
    pool: SqlitePool,
}

impl SqliteDataStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OptimizerStore for SqliteDataStore {
    async fn set_json(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<()> {
        validate_key(namespace, key)?;
        let val_str = serde_json::to_string(&value)?;

        let query_future = sqlx::query(
            "INSERT OR REPLACE INTO optimizer_data (namespace, key, value) VALUES (?, ?, ?)",
        )
        .bind(namespace)
        .bind(key)
        .bind(val_str)
        .execute(&self.pool);

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })?
            .map_err(|e| anyhow::anyhow!("Failed to save key '{}' in '{}': {}", key, namespace, e))?;

        Ok(())
    }

    async fn get_json(
        &self,
        namespace: &str,
        key: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        validate_key(namespace, key)?;

        let query_future = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM optimizer_data WHERE namespace = ? AND key = ?",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool);

        let row: Option<(String,)> = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })?
            .map_err(|e| anyhow::anyhow!("Failed to get key '{}' in '{}': {}", key, namespace, e))?;

        match row {
            Some((val_str,)) => Ok(Some(serde_json::from_str(&val_str)?)),
            None => Ok(None),
        }
    }

    async fn get_prefix(
        &self,
        namespace: &str,
        key_prefix: &str,
    ) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
        validate_key(namespace, key_prefix)?;

        // LIKE with escaped wildcards so prefixes containing % or _ stay literal
        let escaped = key_prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let pattern = format!("{escaped}%");

        let query_future = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM optimizer_data
             WHERE namespace = ? AND key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(namespace)
        .bind(pattern)
        .fetch_all(&self.pool);

        let rows = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })?
            .map_err(|e| {
                anyhow::anyhow!("Failed to scan prefix '{}' in '{}': {}", key_prefix, namespace, e)
            })?;

        rows.into_iter()
            .map(|(k, v)| Ok((k, serde_json::from_str(&v)?)))
            .collect()
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        validate_key(namespace, key)?;

        let query_future = sqlx::query("DELETE FROM optimizer_data WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool);

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })?
            .map_err(|e| {
                anyhow::anyhow!("Failed to delete key '{}' in '{}': {}", key, namespace, e)
            })?;

        Ok(())
    }

    async fn increment_counter(&self, namespace: &str, key: &str) -> anyhow::Result<i64> {
        validate_key(namespace, key)?;

        // UPSERT with RETURNING keeps the increment atomic under concurrent calls.
        let query_future = sqlx::query_as::<_, (i64,)>(
            "INSERT INTO optimizer_data (namespace, key, value) VALUES (?, ?, '1')
             ON CONFLICT(namespace, key)
             DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
             RETURNING CAST(value AS INTEGER)",
        )
        .bind(namespace)
        .bind(key)
        .fetch_one(&self.pool);

        let (count,) = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS)
            })?
            .map_err(|e| {
                anyhow::anyhow!("Failed to increment '{}' in '{}': {}", key, namespace, e)
            })?;

        Ok(count)
    }
}

// ══════════════════════════════════════════════════════════════
// Audit log
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub target_id: Option<String>,
    pub result: String,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
    pub trace_id: Option<String>,
}

pub async fn write_audit_log(pool: &SqlitePool, entry: &AuditLogEntry) -> anyhow::Result<()> {
    let metadata = entry
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        "INSERT INTO audit_logs (timestamp, event_type, target_id, result, reason, metadata, trace_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.timestamp.to_rfc3339())
    .bind(&entry.event_type)
    .bind(&entry.target_id)
    .bind(&entry.result)
    .bind(&entry.reason)
    .bind(metadata)
    .bind(&entry.trace_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fire-and-forget audit write; failures are logged, never propagated.
pub fn spawn_audit_log(pool: SqlitePool, entry: AuditLogEntry) {
    tokio::spawn(async move {
        if let Err(e) = write_audit_log(&pool, &entry).await {
            tracing::error!("Failed to write audit log ({}): {}", entry.event_type, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use spica_shared::OptimizerStore;

    async fn setup() -> SqliteDataStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_db(&pool, "sqlite::memory:").await.unwrap();
        SqliteDataStore::new(pool)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = setup().await;
        store
            .set_json("core.test", "alpha", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        let val = store.get_json("core.test", "alpha").await.unwrap().unwrap();
        assert_eq!(val["x"], 1);
    }

    #[tokio::test]
    async fn test_increment_counter_sequential() {
        let store = setup().await;
        assert_eq!(store.increment_counter("core.test", "gen").await.unwrap(), 1);
        assert_eq!(store.increment_counter("core.test", "gen").await.unwrap(), 2);
        assert_eq!(store.increment_counter("core.test", "gen").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_prefix_scan_ordered() {
        let store = setup().await;
        for key in ["pack:b", "pack:a", "other:z"] {
            store
                .set_json("core.test", key, serde_json::json!(key))
                .await
                .unwrap();
        }
        let rows = store.get_prefix("core.test", "pack:").await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["pack:a", "pack:b"]);
    }

    #[tokio::test]
    async fn test_namespaces_isolated() {
        let store = setup().await;
        store
            .set_json("ns.one", "key", serde_json::json!(1))
            .await
            .unwrap();
        assert!(store.get_json("ns.two", "key").await.unwrap().is_none());
    }
}
