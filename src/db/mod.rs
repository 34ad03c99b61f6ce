use crate::clock::now_unix_ms;
use crate::error::AppError;
use crate::store::SharedStore;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};

const DEFAULT_DB_FILENAME: &str = "orderbook-coordinator.db";
const DEFAULT_DATA_DIR: &str = ".";

fn resolve_db_filename() -> String {
    std::env::var("APP_DB_FILENAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

fn resolve_data_dir() -> PathBuf {
    std::env::var("APP_DATA_DIR")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn resolve_db_path() -> Result<PathBuf, AppError> {
    let mut base_dir = resolve_data_dir();
    std::fs::create_dir_all(&base_dir)?;
    base_dir.push(resolve_db_filename());
    Ok(base_dir)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(2));

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, AppError> {
        Ok(Self::new(initialize_pool_from_path(path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl SharedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM shared_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO shared_state (key, value, updated_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
        )
        .bind(key)
        .bind(value)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM shared_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM shared_state WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_db_path() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();

        std::env::temp_dir().join(format!(
            "orderbook-coordinator-{timestamp}-{}.db",
            uuid::Uuid::new_v4().simple()
        ))
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db_path = unique_db_path();

        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");

        run_migrations(&pool)
            .await
            .expect("running migrations multiple times should succeed");

        let rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM shared_state")
            .fetch_one(&pool)
            .await
            .expect("shared_state table must exist and be queryable");

        assert_eq!(rows, 0);

        drop(pool);
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn stores_and_scans_keys() {
        let db_path = unique_db_path();
        let store = SqliteStore::open(&db_path)
            .await
            .expect("store should open");

        store.set("ns:heartbeat:b", "20").await.expect("set b");
        store.set("ns:heartbeat:a", "10").await.expect("set a");
        store.set("ns:leader_id", "a").await.expect("set leader");
        store.set("ns:heartbeat:a", "11").await.expect("overwrite a");

        assert_eq!(
            store.get("ns:heartbeat:a").await.expect("get"),
            Some("11".to_string())
        );
        assert_eq!(
            store.keys_with_prefix("ns:heartbeat:").await.expect("scan"),
            vec!["ns:heartbeat:a", "ns:heartbeat:b"]
        );

        store.delete("ns:heartbeat:a").await.expect("delete");
        assert_eq!(store.get("ns:heartbeat:a").await.expect("get"), None);
        assert!(store.changes().is_none());

        store.pool().close().await;
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn contents_survive_reopening_the_database() {
        let db_path = unique_db_path();
        {
            let store = SqliteStore::open(&db_path)
                .await
                .expect("store should open");
            store.set("ns:leader_id", "tab-1").await.expect("set");
            store.pool().close().await;
        }

        let reopened = SqliteStore::open(&db_path)
            .await
            .expect("store should reopen");
        assert_eq!(
            reopened.get("ns:leader_id").await.expect("get"),
            Some("tab-1".to_string())
        );

        reopened.pool().close().await;
        let _ = std::fs::remove_file(db_path);
    }
}
