use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evalrig_core::StoreTimestamp;
use evalrig_lock::{LockError, LockRecord, LockStore, TryInsertOutcome};
use sqlx::PgPool;
use sqlx::Row;

use crate::config::PostgresLockConfig;
use crate::migrations;

/// PostgreSQL-backed implementation of [`LockStore`].
///
/// Uses a `UNIQUE(resource_id)` table for conditional insert; `try_insert`
/// relies on `INSERT ... ON CONFLICT (resource_id) DO NOTHING` to get an
/// atomic race-free claim without taking an explicit row lock.
pub struct PostgresLockStore {
    pool: PgPool,
    config: Arc<PostgresLockConfig>,
}

impl PostgresLockStore {
    /// Connect, create the pool, and run migrations.
    ///
    /// # Errors
    /// Returns [`LockError::Permanent`] if the pool cannot be created, or if
    /// migrations fail.
    pub async fn new(config: PostgresLockConfig) -> Result<Self, LockError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await
            .map_err(|e| LockError::Permanent {
                resource_id: String::new(),
                message: format!("failed to connect: {e}"),
            })?;

        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| LockError::Permanent {
                resource_id: String::new(),
                message: format!("migrations failed: {e}"),
            })?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// Build from an already-connected pool, useful when the pool is shared
    /// with a pool-deployment store. Runs migrations on creation.
    ///
    /// # Errors
    /// Returns [`LockError::Permanent`] if migrations fail.
    pub async fn from_pool(pool: PgPool, config: PostgresLockConfig) -> Result<Self, LockError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| LockError::Permanent {
                resource_id: String::new(),
                message: format!("migrations failed: {e}"),
            })?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    fn backend_err(resource_id: &str, err: sqlx::Error) -> LockError {
        LockError::Transient {
            resource_id: resource_id.to_owned(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    async fn try_insert(
        &self,
        resource_id: &str,
        owner_token: &str,
        lease_ttl: Duration,
    ) -> Result<TryInsertOutcome, LockError> {
        let table = self.config.locks_table();
        let now = chrono::Utc::now();
        let ttl = chrono::Duration::from_std(lease_ttl).map_err(|err| LockError::Invariant(
            resource_id.to_owned(),
            format!("lease_ttl out of range: {err}"),
        ))?;
        let expires_at = now + ttl;

        let insert = format!(
            "INSERT INTO {table} (resource_id, owner_token, acquired_at, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (resource_id) DO NOTHING"
        );

        let result = sqlx::query(&insert)
            .bind(resource_id)
            .bind(owner_token)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::backend_err(resource_id, e))?;

        if result.rows_affected() > 0 {
            return Ok(TryInsertOutcome::inserted());
        }

        let existing = self.read(resource_id).await?.ok_or_else(|| LockError::Invariant(
            resource_id.to_owned(),
            "ON CONFLICT DO NOTHING fired but no row is readable".into(),
        ))?;
        Ok(TryInsertOutcome::conflict(existing))
    }

    async fn delete_if_owner(
        &self,
        resource_id: &str,
        owner_token: &str,
    ) -> Result<bool, LockError> {
        let table = self.config.locks_table();
        let delete = format!("DELETE FROM {table} WHERE resource_id = $1 AND owner_token = $2");

        let result = sqlx::query(&delete)
            .bind(resource_id)
            .bind(owner_token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::backend_err(resource_id, e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn read(&self, resource_id: &str) -> Result<Option<LockRecord>, LockError> {
        let table = self.config.locks_table();
        let select = format!(
            "SELECT resource_id, owner_token, acquired_at, expires_at, holder_hint \
             FROM {table} WHERE resource_id = $1 AND expires_at > NOW()"
        );

        let row = sqlx::query(&select)
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::backend_err(resource_id, e))?;

        Ok(row.map(|row| LockRecord {
            resource_id: row.get("resource_id"),
            owner_token: row.get("owner_token"),
            acquired_at: row.get::<StoreTimestamp, _>("acquired_at"),
            expires_at: row.get::<StoreTimestamp, _>("expires_at"),
            holder_hint: row.get("holder_hint"),
        }))
    }

    async fn sweep_expired(&self, now: StoreTimestamp) -> Result<u64, LockError> {
        let table = self.config.locks_table();
        let delete = format!("DELETE FROM {table} WHERE expires_at <= $1");

        let result = sqlx::query(&delete)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Transient {
                resource_id: String::new(),
                message: e.to_string(),
            })?;

        Ok(result.rows_affected())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn test_config() -> PostgresLockConfig {
        PostgresLockConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/evalrig_test".to_string()),
            table_prefix: format!("test_{}_", uuid::Uuid::new_v4().simple()),
            ..PostgresLockConfig::default()
        }
    }

    #[tokio::test]
    async fn lock_conformance() {
        let config = test_config();
        let store: StdArc<dyn LockStore> = StdArc::new(
            PostgresLockStore::new(config)
                .await
                .expect("pool creation should succeed"),
        );
        evalrig_lock::testing::run_lock_conformance_tests(store).await;
    }
}
