use std::sync::Arc;

use async_trait::async_trait;
use evalrig_core::StoreTimestamp;
use evalrig_pool::{DeploymentRecord, DeploymentState, PoolError, PoolStore};
use sqlx::{PgPool, Row};

use crate::config::PostgresPoolConfig;
use crate::migrations;

/// PostgreSQL-backed implementation of [`PoolStore`].
///
/// `claim_one_hibernated` uses `FOR UPDATE SKIP LOCKED` inside a correlated
/// subquery so concurrent claimants never contend on the same candidate row
/// and never double-claim it -- the standard `sqlx` job-queue pattern,
/// applied here to deployment records instead of jobs.
pub struct PostgresPoolStore {
    pool: PgPool,
    config: Arc<PostgresPoolConfig>,
}

impl PostgresPoolStore {
    /// Connect, create the pool, and run migrations.
    ///
    /// # Errors
    /// Returns [`PoolError::PermanentStore`] if the pool cannot be created
    /// or migrations fail.
    pub async fn new(config: PostgresPoolConfig) -> Result<Self, PoolError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await
            .map_err(|e| PoolError::PermanentStore {
                deployment_id: String::new(),
                message: format!("failed to connect: {e}"),
            })?;

        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| PoolError::PermanentStore {
                deployment_id: String::new(),
                message: format!("migrations failed: {e}"),
            })?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    pub async fn from_pool(pool: PgPool, config: PostgresPoolConfig) -> Result<Self, PoolError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| PoolError::PermanentStore {
                deployment_id: String::new(),
                message: format!("migrations failed: {e}"),
            })?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<DeploymentRecord, PoolError> {
        let state_str: String = row.get("state");
        let state = DeploymentState::parse(&state_str).ok_or_else(|| {
            PoolError::Invariant(
                row.get::<String, _>("deployment_id"),
                format!("unrecognised state column value: {state_str}"),
            )
        })?;

        Ok(DeploymentRecord {
            deployment_id: row.get("deployment_id"),
            pool_name: row.get("pool_name"),
            deployment_name: row.get("deployment_name"),
            state,
            allocated_to: row.get("allocated_to"),
            allocation_deadline: row.get("allocation_deadline"),
            created_at: row.get::<StoreTimestamp, _>("created_at"),
            last_used_at: row.get::<StoreTimestamp, _>("last_used_at"),
            build_fingerprint: row.get("build_fingerprint"),
            failure_count: u32::try_from(row.get::<i32, _>("failure_count")).unwrap_or(0),
        })
    }
}

#[async_trait]
impl PoolStore for PostgresPoolStore {
    async fn list_by_state(
        &self,
        pool_name: &str,
        state: DeploymentState,
    ) -> Result<Vec<DeploymentRecord>, PoolError> {
        let table = self.config.deployments_table();
        let query = format!(
            "SELECT * FROM {table} WHERE pool_name = $1 AND state = $2"
        );

        let rows = sqlx::query(&query)
            .bind(pool_name)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PoolError::TransientStore {
                deployment_id: pool_name.to_owned(),
                message: e.to_string(),
            })?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn claim_one_hibernated(
        &self,
        pool_name: &str,
        allocator_token: &str,
        deadline: StoreTimestamp,
        required_fingerprint: Option<&str>,
    ) -> Result<Option<DeploymentRecord>, PoolError> {
        let table = self.config.deployments_table();
        let now = chrono::Utc::now();

        let query = format!(
            "UPDATE {table} SET \
                state = 'ALLOCATED', \
                allocated_to = $2, \
                allocation_deadline = $3, \
                last_used_at = $4 \
             WHERE deployment_id = ( \
                SELECT deployment_id FROM {table} \
                WHERE pool_name = $1 AND state = 'HIBERNATED' \
                  AND ($5::text IS NULL OR build_fingerprint = $5) \
                ORDER BY last_used_at ASC \
                FOR UPDATE SKIP LOCKED \
                LIMIT 1 \
             ) \
             RETURNING *"
        );

        let row = sqlx::query(&query)
            .bind(pool_name)
            .bind(allocator_token)
            .bind(deadline)
            .bind(now)
            .bind(required_fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PoolError::TransientStore {
                deployment_id: pool_name.to_owned(),
                message: e.to_string(),
            })?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn release(&self, deployment_id: &str, allocator_token: &str) -> Result<bool, PoolError> {
        let table = self.config.deployments_table();
        let query = format!(
            "UPDATE {table} SET \
                state = 'HIBERNATED', \
                allocated_to = NULL, \
                allocation_deadline = NULL, \
                last_used_at = NOW() \
             WHERE deployment_id = $1 AND allocated_to = $2 AND state = 'ALLOCATED'"
        );

        let result = sqlx::query(&query)
            .bind(deployment_id)
            .bind(allocator_token)
            .execute(&self.pool)
            .await
            .map_err(|e| PoolError::TransientStore {
                deployment_id: deployment_id.to_owned(),
                message: e.to_string(),
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert(&self, record: DeploymentRecord) -> Result<(), PoolError> {
        let table = self.config.deployments_table();
        let query = format!(
            "INSERT INTO {table} \
                (deployment_id, pool_name, deployment_name, state, allocated_to, \
                 allocation_deadline, created_at, last_used_at, build_fingerprint, failure_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (deployment_id) DO UPDATE SET \
                pool_name = EXCLUDED.pool_name, \
                deployment_name = EXCLUDED.deployment_name, \
                state = EXCLUDED.state, \
                allocated_to = EXCLUDED.allocated_to, \
                allocation_deadline = EXCLUDED.allocation_deadline, \
                last_used_at = EXCLUDED.last_used_at, \
                build_fingerprint = EXCLUDED.build_fingerprint, \
                failure_count = EXCLUDED.failure_count"
        );

        sqlx::query(&query)
            .bind(&record.deployment_id)
            .bind(&record.pool_name)
            .bind(&record.deployment_name)
            .bind(record.state.as_str())
            .bind(&record.allocated_to)
            .bind(record.allocation_deadline)
            .bind(record.created_at)
            .bind(record.last_used_at)
            .bind(&record.build_fingerprint)
            .bind(i32::try_from(record.failure_count).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await
            .map_err(|e| PoolError::TransientStore {
                deployment_id: record.deployment_id.clone(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn set_state(
        &self,
        deployment_id: &str,
        state: DeploymentState,
    ) -> Result<(), PoolError> {
        let table = self.config.deployments_table();
        let failure_increment = i32::from(state == DeploymentState::Failed);
        let query = format!(
            "UPDATE {table} SET state = $2, failure_count = failure_count + $3 WHERE deployment_id = $1"
        );

        let result = sqlx::query(&query)
            .bind(deployment_id)
            .bind(state.as_str())
            .bind(failure_increment)
            .execute(&self.pool)
            .await
            .map_err(|e| PoolError::TransientStore {
                deployment_id: deployment_id.to_owned(),
                message: e.to_string(),
            })?;

        if result.rows_affected() == 0 {
            return Err(PoolError::Invariant(
                deployment_id.to_owned(),
                "set_state on unknown record".into(),
            ));
        }
        Ok(())
    }

    async fn retire(&self, deployment_id: &str) -> Result<(), PoolError> {
        let table = self.config.deployments_table();
        let query = format!("UPDATE {table} SET state = 'RETIRED' WHERE deployment_id = $1");

        let result = sqlx::query(&query)
            .bind(deployment_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PoolError::TransientStore {
                deployment_id: deployment_id.to_owned(),
                message: e.to_string(),
            })?;

        if result.rows_affected() == 0 {
            return Err(PoolError::Invariant(
                deployment_id.to_owned(),
                "retire on unknown record".into(),
            ));
        }
        Ok(())
    }

    async fn reclaim_overdue(&self, now: StoreTimestamp) -> Result<Vec<DeploymentRecord>, PoolError> {
        let table = self.config.deployments_table();
        let query = format!(
            "UPDATE {table} SET \
                state = 'HIBERNATED', \
                allocated_to = NULL, \
                allocation_deadline = NULL \
             WHERE state = 'ALLOCATED' AND allocation_deadline <= $1 \
             RETURNING *"
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PoolError::TransientStore {
                deployment_id: String::new(),
                message: e.to_string(),
            })?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
