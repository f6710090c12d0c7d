use sqlx::PgPool;

use crate::config::PostgresPoolConfig;

/// Create the `pool_deployments` table if it does not exist.
///
/// # Errors
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool, config: &PostgresPoolConfig) -> Result<(), sqlx::Error> {
    let table = config.deployments_table();

    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            deployment_id        TEXT PRIMARY KEY,
            pool_name            TEXT NOT NULL,
            deployment_name      TEXT NOT NULL,
            state                TEXT NOT NULL,
            allocated_to         TEXT NULL,
            allocation_deadline  TIMESTAMPTZ NULL,
            created_at           TIMESTAMPTZ NOT NULL,
            last_used_at         TIMESTAMPTZ NOT NULL,
            build_fingerprint    TEXT NULL,
            failure_count        INTEGER NOT NULL DEFAULT 0
        )"
    );

    let create_idx = format!(
        "CREATE INDEX IF NOT EXISTS {}pool_deployments_pool_state_idx \
         ON {table} (pool_name, state)",
        config.table_prefix
    );

    sqlx::query(&create_table).execute(pool).await?;
    sqlx::query(&create_idx).execute(pool).await?;

    Ok(())
}
