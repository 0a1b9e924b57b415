//! # Storage and Persistence
//!
//! PostgreSQL connectivity, transactions, migrations and one repository per table.

pub mod migrations;
pub mod paginator;
pub mod pool;
pub mod query;
pub mod repositories;
pub mod tx;
pub mod util;

#[cfg(test)]
pub mod test_helpers;

pub use crate::config::DatabaseConfig;

pub use migrations::{
    get_migration_version, init_migrations, list_applied_migrations, lock_migrations,
    rollback_last_migration, run_migrations, unlock_migrations, validate_migrations,
    MigrationInfo,
};
pub use paginator::{OrderBy, OrderDirection, PageInput, DEFAULT_LIMIT, MAX_LIMIT, TOTAL_LIMIT};
pub use pool::{create_pool, get_pool_stats, DbPool, PoolStats};
pub use query::{MAX_BATCH_ITEMS, MAX_BATCH_ITEMS_TO_TRACE};
pub use tx::{acquire, advisory_lock_id_from_str, DbConn, LockRetryOptions, Tx};

use crate::errors::{ForgeError, Result};

/// Check database connectivity
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| ForgeError::database(e, "Database connectivity check failed"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_database_url() {
        let config = DatabaseConfig { url: "invalid://url".to_string(), ..Default::default() };

        let result = create_pool(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_check_connection_unreachable() {
        let pool = test_helpers::lazy_pool();
        let err = check_connection(&pool).await.unwrap_err();
        assert!(matches!(err, ForgeError::Database { .. }));
    }

    #[cfg(feature = "postgres_tests")]
    #[tokio::test]
    async fn test_check_connection() {
        let db = test_helpers::TestDatabase::new("storage_check_connection").await;
        check_connection(&db.pool).await.unwrap();
        assert!(get_pool_stats(&db.pool).is_healthy());
    }
}
