//! # Transactions and Advisory Locks
//!
//! Every repository method accepts `Option<&mut Tx>`. With `Some`, the statement
//! runs inside the caller's transaction; with `None` it runs on a connection
//! checked out of the pool for the duration of the call.

use crate::errors::{ForgeError, Result};
use crate::storage::util::string_to_u64_hash;
use crate::storage::DbPool;
use rand::Rng;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, PgConnection, Postgres, Transaction};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tracing::instrument;

/// Maximum time a statement inside a transaction waits for a row or table lock
pub const DEFAULT_TX_LOCK_TIMEOUT_SECONDS: u64 = 300;

const DEFAULT_LOCK_RETRIES: u32 = 3;
const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(300);
const DEFAULT_LOCK_RETRY_MAX_JITTER: Duration = Duration::from_millis(100);

/// Retry policy for [`Tx::try_acquire_advisory_lock`]
#[derive(Debug, Clone, Copy)]
pub struct LockRetryOptions {
    /// Total number of attempts, including the first one
    pub retries: u32,
    /// Delay before the second attempt; doubles after every failed attempt
    pub delay: Duration,
    /// Upper bound of the random delay added to every wait
    pub jitter: Duration,
}

impl Default for LockRetryOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_LOCK_RETRIES,
            delay: DEFAULT_LOCK_RETRY_DELAY,
            jitter: DEFAULT_LOCK_RETRY_MAX_JITTER,
        }
    }
}

impl LockRetryOptions {
    /// Wait before attempt `attempt + 1` (zero based), without jitter
    fn backoff(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// A database transaction.
///
/// Dropping a `Tx` without calling [`Tx::commit`] rolls it back.
pub struct Tx {
    inner: Transaction<'static, Postgres>,
}

impl Tx {
    /// Begin a transaction with a bounded lock timeout
    #[instrument(skip(pool), name = "db_begin_tx")]
    pub async fn begin(pool: &DbPool) -> Result<Self> {
        let mut inner = pool
            .begin()
            .await
            .map_err(|e| ForgeError::database(e, "Failed to begin transaction"))?;

        if let Err(e) = (&mut *inner).execute(sqlx::raw_sql(&set_lock_timeout_sql())).await {
            if let Err(rollback_err) = inner.rollback().await {
                tracing::warn!(error = %rollback_err, "Failed to roll back transaction");
            }
            return Err(ForgeError::database(e, "Failed to set transaction lock timeout"));
        }

        Ok(Self { inner })
    }

    /// Commit the transaction
    #[instrument(skip(self), name = "db_commit_tx")]
    pub async fn commit(self) -> Result<()> {
        self.inner
            .commit()
            .await
            .map_err(|e| ForgeError::database(e, "Failed to commit transaction"))
    }

    /// Roll the transaction back
    #[instrument(skip(self), name = "db_rollback_tx")]
    pub async fn rollback(self) -> Result<()> {
        self.inner
            .rollback()
            .await
            .map_err(|e| ForgeError::database(e, "Failed to roll back transaction"))
    }

    /// The connection the transaction runs on
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.inner
    }

    /// Take a transaction-scoped advisory lock.
    ///
    /// A blocking request waits (bounded by the transaction lock timeout). A
    /// non-blocking request fails with [`ForgeError::AdvisoryLockNotAcquired`]
    /// when another transaction holds the lock. The lock is released when the
    /// transaction commits or rolls back.
    #[instrument(skip(self), name = "db_acquire_advisory_lock")]
    pub async fn acquire_advisory_lock(&mut self, lock_id: i64, blocking: bool) -> Result<()> {
        if blocking {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(lock_id)
                .execute(&mut *self.inner)
                .await
                .map_err(|e| {
                    ForgeError::database(e, format!("Failed to acquire advisory lock {}", lock_id))
                })?;
            return Ok(());
        }

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *self.inner)
            .await
            .map_err(|e| {
                ForgeError::database(e, format!("Failed to try advisory lock {}", lock_id))
            })?;

        if !acquired {
            return Err(ForgeError::AdvisoryLockNotAcquired { lock_id });
        }

        Ok(())
    }

    /// Take a transaction-scoped advisory lock, retrying non-blocking attempts
    /// with exponential backoff and random jitter.
    ///
    /// Only [`ForgeError::AdvisoryLockNotAcquired`] is retried; any database error
    /// aborts the transaction and is returned immediately.
    #[instrument(skip(self, options), name = "db_try_acquire_advisory_lock")]
    pub async fn try_acquire_advisory_lock(
        &mut self,
        lock_id: i64,
        options: Option<LockRetryOptions>,
    ) -> Result<()> {
        let options = options.unwrap_or_default();
        let attempts = options.retries.max(1);

        let mut attempt = 0;
        loop {
            match self.acquire_advisory_lock(lock_id, false).await {
                Ok(()) => return Ok(()),
                Err(ForgeError::AdvisoryLockNotAcquired { .. }) if attempt + 1 < attempts => {
                    let jitter_ms = options.jitter.as_millis() as u64;
                    let jitter = if jitter_ms == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                    };
                    let wait = options.backoff(attempt) + jitter;
                    tracing::debug!(
                        lock_id,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        "Advisory lock busy, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn set_lock_timeout_sql() -> String {
    format!("SET LOCAL lock_timeout = '{}s'", DEFAULT_TX_LOCK_TIMEOUT_SECONDS)
}

/// Derive a Postgres advisory lock id from an arbitrary string.
///
/// Postgres lock ids are signed 64-bit integers; the top bit is cleared so the id
/// is always non-negative.
pub fn advisory_lock_id_from_str(id: &str) -> i64 {
    (string_to_u64_hash(id) & 0x7fff_ffff_ffff_ffff) as i64
}

/// Connection used by a single repository call
pub enum DbConn<'a> {
    /// Connection checked out of the pool for this call
    Pooled(PoolConnection<Postgres>),
    /// The caller's transaction
    Tx(&'a mut PgConnection),
}

impl Deref for DbConn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            DbConn::Pooled(conn) => conn,
            DbConn::Tx(conn) => conn,
        }
    }
}

impl DerefMut for DbConn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            DbConn::Pooled(conn) => conn,
            DbConn::Tx(conn) => conn,
        }
    }
}

/// Pick the executor for a repository call: the caller's transaction when given,
/// otherwise a pooled connection.
pub async fn acquire<'a>(pool: &DbPool, tx: Option<&'a mut Tx>) -> Result<DbConn<'a>> {
    match tx {
        Some(tx) => Ok(DbConn::Tx(tx.connection())),
        None => pool
            .acquire()
            .await
            .map(DbConn::Pooled)
            .map_err(|e| ForgeError::database(e, "Failed to acquire database connection")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_is_stable_and_non_negative() {
        let id = uuid::Uuid::new_v4().to_string();
        let a = advisory_lock_id_from_str(&id);
        let b = advisory_lock_id_from_str(&id);
        assert_eq!(a, b);
        assert!(a >= 0);
        assert_ne!(advisory_lock_id_from_str("site-a"), advisory_lock_id_from_str("site-b"));
    }

    #[test]
    fn test_lock_timeout_statement() {
        assert_eq!(set_lock_timeout_sql(), "SET LOCAL lock_timeout = '300s'");
    }

    #[test]
    fn test_retry_defaults() {
        let options = LockRetryOptions::default();
        assert_eq!(options.retries, 3);
        assert_eq!(options.delay, Duration::from_millis(300));
        assert_eq!(options.jitter, Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_doubles() {
        let options = LockRetryOptions::default();
        assert_eq!(options.backoff(0), Duration::from_millis(300));
        assert_eq!(options.backoff(1), Duration::from_millis(600));
        assert_eq!(options.backoff(2), Duration::from_millis(1200));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::TestDatabase;

        #[tokio::test]
        async fn test_non_blocking_lock_conflict() {
            let db = TestDatabase::new("tx_lock_conflict").await;
            let lock_id = advisory_lock_id_from_str("tenant-provisioning");

            let mut first = Tx::begin(&db.pool).await.unwrap();
            first.acquire_advisory_lock(lock_id, true).await.unwrap();

            let mut second = Tx::begin(&db.pool).await.unwrap();
            let err = second.acquire_advisory_lock(lock_id, false).await.unwrap_err();
            assert!(matches!(err, ForgeError::AdvisoryLockNotAcquired { .. }));

            let quick = LockRetryOptions {
                retries: 2,
                delay: Duration::from_millis(10),
                jitter: Duration::ZERO,
            };
            let err = second.try_acquire_advisory_lock(lock_id, Some(quick)).await.unwrap_err();
            assert!(matches!(err, ForgeError::AdvisoryLockNotAcquired { .. }));

            first.commit().await.unwrap();
            second.try_acquire_advisory_lock(lock_id, Some(quick)).await.unwrap();
            second.rollback().await.unwrap();
        }

        #[tokio::test]
        async fn test_begin_sets_lock_timeout() {
            let db = TestDatabase::new("tx_lock_timeout").await;
            let mut tx = Tx::begin(&db.pool).await.unwrap();

            let timeout: String = sqlx::query_scalar("SHOW lock_timeout")
                .fetch_one(tx.connection())
                .await
                .unwrap();
            assert_eq!(timeout, "5min");
        }
    }
}
