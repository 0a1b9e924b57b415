//! # Database Migration Management
//!
//! Schema changes live in `migrations/` as `<version>_<name>.up.sql` files with an
//! optional `<version>_<name>.down.sql` counterpart. Applied versions are tracked in
//! `_forge_migrations`; a single-row `_forge_migration_locks` table lets operators
//! freeze the schema while maintenance is in progress.

use crate::errors::{ForgeError, Result};
use crate::storage::tx::advisory_lock_id_from_str;
use crate::storage::DbPool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection, Row};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Environment variable overriding the migrations directory
pub const MIGRATIONS_DIR_ENV: &str = "FORGE_DB_MIGRATIONS_DIR";

const MIGRATIONS_TABLE: &str = "_forge_migrations";
const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// Hashed into the session advisory lock that serializes schema changes
const SCHEMA_LOCK_NAME: &str = "forge-db-migrations";

/// SQLSTATE for `undefined_table`
const UNDEFINED_TABLE: &str = "42P01";

/// Applied migration as recorded in the tracking table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub installed_on: chrono::DateTime<chrono::Utc>,
    pub execution_time: i64,
    pub checksum: Vec<u8>,
}

/// A migration found on disk
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub up_sql: String,
    pub down_sql: Option<String>,
}

impl Migration {
    pub fn checksum(&self) -> Vec<u8> {
        calculate_checksum(&self.up_sql)
    }
}

/// A migration on disk paired with its applied record, if any
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub version: i64,
    pub description: String,
    pub applied: Option<MigrationInfo>,
}

/// Locate the migrations directory.
///
/// Checks `FORGE_DB_MIGRATIONS_DIR`, then `./migrations`, then `migrations/` next to
/// the executable, then the crate's own directory.
pub fn get_migrations_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(MIGRATIONS_DIR_ENV) {
        return PathBuf::from(dir);
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let migrations_dir = cwd.join("migrations");
    if migrations_dir.exists() {
        return migrations_dir;
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .map(|dir| dir.join("migrations"));
    match exe_dir {
        Some(dir) if dir.exists() => dir,
        _ => Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    }
}

/// Load and pair migration files from `dir`, sorted by version
pub fn load_migrations_from(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        return Err(ForgeError::validation(format!(
            "Migrations directory not found: {}",
            dir.display()
        )));
    }

    let entries = std::fs::read_dir(dir).map_err(|e| {
        ForgeError::io(e, format!("Failed to read migrations directory {}", dir.display()))
    })?;

    let mut ups: BTreeMap<i64, (String, String)> = BTreeMap::new();
    let mut downs: BTreeMap<i64, String> = BTreeMap::new();

    for entry in entries {
        let entry = entry.map_err(|e| ForgeError::io(e, "Failed to read migration file entry"))?;
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };

        let (stem, is_up) = if let Some(stem) = filename.strip_suffix(UP_SUFFIX) {
            (stem, true)
        } else if let Some(stem) = filename.strip_suffix(DOWN_SUFFIX) {
            (stem, false)
        } else {
            continue;
        };

        let version = extract_version_from_filename(stem)?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ForgeError::io(e, format!("Failed to read migration file {}", path.display()))
        })?;

        let duplicate = if is_up {
            ups.insert(version, (extract_description(stem), content)).is_some()
        } else {
            downs.insert(version, content).is_some()
        };
        if duplicate {
            return Err(ForgeError::validation(format!(
                "Duplicate migration version {} in {}",
                version,
                dir.display()
            )));
        }
    }

    if let Some(orphan) = downs.keys().find(|version| !ups.contains_key(version)) {
        return Err(ForgeError::validation(format!(
            "Down migration {} has no matching up migration",
            orphan
        )));
    }

    if ups.is_empty() {
        return Err(ForgeError::validation(format!(
            "No migration files found in {}",
            dir.display()
        )));
    }

    let migrations: Vec<Migration> = ups
        .into_iter()
        .map(|(version, (description, up_sql))| Migration {
            version,
            description,
            up_sql,
            down_sql: downs.remove(&version),
        })
        .collect();

    info!("Loaded {} migrations from {}", migrations.len(), dir.display());
    Ok(migrations)
}

/// Session advisory lock held while the schema changes.
///
/// The lock lives on a connection detached from the pool. Dropping the guard
/// without [`SchemaLock::release`] closes that connection, which also frees the lock.
struct SchemaLock {
    conn: PgConnection,
    lock_id: i64,
}

impl SchemaLock {
    /// Wait until no other process is changing the schema
    async fn acquire(pool: &DbPool) -> Result<Self> {
        let lock_id = advisory_lock_id_from_str(SCHEMA_LOCK_NAME);
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| ForgeError::database(e, "Failed to acquire migration connection"))?
            .detach();

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock_id)
            .execute(&mut conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to acquire migration lock"))?;

        debug!(lock_id, "Migration lock acquired");
        Ok(Self { conn, lock_id })
    }

    async fn release(mut self) {
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .execute(&mut self.conn)
            .await
        {
            warn!(error = %e, lock_id = self.lock_id, "Failed to release migration lock");
        }
        if let Err(e) = self.conn.close().await {
            warn!(error = %e, "Failed to close migration connection");
        }
    }
}

/// Run `work` while holding the schema lock, releasing it however `work` ends
async fn with_schema_lock<T, F, Fut>(pool: &DbPool, work: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock = SchemaLock::acquire(pool).await?;
    let result = work().await;
    lock.release().await;
    result
}

/// Create the tracking and lock tables
#[instrument(skip(pool), name = "db_init_migrations")]
pub async fn init_migrations(pool: &DbPool) -> Result<()> {
    with_schema_lock(pool, || create_tracking_tables(pool)).await
}

async fn create_tracking_tables(pool: &DbPool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS _forge_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            checksum BYTEA NOT NULL,
            execution_time BIGINT NOT NULL,
            installed_on TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS _forge_migration_locks (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            is_locked BOOLEAN NOT NULL DEFAULT FALSE,
            locked_at TIMESTAMPTZ
        );
        INSERT INTO _forge_migration_locks (id, is_locked) VALUES (1, FALSE)
        ON CONFLICT (id) DO NOTHING;
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to create migration tracking tables"))?;

    Ok(())
}

/// Apply every pending migration from the default directory
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    run_migrations_from(pool, &get_migrations_dir()).await
}

/// Apply every pending migration found in `dir`, each in its own transaction
#[instrument(skip(pool), fields(dir = %dir.display()), name = "db_run_migrations")]
pub async fn run_migrations_from(pool: &DbPool, dir: &Path) -> Result<()> {
    info!("Starting database migration process");
    with_schema_lock(pool, || apply_pending(pool, dir)).await
}

async fn apply_pending(pool: &DbPool, dir: &Path) -> Result<()> {
    create_tracking_tables(pool).await?;
    if is_locked(pool).await? {
        return Err(ForgeError::validation(
            "Migrations are locked; run `forge-db db unlock` first",
        ));
    }

    let migrations = load_migrations_from(dir)?;
    let applied = get_applied_migration_versions(pool).await?;

    let mut migrations_run = 0;
    for migration in &migrations {
        if applied.contains(&migration.version) {
            continue;
        }

        info!(version = migration.version, "Running migration: {}", migration.description);
        let execution_time = apply_migration(pool, migration)
            .instrument(crate::db_span!("apply_migration", version = migration.version))
            .await?;

        migrations_run += 1;
        info!(
            version = migration.version,
            execution_time_ms = execution_time,
            "Migration completed: {}",
            migration.description
        );
    }

    if migrations_run > 0 {
        info!(count = migrations_run, "Database migrations completed");
    } else {
        info!("No pending migrations");
    }

    Ok(())
}

/// Run one up migration and record it, in a single transaction. Returns the run time in ms.
async fn apply_migration(pool: &DbPool, migration: &Migration) -> Result<i64> {
    let start_time = std::time::Instant::now();

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ForgeError::database(e, "Failed to start migration transaction"))?;

    sqlx::raw_sql(&migration.up_sql).execute(&mut *tx).await.map_err(|e| {
        error!(error = %e, version = migration.version, "Migration failed");
        ForgeError::database(
            e,
            format!("Migration failed: {}_{}", migration.version, migration.description),
        )
    })?;

    let execution_time = start_time.elapsed().as_millis() as i64;
    sqlx::query(
        "INSERT INTO _forge_migrations (version, description, checksum, execution_time, installed_on) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(migration.version)
    .bind(&migration.description)
    .bind(migration.checksum())
    .bind(execution_time)
    .bind(chrono::Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        ForgeError::database(e, format!("Failed to record migration {}", migration.version))
    })?;

    tx.commit()
        .await
        .map_err(|e| ForgeError::database(e, "Failed to commit migration transaction"))?;

    Ok(execution_time)
}

/// Roll back the most recently applied migration from the default directory
pub async fn rollback_last_migration(pool: &DbPool) -> Result<Option<i64>> {
    rollback_last_migration_from(pool, &get_migrations_dir()).await
}

/// Run the down migration of the latest applied version and remove its record.
///
/// Returns the rolled back version, or `None` when nothing is applied.
#[instrument(skip(pool), fields(dir = %dir.display()), name = "db_rollback_migration")]
pub async fn rollback_last_migration_from(pool: &DbPool, dir: &Path) -> Result<Option<i64>> {
    with_schema_lock(pool, || revert_latest(pool, dir)).await
}

async fn revert_latest(pool: &DbPool, dir: &Path) -> Result<Option<i64>> {
    create_tracking_tables(pool).await?;
    if is_locked(pool).await? {
        return Err(ForgeError::validation(
            "Migrations are locked; run `forge-db db unlock` first",
        ));
    }

    let Some(version) = get_applied_migration_versions(pool).await?.into_iter().max() else {
        info!("No applied migrations to roll back");
        return Ok(None);
    };

    let migrations = load_migrations_from(dir)?;
    let migration = migrations.iter().find(|m| m.version == version).ok_or_else(|| {
        ForgeError::validation(format!("Applied migration {} not found on disk", version))
    })?;
    let down_sql = migration.down_sql.as_deref().ok_or_else(|| {
        ForgeError::validation(format!("Migration {} has no down migration", version))
    })?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ForgeError::database(e, "Failed to start rollback transaction"))?;

    sqlx::raw_sql(down_sql).execute(&mut *tx).await.map_err(|e| {
        error!(error = %e, version, "Rollback failed");
        ForgeError::database(e, format!("Rollback failed for migration {}", version))
    })?;

    sqlx::query("DELETE FROM _forge_migrations WHERE version = $1")
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to remove migration {}", version)))?;

    tx.commit()
        .await
        .map_err(|e| ForgeError::database(e, "Failed to commit rollback transaction"))?;

    info!(version, "Rolled back migration: {}", migration.description);
    Ok(Some(version))
}

/// Lock migrations. Fails when they are already locked.
#[instrument(skip(pool), name = "db_lock_migrations")]
pub async fn lock_migrations(pool: &DbPool) -> Result<()> {
    init_migrations(pool).await?;

    let result = sqlx::query(
        "UPDATE _forge_migration_locks SET is_locked = TRUE, locked_at = $1 \
         WHERE id = 1 AND is_locked = FALSE",
    )
    .bind(chrono::Utc::now())
    .execute(pool)
    .await
    .map_err(|e| ForgeError::database(e, "Failed to lock migrations"))?;

    if result.rows_affected() == 0 {
        return Err(ForgeError::validation("Migrations are already locked"));
    }

    info!("Migrations locked");
    Ok(())
}

/// Unlock migrations. Unlocking an unlocked table is a no-op.
#[instrument(skip(pool), name = "db_unlock_migrations")]
pub async fn unlock_migrations(pool: &DbPool) -> Result<()> {
    init_migrations(pool).await?;

    sqlx::query("UPDATE _forge_migration_locks SET is_locked = FALSE, locked_at = NULL WHERE id = 1")
        .execute(pool)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to unlock migrations"))?;

    info!("Migrations unlocked");
    Ok(())
}

/// Whether migrations are currently locked
pub async fn is_locked(pool: &DbPool) -> Result<bool> {
    let locked = sqlx::query_scalar::<_, bool>(
        "SELECT is_locked FROM _forge_migration_locks WHERE id = 1",
    )
    .fetch_optional(pool)
    .await;

    match locked {
        Ok(locked) => Ok(locked.unwrap_or(false)),
        Err(e) if is_undefined_table(&e) => Ok(false),
        Err(e) => Err(ForgeError::database(e, "Failed to read migration lock")),
    }
}

async fn get_applied_migration_versions(pool: &DbPool) -> Result<Vec<i64>> {
    let rows = sqlx::query("SELECT version FROM _forge_migrations ORDER BY version")
        .fetch_all(pool)
        .await;

    match rows {
        Ok(rows) => Ok(rows.into_iter().map(|row| row.get::<i64, _>("version")).collect()),
        Err(e) if is_undefined_table(&e) => Ok(Vec::new()),
        Err(e) => Err(ForgeError::database(e, "Failed to get applied migrations")),
    }
}

fn is_undefined_table(e: &sqlx::Error) -> bool {
    e.as_database_error().and_then(|db| db.code()).as_deref() == Some(UNDEFINED_TABLE)
}

/// Extract the version from `<version>_<name>`
fn extract_version_from_filename(filename: &str) -> Result<i64> {
    let version_str = filename.split('_').next().ok_or_else(|| {
        ForgeError::validation(format!("Invalid migration filename: {}", filename))
    })?;

    version_str.parse::<i64>().map_err(|_| {
        ForgeError::validation(format!("Invalid version in filename: {}", filename))
    })
}

fn extract_description(filename: &str) -> String {
    filename.split_once('_').map(|(_, name)| name.to_string()).unwrap_or_default()
}

/// SHA-256 of the up migration
fn calculate_checksum(content: &str) -> Vec<u8> {
    Sha256::digest(content.as_bytes()).to_vec()
}

/// Check that applied migrations match the default directory
pub async fn validate_migrations(pool: &DbPool) -> Result<bool> {
    validate_migrations_from(pool, &get_migrations_dir()).await
}

/// Check for missing, unexpected or modified migrations
#[instrument(skip(pool), fields(dir = %dir.display()), name = "db_validate_migrations")]
pub async fn validate_migrations_from(pool: &DbPool, dir: &Path) -> Result<bool> {
    info!("Validating migration integrity");

    let migrations = load_migrations_from(dir)?;
    let applied = list_applied_migrations(pool).await?;
    let mut valid = true;

    for migration in &migrations {
        match applied.iter().find(|a| a.version == migration.version) {
            None => {
                warn!(version = migration.version, "Missing migration");
                valid = false;
            }
            Some(info) if info.checksum != migration.checksum() => {
                warn!(version = migration.version, "Migration checksum mismatch");
                valid = false;
            }
            Some(_) => {}
        }
    }

    for info in &applied {
        if !migrations.iter().any(|m| m.version == info.version) {
            warn!(version = info.version, "Unexpected migration found");
            valid = false;
        }
    }

    if valid {
        info!("Migration validation successful");
    }
    Ok(valid)
}

/// Highest applied version, `0` when none
pub async fn get_migration_version(pool: &DbPool) -> Result<i64> {
    let applied = get_applied_migration_versions(pool).await?;
    Ok(applied.into_iter().max().unwrap_or(0))
}

/// Applied migrations ordered by version
pub async fn list_applied_migrations(pool: &DbPool) -> Result<Vec<MigrationInfo>> {
    let query = format!(
        "SELECT version, description, checksum, execution_time, installed_on FROM {} ORDER BY version",
        MIGRATIONS_TABLE
    );
    let rows = sqlx::query(&query).fetch_all(pool).await;

    match rows {
        Ok(rows) => Ok(rows
            .into_iter()
            .map(|row| MigrationInfo {
                version: row.get("version"),
                description: row.get("description"),
                installed_on: row.get("installed_on"),
                execution_time: row.get("execution_time"),
                checksum: row.get("checksum"),
            })
            .collect()),
        Err(e) if is_undefined_table(&e) => Ok(Vec::new()),
        Err(e) => Err(ForgeError::database(e, "Failed to list applied migrations")),
    }
}

/// Every migration on disk with its applied record
pub async fn migration_status(pool: &DbPool, dir: &Path) -> Result<Vec<MigrationStatus>> {
    let migrations = load_migrations_from(dir)?;
    let mut applied = list_applied_migrations(pool).await?;

    Ok(migrations
        .into_iter()
        .map(|m| {
            let position = applied.iter().position(|a| a.version == m.version);
            MigrationStatus {
                version: m.version,
                description: m.description,
                applied: position.map(|i| applied.swap_remove(i)),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, sql: &str) {
        fs::write(dir.join(name), sql).unwrap();
    }

    #[test]
    fn test_extract_version_from_filename() {
        assert_eq!(
            extract_version_from_filename("20230101000002_create_site").unwrap(),
            20230101000002
        );
        assert!(extract_version_from_filename("invalid_filename").is_err());
        assert_eq!(extract_description("20230101000002_create_site"), "create_site");
    }

    #[test]
    fn test_calculate_checksum() {
        let a = calculate_checksum("CREATE TABLE test (id INTEGER);");
        let b = calculate_checksum("CREATE TABLE test (id INTEGER);");
        let c = calculate_checksum("CREATE TABLE other (id INTEGER);");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_load_pairs_up_and_down() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "2_second.up.sql", "CREATE TABLE b (id INT);");
        write(dir.path(), "1_first.up.sql", "CREATE TABLE a (id INT);");
        write(dir.path(), "1_first.down.sql", "DROP TABLE a;");
        write(dir.path(), "README.md", "ignored");

        let migrations = load_migrations_from(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[0].description, "first");
        assert_eq!(migrations[0].down_sql.as_deref(), Some("DROP TABLE a;"));
        assert_eq!(migrations[1].version, 2);
        assert!(migrations[1].down_sql.is_none());
    }

    #[test]
    fn test_load_rejects_orphan_down() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1_first.up.sql", "SELECT 1;");
        write(dir.path(), "2_second.down.sql", "SELECT 1;");

        assert!(load_migrations_from(dir.path()).is_err());
    }

    #[test]
    fn test_load_rejects_empty_and_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_migrations_from(dir.path()).is_err());
        assert!(load_migrations_from(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_bundled_migrations_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let migrations = load_migrations_from(&dir).unwrap();
        assert!(migrations.iter().all(|m| m.down_sql.is_some()));
        assert!(migrations.windows(2).all(|w| w[0].version < w[1].version));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres_tests {
        use super::*;
        use crate::storage::test_helpers::TestDatabase;

        #[tokio::test]
        async fn test_applied_migrations_validate() {
            let db = TestDatabase::new("migrations_validate").await;
            assert!(validate_migrations(&db.pool).await.unwrap());

            let bundled = load_migrations_from(&get_migrations_dir()).unwrap();
            let latest = bundled.last().unwrap().version;
            assert_eq!(get_migration_version(&db.pool).await.unwrap(), latest);
        }

        #[tokio::test]
        async fn test_rollback_and_reapply() {
            let db = TestDatabase::new("migrations_rollback").await;
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "1_widgets.up.sql", "CREATE TABLE widgets (id INT);");
            write(dir.path(), "1_widgets.down.sql", "DROP TABLE widgets;");

            // Tracking table already holds the bundled versions, so use a fresh schema
            sqlx::query("DELETE FROM _forge_migrations").execute(&db.pool).await.unwrap();

            run_migrations_from(&db.pool, dir.path()).await.unwrap();
            assert_eq!(get_migration_version(&db.pool).await.unwrap(), 1);

            let rolled_back = rollback_last_migration_from(&db.pool, dir.path()).await.unwrap();
            assert_eq!(rolled_back, Some(1));
            assert_eq!(get_migration_version(&db.pool).await.unwrap(), 0);

            let exists: bool = sqlx::query_scalar("SELECT to_regclass('widgets') IS NOT NULL")
                .fetch_one(&db.pool)
                .await
                .unwrap();
            assert!(!exists);

            assert_eq!(rollback_last_migration_from(&db.pool, dir.path()).await.unwrap(), None);
        }

        async fn advisory_locks_held(pool: &DbPool) -> i64 {
            sqlx::query_scalar("SELECT COUNT(*) FROM pg_locks WHERE locktype = 'advisory'")
                .fetch_one(pool)
                .await
                .unwrap()
        }

        #[tokio::test]
        async fn test_concurrent_runs_take_turns() {
            let db = TestDatabase::unmigrated("migrations_concurrent").await;
            let other = db.connect().await;

            let (a, b) = tokio::join!(run_migrations(&db.pool), run_migrations(&other));
            a.unwrap();
            b.unwrap();

            assert!(validate_migrations(&db.pool).await.unwrap());
            assert_eq!(advisory_locks_held(&db.pool).await, 0);
        }

        #[tokio::test]
        async fn test_failed_run_releases_schema_lock() {
            let db = TestDatabase::unmigrated("migrations_failed_release").await;
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "1_broken.up.sql", "CREATE TABLE broken (;");

            assert!(run_migrations_from(&db.pool, dir.path()).await.is_err());
            assert_eq!(advisory_locks_held(&db.pool).await, 0);

            write(dir.path(), "1_broken.up.sql", "CREATE TABLE fixed (id INT);");
            run_migrations_from(&db.pool, dir.path()).await.unwrap();
            assert_eq!(get_migration_version(&db.pool).await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_lock_blocks_migrate() {
            let db = TestDatabase::new("migrations_lock").await;

            lock_migrations(&db.pool).await.unwrap();
            assert!(is_locked(&db.pool).await.unwrap());
            assert!(lock_migrations(&db.pool).await.is_err());
            assert!(run_migrations(&db.pool).await.is_err());

            unlock_migrations(&db.pool).await.unwrap();
            assert!(!is_locked(&db.pool).await.unwrap());
            run_migrations(&db.pool).await.unwrap();
        }
    }
}
