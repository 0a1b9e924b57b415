//! # Command Line Interface
//!
//! Schema management for the Forge database: `forge-db db <command>`.

use crate::config::{AppConfig, DatabaseConfig};
use crate::observability::{init_observability, log_config_info};
use crate::storage::migrations::{
    get_migrations_dir, is_locked, migration_status, MigrationStatus,
};
use crate::storage::{
    create_pool, get_migration_version, init_migrations, list_applied_migrations,
    lock_migrations, rollback_last_migration, run_migrations, unlock_migrations,
    validate_migrations,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "forge-db")]
#[command(about = "Forge database schema tooling")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database URL override. Falls back to DATABASE_URL, then the PG* variables.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Configuration file (defaults to forge-db.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Database management commands
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbCommands {
    /// Create the migration tracking and lock tables
    Init,

    /// Apply pending migrations
    Migrate {
        /// Only list the migrations that would be applied
        #[arg(long)]
        dry_run: bool,
    },

    /// Create the tracking tables, then apply pending migrations
    InitMigrate,

    /// Revert the most recently applied migration
    Rollback,

    /// Lock migrations so migrate and rollback refuse to run
    Lock,

    /// Release the migration lock
    Unlock,

    /// Show every migration and whether it has been applied
    Status,

    /// Check applied migrations against the files on disk
    Validate,
}

/// Parse arguments and run the selected command
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut app_config = AppConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        app_config.observability.log_level = "debug".to_string();
    }
    let guard = init_observability(&app_config.observability)?;
    log_config_info(&app_config);

    let database =
        resolve_database_config(cli.database_url, app_config.database, |key| std::env::var(key).ok())?;

    let result = match cli.command {
        Commands::Db { command } => handle_db_command(command, &database).await,
    };

    guard.shutdown();
    result
}

/// Pick the connection URL: the command line flag, then `DATABASE_URL`, then the
/// `PG*` variables when `PGUSER` is set, and finally the loaded configuration.
/// Pool settings always come from the loaded configuration.
pub(crate) fn resolve_database_config<F>(
    flag: Option<String>,
    base: DatabaseConfig,
    var: F,
) -> anyhow::Result<DatabaseConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = flag.or_else(|| var("DATABASE_URL")).filter(|u| !u.is_empty()) {
        return Ok(DatabaseConfig { url, ..base });
    }

    if var("PGUSER").is_some_and(|u| !u.is_empty()) {
        let from_env = DatabaseConfig::from_pg_vars(var)
            .context("Failed to build database URL from PG* variables")?;
        return Ok(DatabaseConfig { url: from_env.url, ..base });
    }

    Ok(base)
}

async fn handle_db_command(command: DbCommands, config: &DatabaseConfig) -> anyhow::Result<()> {
    let pool = create_pool(config).await?;
    info!(?command, "Running database command");

    match command {
        DbCommands::Init => {
            init_migrations(&pool).await?;
            println!("Migration tables initialized");
        }

        DbCommands::Migrate { dry_run: true } => {
            let pending: Vec<MigrationStatus> = migration_status(&pool, &get_migrations_dir())
                .await?
                .into_iter()
                .filter(|m| m.applied.is_none())
                .collect();
            if pending.is_empty() {
                println!("No pending migrations");
            } else {
                println!("Pending migrations:");
                for migration in &pending {
                    println!("  {} {}", migration.version, migration.description);
                }
            }
        }

        DbCommands::Migrate { dry_run: false } => {
            run_migrations(&pool).await?;
            println!("Database is at version {}", get_migration_version(&pool).await?);
        }

        DbCommands::InitMigrate => {
            init_migrations(&pool).await?;
            run_migrations(&pool).await?;
            println!("Database is at version {}", get_migration_version(&pool).await?);
        }

        DbCommands::Rollback => match rollback_last_migration(&pool).await? {
            Some(version) => println!("Rolled back migration {}", version),
            None => println!("No migrations to roll back"),
        },

        DbCommands::Lock => {
            lock_migrations(&pool).await?;
            println!("Migrations locked");
        }

        DbCommands::Unlock => {
            unlock_migrations(&pool).await?;
            println!("Migrations unlocked");
        }

        DbCommands::Status => {
            let statuses = migration_status(&pool, &get_migrations_dir()).await?;
            print_status_table(&statuses);

            let unknown = list_applied_migrations(&pool)
                .await?
                .into_iter()
                .filter(|applied| statuses.iter().all(|s| s.version != applied.version))
                .count();
            if unknown > 0 {
                println!("{} applied migration(s) have no file on disk", unknown);
            }
            println!("Locked: {}", if is_locked(&pool).await? { "yes" } else { "no" });
        }

        DbCommands::Validate => {
            if validate_migrations(&pool).await? {
                println!("Database schema validation passed");
            } else {
                anyhow::bail!("Database schema validation failed");
            }
        }
    }

    Ok(())
}

fn print_status_table(statuses: &[MigrationStatus]) {
    if statuses.is_empty() {
        println!("No migrations found in {}", get_migrations_dir().display());
        return;
    }

    println!("{:<16} {:<40} {:<8} {:<20}", "Version", "Description", "Applied", "Installed On");
    println!("{}", "-".repeat(86));
    for status in statuses {
        let (applied, installed_on) = match &status.applied {
            Some(info) => ("yes", info.installed_on.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => ("no", String::new()),
        };
        println!(
            "{:<16} {:<40} {:<8} {:<20}",
            status.version, status.description, applied, installed_on
        );
    }
}
