//! # forge-db
//!
//! PostgreSQL data access layer for the Forge infrastructure management API.
//!
//! One repository per table (providers, tenants, sites, VPCs, VPC prefixes, IP
//! blocks, subnets, domains, network security groups, allocations and their
//! constraints, instance types, operating systems, machines and machine interfaces,
//! instances, interfaces, SSH keys and key groups, DPU extension services and status
//! history). Every repository method runs in its own tracing
//! span and accepts an optional [`storage::Tx`] so callers can compose several
//! calls into one transaction.
//!
//! ```rust,no_run
//! use forge_db::config::DatabaseConfig;
//! use forge_db::storage::repositories::{SiteRepository, SqlxSiteRepository};
//! use forge_db::storage::{create_pool, PageInput};
//!
//! # async fn example() -> forge_db::Result<()> {
//! let pool = create_pool(&DatabaseConfig::from_pg_env()?).await?;
//! let sites = SqlxSiteRepository::new(pool);
//! let (page, total) = sites.get_all(None, &Default::default(), &PageInput::default(), &[]).await?;
//! # let _ = (page, total);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod storage;

pub use config::AppConfig;
pub use errors::{ForgeError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
