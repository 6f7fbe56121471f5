//! Storage layer for the ThreatNet coordinator.
//!
//! This module provides database operations for:
//! - IOCs (deduplicated indicators with lifecycle state)
//! - IOC reports (per-reporter provenance)
//! - Trust scores and the append-only trust event log
//! - Schema version tracking (`meta` table)

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod ioc;
pub mod trust;

/// Schema version this binary understands.
pub const SCHEMA_VERSION: u32 = 1;

/// Database storage for the coordinator.
///
/// Provides async access to a SQLite database with connection pooling.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    ///
    /// This will create the database file if it doesn't exist; call
    /// [`Storage::run_migrations`] before first use.
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let max_conn = max_connections.unwrap_or(5);
        let min_conn = min_connections.unwrap_or(1);

        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_conn)
            .min_connections(min_conn)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Create a new storage instance with a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(
        path: P,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let database_url = format!("sqlite://{}", path.display());
        Self::new(&database_url, max_connections, min_connections).await
    }

    /// Run database migrations.
    ///
    /// This should be called once during initialization to ensure the schema
    /// is up to date. A fresh database is initialized; an older schema is
    /// migrated forward.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        self.check_schema_version().await?;

        info!("Migrations completed successfully");

        Ok(())
    }

    /// Verify the persisted schema version is one this binary can serve.
    ///
    /// A database written by a newer coordinator is refused rather than
    /// silently misread.
    pub async fn check_schema_version(&self) -> Result<()> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read schema_version")?;

        let Some(version) = version else {
            anyhow::bail!("meta table missing schema_version row (run migrations?)");
        };

        let version: u32 = version
            .parse()
            .with_context(|| format!("Invalid schema_version value: {}", version))?;

        if version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}",
                version,
                SCHEMA_VERSION
            );
        }

        Ok(())
    }

    /// Get a reference to the connection pool.
    ///
    /// This is useful for custom queries or transactions.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    /// Get database statistics for the status endpoint.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let total_iocs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM iocs")
            .fetch_one(&self.pool)
            .await?;

        let verified_iocs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM iocs WHERE status = 'verified'")
                .fetch_one(&self.pool)
                .await?;

        let pending_iocs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM iocs WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        let expired_iocs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM iocs WHERE status = 'expired'")
                .fetch_one(&self.pool)
                .await?;

        let total_clients: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trust_scores")
            .fetch_one(&self.pool)
            .await?;

        let average_trust: Option<f64> = sqlx::query_scalar("SELECT AVG(value) FROM trust_scores")
            .fetch_one(&self.pool)
            .await?;

        Ok(DatabaseStats {
            total_iocs: total_iocs as u64,
            verified_iocs: verified_iocs as u64,
            pending_iocs: pending_iocs as u64,
            expired_iocs: expired_iocs as u64,
            total_clients: total_clients as u64,
            average_trust: average_trust.unwrap_or(0.0),
        })
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        Ok(())
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseStats {
    /// Total number of IOC rows.
    pub total_iocs: u64,

    /// Verified IOCs.
    pub verified_iocs: u64,

    /// Pending IOCs.
    pub pending_iocs: u64,

    /// Expired IOCs.
    pub expired_iocs: u64,

    /// Known clients (trust rows).
    pub total_clients: u64,

    /// Mean trust across all known clients (0.0 when none).
    pub average_trust: f64,
}
