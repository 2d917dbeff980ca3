//! Database Infrastructure Layer
//!
//! Connection setup, schema initialisation and the timestamp format shared
//! by every table. No business logic lives here.

use std::{ops::Deref, str::FromStr, time::Duration};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum DatabaseError {
    Connection(sqlx::Error),
    Query(sqlx::Error),
    InvalidData(String),
    NotFound(String),
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseError::Connection(err) => write!(f, "Database connection error: {}", err),
            DatabaseError::Query(err) => write!(f, "Database query error: {}", err),
            DatabaseError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            DatabaseError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DatabaseError::Connection(err) | DatabaseError::Query(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::Query(err)
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

// ============================================================================
// Timestamps
// ============================================================================

/// Same shape as SQLite's `CURRENT_TIMESTAMP`, so stored values compare
/// lexicographically.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::InvalidData(format!("bad timestamp {value:?}: {e}")))
}

pub fn date(day: NaiveDate) -> String {
    day.format(DATE_FORMAT).to_string()
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Deref for Database {
    type Target = SqlitePool;
    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let database_config = SqliteConnectOptions::from_str(database_url)
            .map_err(DatabaseError::Connection)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_lazy_with(database_config);

        let db = Self { pool };
        db.initialize_tables().await?;

        info!(database = database_url, "Database initialized");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_tables(&self) -> Result<()> {
        // Pool of pre-registered addresses. `claimed_at` is set exactly once.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role TEXT NOT NULL,
                ipv4 TEXT NOT NULL UNIQUE,
                ipv6 TEXT UNIQUE,
                sshfp TEXT,
                hostname TEXT NOT NULL UNIQUE,
                ipv4_private TEXT UNIQUE,
                private_hostname TEXT UNIQUE,
                claimed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS server_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                numcpu INTEGER NOT NULL,
                sizeram INTEGER NOT NULL,
                sizedisk INTEGER NOT NULL,
                preallocated INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id INTEGER NOT NULL REFERENCES clusters(id),
                hostname TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                email TEXT,
                server_type_id INTEGER NOT NULL REFERENCES server_types(id),
                start_date TEXT,
                end_date TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                suspended INTEGER NOT NULL DEFAULT 0,
                preallocated INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id INTEGER NOT NULL REFERENCES sites(id),
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'requested',
                network_config_id INTEGER REFERENCES network_configs(id),
                UNIQUE(site_id, role)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_status_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id INTEGER NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS virtual_machines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id INTEGER NOT NULL UNIQUE REFERENCES services(id),
                name TEXT,
                status TEXT NOT NULL DEFAULT 'requested',
                numcpu INTEGER NOT NULL,
                sizeram INTEGER NOT NULL,
                token TEXT NOT NULL,
                cluster_id INTEGER NOT NULL REFERENCES clusters(id),
                network_config_id INTEGER NOT NULL REFERENCES network_configs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_settings (
                service_id INTEGER NOT NULL REFERENCES services(id),
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (service_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_packages (
                service_id INTEGER NOT NULL REFERENCES services(id),
                package TEXT NOT NULL,
                PRIMARY KEY (service_id, package)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS site_keys (
                site_id INTEGER NOT NULL REFERENCES sites(id),
                key_type TEXT NOT NULL,
                public_key TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                PRIMARY KEY (site_id, key_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // main_domain_id is not declared as a foreign key: vhosts and
        // domain_names reference each other.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vhosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id INTEGER NOT NULL REFERENCES services(id),
                name TEXT NOT NULL,
                main_domain_id INTEGER,
                UNIQUE(service_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domain_names (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vhost_id INTEGER NOT NULL REFERENCES vhosts(id),
                name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'requested',
                requested_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upgrade_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id INTEGER NOT NULL UNIQUE REFERENCES sites(id),
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff_secs INTEGER NOT NULL,
                run_at TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                started_at TEXT,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operation_locks (
                vm_id INTEGER NOT NULL,
                operation TEXT NOT NULL,
                argument TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (vm_id, operation, argument)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes for performance
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_network_configs_free ON network_configs(role, claimed_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status_run_at ON tasks(status, run_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_domain_names_status ON domain_names(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_status_log_service ON service_status_log(service_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_round_trip_at_second_precision() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(timestamp(at), "2024-03-09 07:05:01");
        assert_eq!(parse_timestamp("2024-03-09 07:05:01").unwrap(), at);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn schema_initialisation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("mws.db").display());

        let first = Database::new(&url).await.unwrap();
        first.close().await;
        let second = Database::new(&url).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(second.pool())
        .await
        .unwrap();
        assert_eq!(tables, 16);
    }
}
