//! Durable store
//!
//! Typed accessors over the SQLite tables. Lookups return `Option` and
//! leave it to callers to decide whether absence is an error.
//!
//! The accessors are split by concern:
//! - `sites`: server types, sites, the upgrade queue
//! - `machines`: services, their status log and virtual machines
//! - `domains`: vhosts and domain names
//!
//! Clusters, settings, packages and site keys live here.

mod domains;
mod machines;
mod sites;

pub use machines::{BackupCandidate, Transition};

use crate::database::{Database, Result};
use crate::models::{Cluster, Host, SiteKey};

#[derive(Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Clusters
    // ========================================================================

    pub async fn insert_cluster(&self, name: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO clusters (name) VALUES (?)")
            .bind(name)
            .execute(self.db.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_host(&self, cluster_id: i64, hostname: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO hosts (cluster_id, hostname) VALUES (?, ?)")
            .bind(cluster_id)
            .bind(hostname)
            .execute(self.db.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Cluster new VMs are placed on. There is only ever one in practice.
    pub async fn first_cluster(&self) -> Result<Option<Cluster>> {
        let cluster = sqlx::query_as::<_, Cluster>("SELECT id, name FROM clusters ORDER BY id LIMIT 1")
            .fetch_optional(self.db.pool())
            .await?;
        Ok(cluster)
    }

    /// Host VM API commands for a cluster are sent to.
    pub async fn first_host(&self, cluster_id: i64) -> Result<Option<Host>> {
        let host = sqlx::query_as::<_, Host>(
            "SELECT id, cluster_id, hostname FROM hosts WHERE cluster_id = ? ORDER BY id LIMIT 1",
        )
        .bind(cluster_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(host)
    }

    // ========================================================================
    // Service settings and packages
    // ========================================================================

    pub async fn set_setting(&self, service_id: i64, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_settings (service_id, key, value) VALUES (?, ?, ?)
            ON CONFLICT(service_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(service_id)
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn setting(&self, service_id: i64, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM service_settings WHERE service_id = ? AND key = ?",
        )
        .bind(service_id)
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(value)
    }

    pub async fn add_package(&self, service_id: i64, package: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO service_packages (service_id, package) VALUES (?, ?)")
            .bind(service_id)
            .bind(package)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn packages(&self, service_id: i64) -> Result<Vec<String>> {
        let packages = sqlx::query_scalar::<_, String>(
            "SELECT package FROM service_packages WHERE service_id = ? ORDER BY package",
        )
        .bind(service_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(packages)
    }

    /// Add every package of `from` to `to`. Returns how many were new.
    pub async fn copy_packages(&self, from: i64, to: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO service_packages (service_id, package)
            SELECT ?, package FROM service_packages WHERE service_id = ?
            "#,
        )
        .bind(to)
        .bind(from)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Site keys
    // ========================================================================

    pub async fn site_key(&self, site_id: i64, key_type: &str) -> Result<Option<SiteKey>> {
        let key = sqlx::query_as::<_, SiteKey>(
            r#"
            SELECT site_id, key_type, public_key, fingerprint
            FROM site_keys WHERE site_id = ? AND key_type = ?
            "#,
        )
        .bind(site_id)
        .bind(key_type)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(key)
    }

    /// Record a host key unless one of this type is already known.
    pub async fn insert_site_key(&self, key: &SiteKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO site_keys (site_id, key_type, public_key, fingerprint)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(key.site_id)
        .bind(&key.key_type)
        .bind(&key.public_key)
        .bind(&key.fingerprint)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
