use crate::database::Result;
use crate::models::{DomainName, DomainStatus, Service, Vhost};

use super::Store;

const DOMAIN_COLUMNS: &str = "id, vhost_id, name, status, requested_at, updated_at";

impl Store {
    // ========================================================================
    // Vhosts
    // ========================================================================

    /// Get the vhost called `name` on a service, creating it if needed.
    pub async fn ensure_vhost(&self, service_id: i64, name: &str) -> Result<Vhost> {
        sqlx::query("INSERT OR IGNORE INTO vhosts (service_id, name) VALUES (?, ?)")
            .bind(service_id)
            .bind(name)
            .execute(self.db.pool())
            .await?;

        let vhost = sqlx::query_as::<_, Vhost>(
            "SELECT id, service_id, name, main_domain_id FROM vhosts WHERE service_id = ? AND name = ?",
        )
        .bind(service_id)
        .bind(name)
        .fetch_one(self.db.pool())
        .await?;
        Ok(vhost)
    }

    pub async fn set_main_domain(&self, vhost_id: i64, domain_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE vhosts SET main_domain_id = ? WHERE id = ?")
            .bind(domain_id)
            .bind(vhost_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Domain names
    // ========================================================================

    /// Get the domain called `name`, creating it on `vhost_id` if needed.
    pub async fn ensure_domain(
        &self,
        vhost_id: i64,
        name: &str,
        status: DomainStatus,
        now: &str,
    ) -> Result<DomainName> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO domain_names (vhost_id, name, status, requested_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(vhost_id)
        .bind(name)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        let domain = sqlx::query_as::<_, DomainName>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domain_names WHERE name = ?"
        ))
        .bind(name)
        .fetch_one(self.db.pool())
        .await?;
        Ok(domain)
    }

    pub async fn domain(&self, id: i64) -> Result<Option<DomainName>> {
        let domain = sqlx::query_as::<_, DomainName>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domain_names WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(domain)
    }

    pub async fn domains_with_status(&self, statuses: &[DomainStatus]) -> Result<Vec<DomainName>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {DOMAIN_COLUMNS} FROM domain_names WHERE status IN ({placeholders}) ORDER BY id"
        );

        let mut query = sqlx::query_as::<_, DomainName>(&sql);
        for status in statuses {
            query = query.bind(*status);
        }
        let domains = query.fetch_all(self.db.pool()).await?;
        Ok(domains)
    }

    /// Requested domains whose request is older than `cutoff`.
    pub async fn stale_domain_requests(&self, cutoff: &str) -> Result<Vec<DomainName>> {
        let domains = sqlx::query_as::<_, DomainName>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domain_names WHERE status = ? AND requested_at < ? ORDER BY id"
        ))
        .bind(DomainStatus::Requested)
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;
        Ok(domains)
    }

    /// Change a domain's status. `updated_at` is stamped only when the status
    /// actually changes. Returns whether it did.
    pub async fn set_domain_status(&self, id: i64, status: DomainStatus, now: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE domain_names SET status = ?, updated_at = ? WHERE id = ? AND status != ?",
        )
        .bind(status)
        .bind(now)
        .bind(id)
        .bind(status)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remove a domain, clearing any vhost that used it as main domain.
    pub async fn purge_domain(&self, id: i64) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("UPDATE vhosts SET main_domain_id = NULL WHERE main_domain_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM domain_names WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() == 1)
    }

    /// Service a domain is served by.
    pub async fn service_of_domain(&self, domain_id: i64) -> Result<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(
            r#"
            SELECT s.id, s.site_id, s.role, s.status, s.network_config_id
            FROM services s
            JOIN vhosts v ON v.service_id = s.id
            JOIN domain_names d ON d.vhost_id = v.id
            WHERE d.id = ?
            "#,
        )
        .bind(domain_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(service)
    }

    pub async fn vhost(&self, id: i64) -> Result<Option<Vhost>> {
        let vhost = sqlx::query_as::<_, Vhost>(
            "SELECT id, service_id, name, main_domain_id FROM vhosts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(vhost)
    }
}
