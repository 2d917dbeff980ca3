use crate::database::Result;
use crate::models::{NewSite, QueueEntry, ServerType, ServiceRole, ServiceStatus, Site};

use super::Store;

const SITE_COLUMNS: &str = "id, name, description, email, server_type_id, start_date, end_date, \
                            deleted, disabled, suspended, preallocated";

impl Store {
    // ========================================================================
    // Server types
    // ========================================================================

    pub async fn insert_server_type(
        &self,
        name: &str,
        numcpu: i64,
        sizeram: i64,
        sizedisk: i64,
        preallocated: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO server_types (name, numcpu, sizeram, sizedisk, preallocated)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(numcpu)
        .bind(sizeram)
        .bind(sizedisk)
        .bind(preallocated)
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn server_types(&self) -> Result<Vec<ServerType>> {
        let types = sqlx::query_as::<_, ServerType>(
            "SELECT id, name, numcpu, sizeram, sizedisk, preallocated FROM server_types ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(types)
    }

    pub async fn server_type(&self, id: i64) -> Result<Option<ServerType>> {
        let server_type = sqlx::query_as::<_, ServerType>(
            "SELECT id, name, numcpu, sizeram, sizedisk, preallocated FROM server_types WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(server_type)
    }

    // ========================================================================
    // Sites
    // ========================================================================

    pub async fn insert_site(&self, site: &NewSite) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sites (name, description, email, server_type_id, start_date, preallocated)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&site.name)
        .bind(&site.description)
        .bind(&site.email)
        .bind(site.server_type_id)
        .bind(&site.start_date)
        .bind(site.preallocated)
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert a site with its production and test services in one
    /// transaction. Returns `(site_id, production_service_id)`.
    pub async fn insert_site_with_services(
        &self,
        site: &NewSite,
        production_config_id: i64,
        test_config_id: i64,
    ) -> Result<(i64, i64)> {
        let mut tx = self.db.pool().begin().await?;

        let site_id = sqlx::query(
            r#"
            INSERT INTO sites (name, description, email, server_type_id, start_date, preallocated)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&site.name)
        .bind(&site.description)
        .bind(&site.email)
        .bind(site.server_type_id)
        .bind(&site.start_date)
        .bind(site.preallocated)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut production_id = 0;
        for (role, config_id) in [
            (ServiceRole::Production, production_config_id),
            (ServiceRole::Test, test_config_id),
        ] {
            let id = sqlx::query(
                "INSERT INTO services (site_id, role, status, network_config_id) VALUES (?, ?, ?, ?)",
            )
            .bind(site_id)
            .bind(role)
            .bind(ServiceStatus::Requested)
            .bind(config_id)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            if role == ServiceRole::Production {
                production_id = id;
            }
        }

        tx.commit().await?;
        Ok((site_id, production_id))
    }

    pub async fn site(&self, id: i64) -> Result<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(site)
    }

    pub async fn count_preallocated_sites(&self, server_type_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sites WHERE preallocated = 1 AND server_type_id = ?",
        )
        .bind(server_type_id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(count)
    }

    /// Hand a preallocated site to its owner.
    pub async fn assign_site(
        &self,
        id: i64,
        name: &str,
        email: &str,
        description: Option<&str>,
        start_date: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sites
            SET name = ?, email = ?, description = ?, start_date = ?, preallocated = 0
            WHERE id = ? AND preallocated = 1
            "#,
        )
        .bind(name)
        .bind(email)
        .bind(description)
        .bind(start_date)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Set the end date unless the site is already cancelled.
    pub async fn cancel_site(&self, id: i64, end_date: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE sites SET end_date = ? WHERE id = ? AND end_date IS NULL")
            .bind(end_date)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_site_disabled(&self, id: i64, disabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE sites SET disabled = ? WHERE id = ? AND disabled != ?")
            .bind(disabled)
            .bind(id)
            .bind(disabled)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Upgrade queue
    // ========================================================================

    /// Returns false if the site is already waiting.
    pub async fn enqueue_upgrade(&self, site_id: i64, now: &str) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO upgrade_queue (site_id, created_at) VALUES (?, ?)")
                .bind(site_id)
                .bind(now)
                .execute(self.db.pool())
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Waiting list, oldest first.
    pub async fn upgrade_queue(&self) -> Result<Vec<QueueEntry>> {
        let entries = sqlx::query_as::<_, QueueEntry>(
            "SELECT id, site_id, created_at FROM upgrade_queue ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(entries)
    }

    pub async fn remove_queue_entry(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM upgrade_queue WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
