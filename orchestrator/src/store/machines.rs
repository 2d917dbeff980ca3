use crate::database::{DatabaseError, Result};
use crate::models::{Service, ServiceRole, ServiceStatus, VirtualMachine, VmStatus};

use super::Store;

const VM_COLUMNS: &str =
    "id, service_id, name, status, numcpu, sizeram, token, cluster_id, network_config_id";

/// Attempts before a compare-and-set on a service status gives up.
const CAS_ATTEMPTS: usize = 3;

/// Outcome of a status compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: ServiceStatus },
    /// The transition table does not allow leaving `from` this way.
    Rejected { from: ServiceStatus },
}

/// A VM the backup audit expects to see in last night's report.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BackupCandidate {
    pub vm_id: i64,
    pub vm_name: Option<String>,
    pub site_id: i64,
}

impl Store {
    // ========================================================================
    // Services
    // ========================================================================

    pub async fn insert_service(
        &self,
        site_id: i64,
        role: ServiceRole,
        network_config_id: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO services (site_id, role, status, network_config_id) VALUES (?, ?, ?, ?)",
        )
        .bind(site_id)
        .bind(role)
        .bind(ServiceStatus::Requested)
        .bind(network_config_id)
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn service(&self, id: i64) -> Result<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(
            "SELECT id, site_id, role, status, network_config_id FROM services WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(service)
    }

    pub async fn service_by_role(&self, site_id: i64, role: ServiceRole) -> Result<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(
            r#"
            SELECT id, site_id, role, status, network_config_id
            FROM services WHERE site_id = ? AND role = ?
            "#,
        )
        .bind(site_id)
        .bind(role)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(service)
    }

    /// Move a service to `to` if the transition table allows it.
    ///
    /// The update only applies if the status is still the one that was read,
    /// so a concurrent change makes this re-read and re-check. Every applied
    /// transition is appended to `service_status_log` in the same transaction.
    pub async fn transition_service(
        &self,
        service_id: i64,
        to: ServiceStatus,
        now: &str,
    ) -> Result<Transition> {
        self.transition_service_if(service_id, to, now, |from| from.can_transition(to))
            .await
    }

    /// Like [`Self::transition_service`], but only out of one of `sources`.
    pub async fn transition_service_from(
        &self,
        service_id: i64,
        sources: &[ServiceStatus],
        to: ServiceStatus,
        now: &str,
    ) -> Result<Transition> {
        self.transition_service_if(service_id, to, now, |from| {
            sources.contains(&from) && from.can_transition(to)
        })
        .await
    }

    async fn transition_service_if(
        &self,
        service_id: i64,
        to: ServiceStatus,
        now: &str,
        allowed: impl Fn(ServiceStatus) -> bool,
    ) -> Result<Transition> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self
                .service(service_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound(format!("Service {}", service_id)))?;

            if !allowed(current.status) {
                return Ok(Transition::Rejected {
                    from: current.status,
                });
            }

            let mut tx = self.db.pool().begin().await?;

            let updated = sqlx::query("UPDATE services SET status = ? WHERE id = ? AND status = ?")
                .bind(to)
                .bind(service_id)
                .bind(current.status)
                .execute(&mut *tx)
                .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO service_status_log (service_id, from_status, to_status, at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(service_id)
            .bind(current.status)
            .bind(to)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(Transition::Applied {
                from: current.status,
            });
        }

        Err(DatabaseError::InvalidData(format!(
            "Service {} status kept changing under us",
            service_id
        )))
    }

    /// Every status the service has been in, oldest first.
    pub async fn status_history(&self, service_id: i64) -> Result<Vec<ServiceStatus>> {
        let rows = sqlx::query_as::<_, (ServiceStatus, ServiceStatus)>(
            "SELECT from_status, to_status FROM service_status_log WHERE service_id = ? ORDER BY id",
        )
        .bind(service_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut history = Vec::with_capacity(rows.len() + 1);
        if let Some((first, _)) = rows.first() {
            history.push(*first);
        }
        history.extend(rows.iter().map(|(_, to)| *to));
        Ok(history)
    }

    /// Test services that currently have a VM.
    pub async fn count_active_test_services(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM services s
            JOIN virtual_machines v ON v.service_id = s.id
            WHERE s.role = ?
            "#,
        )
        .bind(ServiceRole::Test)
        .fetch_one(self.db.pool())
        .await?;
        Ok(count)
    }

    // ========================================================================
    // Virtual machines
    // ========================================================================

    pub async fn insert_vm(
        &self,
        service_id: i64,
        numcpu: i64,
        sizeram: i64,
        token: &str,
        cluster_id: i64,
        network_config_id: i64,
    ) -> Result<VirtualMachine> {
        let vm = sqlx::query_as::<_, VirtualMachine>(&format!(
            r#"
            INSERT INTO virtual_machines
                (service_id, status, numcpu, sizeram, token, cluster_id, network_config_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {VM_COLUMNS}
            "#
        ))
        .bind(service_id)
        .bind(VmStatus::Requested)
        .bind(numcpu)
        .bind(sizeram)
        .bind(token)
        .bind(cluster_id)
        .bind(network_config_id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(vm)
    }

    pub async fn vm(&self, id: i64) -> Result<Option<VirtualMachine>> {
        let vm = sqlx::query_as::<_, VirtualMachine>(&format!(
            "SELECT {VM_COLUMNS} FROM virtual_machines WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(vm)
    }

    pub async fn vm_for_service(&self, service_id: i64) -> Result<Option<VirtualMachine>> {
        let vm = sqlx::query_as::<_, VirtualMachine>(&format!(
            "SELECT {VM_COLUMNS} FROM virtual_machines WHERE service_id = ?"
        ))
        .bind(service_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(vm)
    }

    pub async fn vms_of_site(&self, site_id: i64) -> Result<Vec<VirtualMachine>> {
        let vms = sqlx::query_as::<_, VirtualMachine>(&format!(
            r#"
            SELECT {VM_COLUMNS} FROM virtual_machines
            WHERE service_id IN (SELECT id FROM services WHERE site_id = ?)
            ORDER BY id
            "#
        ))
        .bind(site_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(vms)
    }

    pub async fn set_vm_name(&self, id: i64, name: &str) -> Result<()> {
        sqlx::query("UPDATE virtual_machines SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn set_vm_status(&self, id: i64, status: VmStatus) -> Result<()> {
        sqlx::query("UPDATE virtual_machines SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Move a VM from `from` to `to`. Returns false if it was elsewhere.
    pub async fn advance_vm_status(&self, id: i64, from: VmStatus, to: VmStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE virtual_machines SET status = ? WHERE id = ? AND status = ?")
            .bind(to)
            .bind(id)
            .bind(from)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_vm(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM virtual_machines WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// VMs of live, enabled sites that started before `yesterday` and whose
    /// service has reached configuration.
    pub async fn backup_candidates(&self, yesterday: &str, today: &str) -> Result<Vec<BackupCandidate>> {
        let candidates = sqlx::query_as::<_, BackupCandidate>(
            r#"
            SELECT v.id AS vm_id, v.name AS vm_name, s.site_id AS site_id
            FROM virtual_machines v
            JOIN services s ON v.service_id = s.id
            JOIN sites t ON s.site_id = t.id
            WHERE t.deleted = 0
              AND t.disabled = 0
              AND t.start_date IS NOT NULL
              AND t.start_date < ?
              AND (t.end_date IS NULL OR t.end_date > ?)
              AND s.status IN (?, ?, ?)
            ORDER BY v.id
            "#,
        )
        .bind(yesterday)
        .bind(today)
        .bind(ServiceStatus::Ansible)
        .bind(ServiceStatus::AnsibleQueued)
        .bind(ServiceStatus::Ready)
        .fetch_all(self.db.pool())
        .await?;
        Ok(candidates)
    }
}
