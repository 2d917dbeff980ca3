//! Scheduled Reconciliation Jobs
//!
//! Each sweep takes the current time, processes every entity on its own and
//! returns a report. A failure on one entity is logged and the sweep moves
//! on; only a failure to list the entities aborts it.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::database::{date, parse_timestamp, timestamp};
use crate::error::Result;
use crate::lifecycle::{OS_SETTING, Orchestrator};
use crate::models::{DomainName, DomainStatus, ServiceRole};
use crate::platform::{BackupSource, DnsResolver, Notification, Platform, Registrar, Visibility};
use crate::tasks::TaskPayload;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreallocationReport {
    pub created: Vec<i64>,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    /// Site whose test service is being created
    pub started: Option<i64>,
    /// Entries dropped because their site is cancelled
    pub dropped: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainRequestReport {
    pub accepted: Vec<i64>,
    pub denied: Vec<i64>,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub changed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub purged: Vec<i64>,
    pub warned: Vec<i64>,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupAuditReport {
    pub failed_hosts: Vec<String>,
    pub missing: Vec<String>,
}

/// Days after deletion on which the owner is warned, e.g. `[1, 12, 23]` for 30.
pub fn warning_days(grace_days: i64) -> Vec<i64> {
    let step = (grace_days / 3 + 1).max(1) as usize;
    (1..grace_days).step_by(step).collect()
}

/// Status the validation sweep moves a domain to, if any.
pub fn validated_status(current: DomainStatus, visibility: Visibility) -> Option<DomainStatus> {
    match current {
        DomainStatus::Accepted
        | DomainStatus::Private
        | DomainStatus::Global
        | DomainStatus::Deleted => Some(match visibility {
            Visibility::Global => DomainStatus::Global,
            Visibility::Private => DomainStatus::Private,
            Visibility::Invisible => DomainStatus::Deleted,
        }),
        DomainStatus::External | DomainStatus::Special => {
            (visibility == Visibility::Invisible).then_some(DomainStatus::Deleted)
        }
        _ => None,
    }
}

impl<P: Platform> Orchestrator<P> {
    // ========================================================================
    // Preallocation
    // ========================================================================

    /// Top up every server type by at most one preallocated site.
    #[instrument(skip(self))]
    pub async fn preallocation_sweep(&self) -> Result<PreallocationReport> {
        let mut report = PreallocationReport::default();

        for server_type in self.store().server_types().await? {
            let count = self.store().count_preallocated_sites(server_type.id).await?;
            if count >= server_type.preallocated {
                continue;
            }
            match self.preallocate(server_type.id).await {
                Ok(site) => report.created.push(site.site_id),
                Err(e) => {
                    error!(server_type = %server_type.name, error = %e, "Preallocation failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    // ========================================================================
    // Upgrades
    // ========================================================================

    /// Start the test service of the oldest waiting site that is due.
    #[instrument(skip(self))]
    pub async fn dequeue_upgrades(&self) -> Result<UpgradeReport> {
        let mut report = UpgradeReport::default();

        let active = self.store().count_active_test_services().await?;
        if active >= self.config().max_pending_upgrades {
            info!(active, "Too many pending upgrades, not dequeuing");
            return Ok(report);
        }

        for entry in self.store().upgrade_queue().await? {
            let Some(site) = self.store().site(entry.site_id).await? else {
                self.store().remove_queue_entry(entry.id).await?;
                continue;
            };
            if site.is_cancelled() {
                warn!(site_id = site.id, "Dropping upgrade request of cancelled site");
                self.store().remove_queue_entry(entry.id).await?;
                report.dropped.push(site.id);
                continue;
            }

            let Some(production) = self
                .store()
                .service_by_role(site.id, ServiceRole::Production)
                .await?
            else {
                continue;
            };
            let os = self.store().setting(production.id, OS_SETTING).await?;
            if !os.is_some_and(|os| self.config().os_due_upgrade.contains(&os)) {
                continue;
            }

            self.tasks()
                .enqueue(&TaskPayload::CloneTestService { site_id: site.id })
                .await?;
            if let Some(email) = site.email.clone() {
                self.notify(Notification {
                    to: email,
                    subject: format!("Test server for {} creating", site.name),
                    body: format!(
                        "The test server requested for your site '{}' is being created. \
                         Please allow a few minutes for this to complete. You will be able to \
                         verify your websites on it from the control panel at {}.",
                        site.name,
                        self.config().main_domain
                    ),
                })
                .await?;
            }
            self.store().remove_queue_entry(entry.id).await?;

            info!(site_id = site.id, "Upgrade started");
            report.started = Some(site.id);
            break;
        }
        Ok(report)
    }

    // ========================================================================
    // Domains
    // ========================================================================

    /// Settle domain requests nobody answered within the grace period.
    #[instrument(skip(self))]
    pub async fn resolve_domain_requests(&self, now: DateTime<Utc>) -> Result<DomainRequestReport> {
        let mut report = DomainRequestReport::default();
        let cutoff = timestamp(now - Duration::days(self.config().domain_grace_days));
        let stamp = timestamp(now);

        for domain in self.store().stale_domain_requests(&cutoff).await? {
            let info = match self.platform().registrar().nameinfo(&domain.name).await {
                Ok(info) => info,
                Err(e) => {
                    error!(domain = %domain.name, error = %e, "Name lookup failed");
                    report.failed += 1;
                    continue;
                }
            };

            let status = if info.exists_as_non_cname() {
                DomainStatus::Denied
            } else {
                DomainStatus::Accepted
            };
            self.store()
                .set_domain_status(domain.id, status, &stamp)
                .await?;
            info!(domain = %domain.name, %status, "Unanswered domain request settled");

            match status {
                DomainStatus::Denied => report.denied.push(domain.id),
                _ => report.accepted.push(domain.id),
            }
        }
        Ok(report)
    }

    /// Re-check the visibility of every active domain.
    #[instrument(skip(self))]
    pub async fn validate_domains(&self, now: DateTime<Utc>) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let stamp = timestamp(now);

        for domain in self.store().domains_with_status(DomainStatus::ACTIVE).await? {
            report.checked += 1;
            let visibility = match self.platform().resolver().visibility(&domain.name).await {
                Ok(visibility) => visibility,
                Err(e) => {
                    error!(domain = %domain.name, error = %e, "Visibility check failed");
                    report.failed += 1;
                    continue;
                }
            };

            let Some(status) = validated_status(domain.status, visibility) else {
                continue;
            };
            if self
                .store()
                .set_domain_status(domain.id, status, &stamp)
                .await?
            {
                info!(domain = %domain.name, from = %domain.status, to = %status, "Domain revalidated");
                report.changed += 1;
            }
        }
        Ok(report)
    }

    /// Warn about, then purge, domains that stayed deleted.
    #[instrument(skip(self))]
    pub async fn expire_domains(&self, now: DateTime<Utc>) -> Result<ExpiryReport> {
        let mut report = ExpiryReport::default();
        let grace = self.config().domain_grace_days;
        let warn_on = warning_days(grace);

        for domain in self
            .store()
            .domains_with_status(&[DomainStatus::Deleted])
            .await?
        {
            match self.expire_domain(&domain, now, grace, &warn_on).await {
                Ok(Some(true)) => report.purged.push(domain.id),
                Ok(Some(false)) => report.warned.push(domain.id),
                Ok(None) => {}
                Err(e) => {
                    error!(domain = %domain.name, error = %e, "Domain expiry failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// `Some(true)` purged, `Some(false)` warned.
    async fn expire_domain(
        &self,
        domain: &DomainName,
        now: DateTime<Utc>,
        grace: i64,
        warn_on: &[i64],
    ) -> Result<Option<bool>> {
        let age = (now - parse_timestamp(&domain.updated_at)?).num_days();
        let purge = age >= grace;
        if !purge && !warn_on.contains(&age) {
            return Ok(None);
        }

        let service = self.store().service_of_domain(domain.id).await?;
        let site = match &service {
            Some(service) => self.store().site(service.site_id).await?,
            None => None,
        };
        let owner = site.as_ref().and_then(|site| site.email.clone());
        let site_name = site.map(|site| site.name).unwrap_or_default();

        if purge {
            warn!(domain = %domain.name, age, "Deleting domain name");
            self.store().purge_domain(domain.id).await?;
            if let Some(to) = owner {
                self.notify(Notification {
                    to,
                    subject: format!("MWS hostname {} deleted", domain.name),
                    body: format!(
                        "The hostname {} of the MWS server {} has failed validation for {} days \
                         and has been removed from the website. If you did not want this to happen, \
                         make sure the hostname exists before contacting us at {}.",
                        domain.name,
                        site_name,
                        age,
                        self.config().support_email
                    ),
                })
                .await?;
            }
            if let Some(service) = service {
                self.request_configuration(service.id).await?;
            }
            return Ok(Some(true));
        }

        let removal = parse_timestamp(&domain.updated_at)? + Duration::days(grace);
        info!(domain = %domain.name, age, "Warning about domain removal");
        if let Some(to) = owner {
            self.notify(Notification {
                to,
                subject: format!("MWS hostname {} scheduled for deletion", domain.name),
                body: format!(
                    "The hostname {} of the MWS server {} has failed validation and is scheduled \
                     for removal on {}. To keep it, make sure it is a CNAME to the server or an \
                     address record pointing at it.",
                    domain.name,
                    site_name,
                    date(removal.date_naive())
                ),
            })
            .await?;
        }
        Ok(Some(false))
    }

    // ========================================================================
    // Backups
    // ========================================================================

    /// Compare last night's backup report with the VMs that should be in it.
    #[instrument(skip(self))]
    pub async fn audit_backups(&self, now: DateTime<Utc>) -> Result<BackupAuditReport> {
        let backup = self.platform().backups().report().await?;
        let mut report = BackupAuditReport::default();

        for host in &backup.failed {
            error!(host = %host, "Backup did not complete last night");
            report.failed_hosts.push(host.clone());
        }

        let today = now.date_naive();
        let yesterday = today - Duration::days(1);
        for candidate in self
            .store()
            .backup_candidates(&date(yesterday), &date(today))
            .await?
        {
            let Some(name) = candidate.vm_name else {
                continue;
            };
            if !backup.mentions(&name) {
                error!(
                    vm_id = candidate.vm_id,
                    site_id = candidate.site_id,
                    host = %name,
                    "Backup did not complete last night"
                );
                report.missing.push(name);
            }
        }
        Ok(report)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Put back tasks whose runner stopped reporting.
    pub async fn recover_stale_tasks(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::seconds(self.config().task_visibility_timeout_secs);
        Ok(self.tasks().requeue_stale(cutoff).await?)
    }
}
