//! Site operations
//!
//! Preallocation of unassigned sites, assignment to an owner, and the
//! owner-level switches (cancel, disable, enable, upgrade request).

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::database::{date, timestamp};
use crate::error::{Error, Result};
use crate::guard::PowerState;
use crate::lifecycle::Orchestrator;
use crate::models::{NetworkConfig, NetworkRole, NewSite};
use crate::platform::Platform;
use crate::pool::NetworkPool;
use crate::tasks::TaskPayload;

/// Network configurations claimed for one preallocation.
///
/// Until [`PoolClaims::commit`] the claims are provisional: on any failure
/// the caller hands them back with [`PoolClaims::rollback`].
struct PoolClaims<'a> {
    pool: &'a NetworkPool,
    claimed: Vec<NetworkConfig>,
}

impl<'a> PoolClaims<'a> {
    fn new(pool: &'a NetworkPool) -> Self {
        Self {
            pool,
            claimed: Vec::with_capacity(3),
        }
    }

    async fn claim(&mut self, role: NetworkRole) -> Result<NetworkConfig> {
        let config = self.pool.allocate(role).await?;
        self.claimed.push(config.clone());
        Ok(config)
    }

    async fn rollback(self) {
        for config in self.claimed.iter().rev() {
            match self.pool.release(config.id).await {
                Ok(()) => info!(network_config_id = config.id, "Released claim"),
                Err(e) => warn!(
                    network_config_id = config.id,
                    error = %e,
                    "Failed to release claim, configuration stays claimed"
                ),
            }
        }
    }

    fn commit(self) -> Vec<NetworkConfig> {
        self.claimed
    }
}

/// A freshly preallocated site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preallocated {
    pub site_id: i64,
    pub production_service_id: i64,
    pub task_id: i64,
}

impl<P: Platform> Orchestrator<P> {
    /// Create one unassigned site of a server type and queue its first VM.
    ///
    /// Claims a production, a test and a host configuration; if any of them
    /// is missing the ones already claimed go back to the pool.
    #[instrument(skip(self))]
    pub async fn preallocate(&self, server_type_id: i64) -> Result<Preallocated> {
        self.store()
            .server_type(server_type_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Server type {}", server_type_id)))?;

        let mut claims = PoolClaims::new(self.pool());
        let claimed = async {
            let production = claims.claim(NetworkRole::Production).await?;
            let test = claims.claim(NetworkRole::Test).await?;
            let host = claims.claim(NetworkRole::Host).await?;
            Ok::<_, Error>((production, test, host))
        }
        .await;

        let (production, test, host) = match claimed {
            Ok(configs) => configs,
            Err(e) => {
                claims.rollback().await;
                return Err(e);
            }
        };

        let site = NewSite {
            name: Uuid::new_v4().simple().to_string(),
            server_type_id,
            preallocated: true,
            ..Default::default()
        };
        let (site_id, production_service_id) = match self
            .store()
            .insert_site_with_services(&site, production.id, test.id)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                claims.rollback().await;
                return Err(e.into());
            }
        };
        claims.commit();

        let task_id = self
            .tasks()
            .enqueue(&TaskPayload::CreatePrimary {
                service_id: production_service_id,
                host_config_id: Some(host.id),
            })
            .await?;

        info!(site_id, server_type_id, task_id, "Site preallocated");
        Ok(Preallocated {
            site_id,
            production_service_id,
            task_id,
        })
    }

    /// Hand a preallocated site to its owner.
    #[instrument(skip(self, description))]
    pub async fn assign_site(
        &self,
        site_id: i64,
        name: &str,
        email: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let today = date(Utc::now().date_naive());
        if !self
            .store()
            .assign_site(site_id, name, email, description, &today)
            .await?
        {
            return Err(Error::InvalidInput(format!(
                "Site {} is not an unassigned preallocated site",
                site_id
            )));
        }
        info!(site_id, "Site assigned");
        Ok(())
    }

    /// End a site's subscription. Its VMs are powered off.
    #[instrument(skip(self))]
    pub async fn cancel_site(&self, site_id: i64, end_date: NaiveDate) -> Result<()> {
        self.require_site(site_id).await?;
        if !self.store().cancel_site(site_id, &date(end_date)).await? {
            warn!(site_id, "Site already cancelled");
            return Ok(());
        }
        self.power_site(site_id, PowerState::Off).await?;
        info!(site_id, "Site cancelled");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn disable_site(&self, site_id: i64) -> Result<()> {
        self.require_site(site_id).await?;
        if self.store().set_site_disabled(site_id, true).await? {
            self.power_site(site_id, PowerState::Off).await?;
            info!(site_id, "Site disabled");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn enable_site(&self, site_id: i64) -> Result<()> {
        let site = self.require_site(site_id).await?;
        if site.is_cancelled() {
            return Err(Error::InvalidInput(format!(
                "Site {} is cancelled and cannot be enabled",
                site_id
            )));
        }
        if self.store().set_site_disabled(site_id, false).await? {
            self.power_site(site_id, PowerState::On).await?;
            info!(site_id, "Site enabled");
        }
        Ok(())
    }

    /// Put a site on the upgrade waiting list. Returns false if it already was.
    #[instrument(skip(self))]
    pub async fn enqueue_upgrade(&self, site_id: i64) -> Result<bool> {
        let site = self.require_site(site_id).await?;
        if site.is_cancelled() {
            return Err(Error::InvalidInput(format!("Site {} is cancelled", site_id)));
        }
        let queued = self
            .store()
            .enqueue_upgrade(site_id, &timestamp(Utc::now()))
            .await?;
        Ok(queued)
    }

    async fn power_site(&self, site_id: i64, state: PowerState) -> Result<()> {
        for vm in self.store().vms_of_site(site_id).await? {
            self.tasks()
                .enqueue(&TaskPayload::Power {
                    vm_id: vm.id,
                    state,
                })
                .await?;
        }
        Ok(())
    }
}
