//! VM Lifecycle Orchestrator
//!
//! Drives a service from `requested` through installation and configuration
//! to `ready`, and a VM from `requested` through `accepted` to `ready`:
//!
//! - create / recreate / clone request a VM from the hypervisor
//! - the post-installation callbacks move the service to `postinstall`
//! - configuration runs move it through `ansible_queued` and `ansible`
//! - destroy deletes the VM and returns the service to `requested`
//!
//! Every status change goes through [`Store::transition_service`].

use bridge::{Callback, CreateParams, Features, HypervisorBridge, NetConf, VmCommand, site_label};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::database::{Database, timestamp};
use crate::error::{Error, Result};
use crate::guard::OperationLocks;
use crate::models::{
    DomainStatus, NetworkConfig, NetworkRole, Service, ServiceRole, ServiceStatus, Site,
    SiteKey, VirtualMachine, VmStatus,
};
use crate::platform::{Configurer, Notification, Platform, Registrar};
use crate::pool::NetworkPool;
use crate::sshfp::{KeyType, PublicKey};
use crate::store::{Store, Transition};
use crate::tasks::{TaskPayload, TaskQueue};

pub const POST_INSTALLATION: &str = "post-installation";
pub const POST_RECREATE: &str = "post-recreate";

/// Service setting recording which OS a VM was installed with.
pub const OS_SETTING: &str = "os";

/// Which hypervisor request [`Orchestrator::install`] makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallKind {
    /// First install. Only a `requested` or re-driven `installing` service
    /// may take it.
    Create,
    /// Reinstall of a VM that may be in any live state.
    Recreate,
}

impl InstallKind {
    fn callback_route(self) -> &'static str {
        match self {
            InstallKind::Create => POST_INSTALLATION,
            InstallKind::Recreate => POST_RECREATE,
        }
    }
}

/// Whether the hypervisor already took a create for this service, so a
/// repeated create task must not send another.
fn create_accepted(service: &Service, vm: &VirtualMachine) -> bool {
    let past_installing = !matches!(
        service.status,
        ServiceStatus::Requested | ServiceStatus::Installing | ServiceStatus::Denied
    );
    past_installing || (vm.name.is_some() && vm.status != VmStatus::Requested)
}

/// What a callback did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Accepted,
    /// The service had already moved on; a duplicate delivery.
    Ignored,
}

pub struct Orchestrator<P: Platform> {
    config: Config,
    store: Store,
    pool: NetworkPool,
    tasks: TaskQueue,
    locks: OperationLocks,
    platform: P,
}

impl<P: Platform> Orchestrator<P> {
    pub fn new(db: Database, platform: P, config: Config) -> Self {
        Self {
            store: Store::new(db.clone()),
            pool: NetworkPool::new(db.clone()),
            tasks: TaskQueue::new(db.clone()),
            locks: OperationLocks::new(db, config.lock_ttl_secs.max(config.min_lock_ttl_secs())),
            platform,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pool(&self) -> &NetworkPool {
        &self.pool
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn locks(&self) -> &OperationLocks {
        &self.locks
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub(crate) async fn require_service(&self, id: i64) -> Result<Service> {
        self.store
            .service(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Service {}", id)))
    }

    pub(crate) async fn require_site(&self, id: i64) -> Result<Site> {
        self.store
            .site(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Site {}", id)))
    }

    pub(crate) async fn require_vm(&self, id: i64) -> Result<VirtualMachine> {
        self.store
            .vm(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("VM {}", id)))
    }

    /// Hostname VM API commands for a cluster are sent to.
    pub(crate) async fn target_host(&self, cluster_id: i64) -> Result<String> {
        self.store
            .first_host(cluster_id)
            .await?
            .map(|host| host.hostname)
            .ok_or_else(|| Error::Configuration(format!("Cluster {} has no hosts", cluster_id)))
    }

    /// The service's own address, as opposed to its VM's host address.
    pub(crate) async fn service_network(&self, service: &Service) -> Result<NetworkConfig> {
        let id = service.network_config_id.ok_or_else(|| {
            Error::Configuration(format!("Service {} has no network configuration", service.id))
        })?;
        self.pool
            .get(id)
            .await?
            .ok_or_else(|| Error::Configuration(format!("Network configuration {} is gone", id)))
    }

    /// Apply a status change, treating a disallowed one as an error.
    pub(crate) async fn transition(&self, service_id: i64, to: ServiceStatus) -> Result<ServiceStatus> {
        let applied = self
            .store
            .transition_service(service_id, to, &timestamp(Utc::now()))
            .await?;
        self.settle_transition(service_id, to, applied)
    }

    /// [`Self::transition`] restricted to leaving one of `sources`.
    async fn transition_from(
        &self,
        service_id: i64,
        sources: &[ServiceStatus],
        to: ServiceStatus,
    ) -> Result<ServiceStatus> {
        let applied = self
            .store
            .transition_service_from(service_id, sources, to, &timestamp(Utc::now()))
            .await?;
        self.settle_transition(service_id, to, applied)
    }

    fn settle_transition(
        &self,
        service_id: i64,
        to: ServiceStatus,
        applied: Transition,
    ) -> Result<ServiceStatus> {
        match applied {
            Transition::Applied { from } => {
                info!(service_id, %from, %to, "Service status changed");
                Ok(from)
            }
            Transition::Rejected { from } => Err(Error::InvalidTransition {
                service_id,
                from,
                to,
            }),
        }
    }

    /// Like [`Self::transition`] but a disallowed change is only logged.
    async fn try_transition(&self, service_id: i64, to: ServiceStatus) -> Result<bool> {
        match self.transition(service_id, to).await {
            Ok(_) => Ok(true),
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(service_id, %from, %to, "Status change not applicable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn notify(&self, notification: Notification) -> Result<i64> {
        let id = self
            .tasks
            .enqueue(&TaskPayload::Notify { notification })
            .await?;
        Ok(id)
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// First VM of a freshly preallocated site.
    #[instrument(skip(self))]
    pub async fn create_primary(&self, service_id: i64, host_config_id: Option<i64>) -> Result<()> {
        let host_config_id = host_config_id
            .ok_or_else(|| Error::Configuration("No host network configuration".to_string()))?;
        let service = self.require_service(service_id).await?;
        let site = self.require_site(service.site_id).await?;

        if site.is_cancelled() {
            warn!(site_id = site.id, "Site is cancelled, not creating a VM");
            return Ok(());
        }

        let host_config = self.pool.get(host_config_id).await?.ok_or_else(|| {
            Error::Configuration(format!("Network configuration {} is gone", host_config_id))
        })?;
        let service_config = self.service_network(&service).await?;

        let vm = match self.store.vm_for_service(service.id).await? {
            Some(vm) if create_accepted(&service, &vm) => {
                info!(vm_id = vm.id, status = %service.status, "VM already created, not asking again");
                vm
            }
            _ => {
                self.install(
                    &site,
                    &service,
                    &host_config,
                    Some(self.config.default_os.clone()),
                    InstallKind::Create,
                )
                .await?
            }
        };

        let now = timestamp(Utc::now());
        let vhost = self.store.ensure_vhost(service.id, "default").await?;
        let domain = self
            .store
            .ensure_domain(vhost.id, &service_config.hostname, DomainStatus::Accepted, &now)
            .await?;
        if vhost.main_domain_id.is_none() {
            self.store.set_main_domain(vhost.id, Some(domain.id)).await?;
        }

        self.provision_secrets(&vm).await?;
        Ok(())
    }

    /// Reinstall a VM in place, keeping its address and recorded OS.
    #[instrument(skip(self))]
    pub async fn recreate(&self, vm_id: i64) -> Result<()> {
        let vm = self.require_vm(vm_id).await?;
        let service = self.require_service(vm.service_id).await?;
        let site = self.require_site(service.site_id).await?;

        if site.is_cancelled() {
            warn!(site_id = site.id, vm_id, "Site is cancelled, not recreating");
            return Ok(());
        }

        let host_config = self.pool.get(vm.network_config_id).await?.ok_or_else(|| {
            Error::Configuration(format!("VM {} has lost its network configuration", vm_id))
        })?;
        let os = self.store.setting(service.id, OS_SETTING).await?;

        self.install(&site, &service, &host_config, os, InstallKind::Recreate)
            .await?;
        Ok(())
    }

    /// Create the test service of a site from its production service.
    #[instrument(skip(self))]
    pub async fn clone_test_service(&self, site_id: i64) -> Result<()> {
        let site = self.require_site(site_id).await?;
        if site.is_cancelled() {
            warn!(site_id, "Site is cancelled, not cloning");
            return Ok(());
        }

        let production = self
            .store
            .service_by_role(site.id, ServiceRole::Production)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Production service of site {}", site.id)))?;
        let test = self
            .store
            .service_by_role(site.id, ServiceRole::Test)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Test service of site {}", site.id)))?;

        let existing = self.store.vm_for_service(test.id).await?;
        let vm = match existing {
            Some(vm) if create_accepted(&test, &vm) => {
                info!(vm_id = vm.id, status = %test.status, "Test VM already created, not asking again");
                vm
            }
            unaccepted => {
                // A retry reuses the host configuration claimed by the first attempt.
                let host_config = match unaccepted {
                    Some(vm) => self.pool.get(vm.network_config_id).await?.ok_or_else(|| {
                        Error::Configuration(format!(
                            "VM {} has lost its network configuration",
                            vm.id
                        ))
                    })?,
                    None => self.pool.allocate(NetworkRole::Host).await?,
                };
                self.install(
                    &site,
                    &test,
                    &host_config,
                    Some(self.config.default_os.clone()),
                    InstallKind::Create,
                )
                .await?
            }
        };
        self.provision_secrets(&vm).await?;

        let copied = self.store.copy_packages(production.id, test.id).await?;
        debug!(site_id, copied, "Package selections copied to test service");

        self.request_configuration(production.id).await?;
        self.request_configuration(test.id).await?;
        Ok(())
    }

    /// Shared create path: make sure a VM record exists, mark the service
    /// installing, and ask the hypervisor for the machine. A recreate also
    /// puts the VM back to `requested`, once the service change is allowed.
    ///
    /// A malformed response is logged and the VM named after its host
    /// configuration. A failed call leaves the VM with that fallback name and
    /// status `requested`, and is returned to the caller.
    async fn install(
        &self,
        site: &Site,
        service: &Service,
        host_config: &NetworkConfig,
        os: Option<String>,
        kind: InstallKind,
    ) -> Result<VirtualMachine> {
        let server_type = self
            .store
            .server_type(site.server_type_id)
            .await?
            .ok_or_else(|| {
                Error::Configuration(format!("Server type {} is gone", site.server_type_id))
            })?;

        let vm = match self.store.vm_for_service(service.id).await? {
            Some(vm) => vm,
            None => {
                let cluster = self
                    .store
                    .first_cluster()
                    .await?
                    .ok_or_else(|| Error::Configuration("No cluster configured".to_string()))?;
                let token = Uuid::new_v4().to_string();
                self.store
                    .insert_vm(
                        service.id,
                        server_type.numcpu,
                        server_type.sizeram,
                        &token,
                        cluster.id,
                        host_config.id,
                    )
                    .await?
            }
        };
        let host = self.target_host(vm.cluster_id).await?;

        match kind {
            InstallKind::Create => {
                self.transition_from(
                    service.id,
                    &[ServiceStatus::Requested, ServiceStatus::Installing],
                    ServiceStatus::Installing,
                )
                .await?;
            }
            InstallKind::Recreate => {
                self.transition(service.id, ServiceStatus::Installing).await?;
                self.store.set_vm_status(vm.id, VmStatus::Requested).await?;
            }
        }

        let params = CreateParams {
            site_id: site_label(site.id),
            os: os.clone(),
            netconf: NetConf {
                ipv4: host_config.ipv4.clone(),
                ipv6: host_config.ipv6.clone(),
                hostname: host_config.hostname.clone(),
            },
            features: Features::from_gib(vm.numcpu, vm.sizeram, server_type.sizedisk),
            callback: Callback {
                endpoint: self.config.callback_endpoint(kind.callback_route()),
                vm_id: vm.id,
                secret: vm.token.clone(),
            },
        };

        let response = match self
            .platform
            .bridge()
            .invoke(&host, &VmCommand::Create(params))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(vm_id = vm.id, service_id = service.id, error = %e, "VM create request failed");
                if vm.name.is_none() {
                    self.store.set_vm_name(vm.id, &host_config.hostname).await?;
                }
                return Err(e.into());
            }
        };

        let name = match response.create_response() {
            Ok(created) => created.vmid.unwrap_or_else(|| host_config.hostname.clone()),
            Err(e) => {
                error!(vm_id = vm.id, error = %e, "VM API response is not properly formatted");
                host_config.hostname.clone()
            }
        };
        self.store.set_vm_name(vm.id, &name).await?;
        // The callback may already have marked it ready.
        self.store
            .advance_vm_status(vm.id, VmStatus::Requested, VmStatus::Accepted)
            .await?;

        if let Some(os) = os {
            self.store.set_setting(service.id, OS_SETTING, &os).await?;
        }

        info!(vm_id = vm.id, service_id = service.id, vm_name = %name, "VM requested");
        self.require_vm(vm.id).await
    }

    // ========================================================================
    // Secrets
    // ========================================================================

    /// Record the site's host keys and publish their SSHFP records for the
    /// service, test service and VM hostnames.
    ///
    /// Registrar failures are logged and skipped.
    #[instrument(skip(self, vm), fields(vm_id = vm.id))]
    pub async fn provision_secrets(&self, vm: &VirtualMachine) -> Result<()> {
        let service = self.require_service(vm.service_id).await?;
        let site_id = service.site_id;
        let label = site_label(site_id);

        let mut hostnames = Vec::new();
        if let Ok(config) = self.service_network(&service).await {
            hostnames.push(config.hostname);
        }
        if let Some(test) = self
            .store
            .service_by_role(site_id, ServiceRole::Test)
            .await?
        {
            if let Ok(config) = self.service_network(&test).await {
                hostnames.push(config.hostname);
            }
        }
        if let Some(config) = self.pool.get(vm.network_config_id).await? {
            hostnames.push(config.hostname);
        }
        hostnames.dedup();

        let registrar = self.platform.registrar();
        for key_type in KeyType::ALL {
            let text = match self.store.site_key(site_id, key_type.as_str()).await? {
                Some(known) => known.public_key,
                None => match registrar.public_key(&label, key_type).await {
                    Ok(text) => text,
                    Err(e) => {
                        error!(site_id, %key_type, error = %e, "Could not fetch site public key");
                        continue;
                    }
                },
            };

            let key = match PublicKey::parse(&text) {
                Ok(key) => key,
                Err(e) => {
                    error!(site_id, %key_type, error = %e, "Site public key is unusable");
                    continue;
                }
            };

            self.store
                .insert_site_key(&SiteKey {
                    site_id,
                    key_type: key_type.as_str().to_string(),
                    public_key: key.as_str().to_string(),
                    fingerprint: key.sha256_fingerprint(),
                })
                .await?;

            let record = key.sshfp(key_type);
            for hostname in &hostnames {
                if let Err(e) = registrar.set_sshfp(hostname, &record).await {
                    error!(
                        site_id,
                        %key_type,
                        hostname = %hostname,
                        error = %e,
                        "Error while setting up SSHFP record"
                    );
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Delete a VM at the hypervisor, then forget it.
    #[instrument(skip(self))]
    pub async fn destroy(&self, vm_id: i64) -> Result<()> {
        let vm = self.require_vm(vm_id).await?;

        match &vm.name {
            Some(vmid) => {
                let host = self.target_host(vm.cluster_id).await?;
                if let Err(e) = self
                    .platform
                    .bridge()
                    .invoke(&host, &VmCommand::delete(vmid.clone()))
                    .await
                {
                    error!(vm_id, error = %e, "VM delete request failed");
                    return Err(e.into());
                }
            }
            None => warn!(vm_id, "VM was never named by the hypervisor, removing record only"),
        }

        self.store.delete_vm(vm.id).await?;
        self.try_transition(vm.service_id, ServiceStatus::Requested)
            .await?;
        info!(vm_id, service_id = vm.service_id, "VM destroyed");
        Ok(())
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// The hypervisor finished installing a new VM.
    pub async fn post_installation(&self, vm_id: i64, secret: &str) -> Result<CallbackOutcome> {
        self.installation_finished(vm_id, secret, true).await
    }

    /// The hypervisor finished reinstalling a VM.
    pub async fn post_recreate(&self, vm_id: i64, secret: &str) -> Result<CallbackOutcome> {
        self.installation_finished(vm_id, secret, false).await
    }

    #[instrument(skip(self, secret))]
    async fn installation_finished(
        &self,
        vm_id: i64,
        secret: &str,
        notify_owner: bool,
    ) -> Result<CallbackOutcome> {
        let vm = self.require_vm(vm_id).await?;

        if !constant_time_eq(vm.token.as_bytes(), secret.as_bytes()) {
            warn!(target: "security", vm_id, "Callback with wrong secret");
            return Err(Error::Unauthorized { vm_id });
        }

        let service = self.require_service(vm.service_id).await?;
        if service.status != ServiceStatus::Installing {
            info!(vm_id, status = %service.status, "Service not installing, callback ignored");
            return Ok(CallbackOutcome::Ignored);
        }

        self.store.set_vm_status(vm.id, VmStatus::Ready).await?;
        if !self
            .try_transition(service.id, ServiceStatus::Postinstall)
            .await?
        {
            return Ok(CallbackOutcome::Ignored);
        }

        self.request_configuration(service.id).await?;

        if notify_owner {
            let site = self.require_site(service.site_id).await?;
            if let (false, Some(email)) = (site.preallocated, site.email.clone()) {
                self.notify(Notification {
                    to: email,
                    subject: format!("Your managed web server '{}' is available", site.name),
                    body: format!(
                        "The installation of your managed web server '{}' has finished. \
                         You can now manage it from the control panel at {}.",
                        site.name, self.config.main_domain
                    ),
                })
                .await?;
            }
        }

        info!(vm_id, service_id = service.id, "Installation finished");
        Ok(CallbackOutcome::Accepted)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Queue a configuration run. Returns whether one was queued.
    #[instrument(skip(self))]
    pub async fn request_configuration(&self, service_id: i64) -> Result<bool> {
        let service = self.require_service(service_id).await?;

        match service.status {
            ServiceStatus::Postinstall | ServiceStatus::Ready | ServiceStatus::Ansible => {
                if !self
                    .try_transition(service.id, ServiceStatus::AnsibleQueued)
                    .await?
                {
                    return Ok(false);
                }
                self.tasks
                    .enqueue(&TaskPayload::Configure {
                        service_id: service.id,
                    })
                    .await?;
                Ok(true)
            }
            other => {
                debug!(service_id, status = %other, "Configuration not requested");
                Ok(false)
            }
        }
    }

    /// Run configuration management for a queued service.
    #[instrument(skip(self))]
    pub async fn configure(&self, service_id: i64) -> Result<()> {
        let service = self.require_service(service_id).await?;
        if service.status != ServiceStatus::AnsibleQueued {
            info!(service_id, status = %service.status, "Nothing queued, skipping configuration");
            return Ok(());
        }
        let hostname = self.service_network(&service).await?.hostname;

        if !self
            .try_transition(service.id, ServiceStatus::Ansible)
            .await?
        {
            return Ok(());
        }

        if let Err(e) = self.platform.configurer().apply(&hostname).await {
            error!(service_id, hostname = %hostname, error = %e, "Configuration run failed");
            self.try_transition(service.id, ServiceStatus::AnsibleQueued)
                .await?;
            return Err(e);
        }

        if !self.try_transition(service.id, ServiceStatus::Ready).await? {
            info!(service_id, "Configuration re-requested during run, another run is queued");
        }
        Ok(())
    }

    /// Operator refusal of a service that has not been installed.
    #[instrument(skip(self))]
    pub async fn deny_service(&self, service_id: i64) -> Result<()> {
        self.transition(service_id, ServiceStatus::Denied).await?;
        Ok(())
    }
}

/// Compare without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"7b0c", b"7b0c"));
        assert!(!constant_time_eq(b"7b0c", b"7b0d"));
        assert!(!constant_time_eq(b"7b0c", b"7b0"));
        assert!(constant_time_eq(b"", b""));
    }
}
