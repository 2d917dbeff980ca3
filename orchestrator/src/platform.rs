//! External collaborators
//!
//! Everything the orchestrator talks to outside its own database sits behind
//! one of these traits. [`Platform`] bundles one implementation of each so
//! the lifecycle code is generic over a single parameter.

use std::future::Future;

use bridge::HypervisorBridge;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sshfp::{KeyType, SshfpRecord};

/// What the name registry knows about a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameInfo {
    /// Record types present for the name, e.g. `"A"` or `"C"` for a CNAME
    #[serde(default)]
    pub exists: Option<String>,
}

impl NameInfo {
    /// The name is already taken by something other than a CNAME.
    pub fn exists_as_non_cname(&self) -> bool {
        matches!(&self.exists, Some(types) if !types.is_empty() && !types.contains('C'))
    }
}

/// Name registry and host key service.
pub trait Registrar: Send + Sync + 'static {
    /// Public host key of `key_type` generated for a site.
    fn public_key(
        &self,
        site_label: &str,
        key_type: KeyType,
    ) -> impl Future<Output = Result<String>> + Send;

    fn set_sshfp(
        &self,
        hostname: &str,
        record: &SshfpRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    fn nameinfo(&self, domain: &str) -> impl Future<Output = Result<NameInfo>> + Send;
}

/// Runs configuration management against a host.
pub trait Configurer: Send + Sync + 'static {
    fn apply(&self, hostname: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub trait Notifier: Send + Sync + 'static {
    fn send(&self, notification: &Notification) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Resolvable from public resolvers
    Global,
    /// Resolvable only from the institution's own resolvers
    Private,
    Invisible,
}

pub trait DnsResolver: Send + Sync + 'static {
    fn visibility(&self, name: &str) -> impl Future<Output = Result<Visibility>> + Send;
}

/// Last night's backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupReport {
    #[serde(default)]
    pub ok: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

impl BackupReport {
    /// Whether any reported host is `vm_name` itself or a name under it,
    /// e.g. `xen-1.example.org` for `xen-1` but not `xen-10`.
    pub fn mentions(&self, vm_name: &str) -> bool {
        self.ok
            .iter()
            .chain(self.failed.iter())
            .any(|host| match host.strip_prefix(vm_name) {
                Some(rest) => rest.is_empty() || rest.starts_with('.'),
                None => false,
            })
    }
}

pub trait BackupSource: Send + Sync + 'static {
    fn report(&self) -> impl Future<Output = Result<BackupReport>> + Send;
}

pub trait Platform: Send + Sync + 'static {
    type Bridge: HypervisorBridge;
    type Registrar: Registrar;
    type Configurer: Configurer;
    type Notifier: Notifier;
    type Resolver: DnsResolver;
    type Backups: BackupSource;

    fn bridge(&self) -> &Self::Bridge;
    fn registrar(&self) -> &Self::Registrar;
    fn configurer(&self) -> &Self::Configurer;
    fn notifier(&self) -> &Self::Notifier;
    fn resolver(&self) -> &Self::Resolver;
    fn backups(&self) -> &Self::Backups;
}
