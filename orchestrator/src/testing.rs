//! Test fixtures: temporary databases and a mock [`Platform`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bridge::mock::{MockBridge, MockBridgeConfig, MockCallTracker};
use tempfile::TempDir;

use crate::config::Config;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::lifecycle::Orchestrator;
use crate::models::{NetworkRole, NewNetworkConfig};
use crate::platform::{
    BackupReport, BackupSource, Configurer, DnsResolver, NameInfo, Notification, Notifier,
    Platform, Registrar, Visibility,
};
use crate::sshfp::{KeyType, SshfpRecord};

pub const TEST_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHMiV6SaUYBmQ1wrfAjh3V+GjkuMdfkK2MbKZafsUKTi test";

pub const HYPERVISOR_HOST: &str = "xen1.example.org";

pub async fn test_database() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("mws.db").display());
    let db = Database::new(&url).await.expect("test database");
    (db, dir)
}

/// The `n`th configuration of a role, with addresses unique across roles.
pub fn network_config(role: NetworkRole, n: u32) -> NewNetworkConfig {
    let (octet, name) = match role {
        NetworkRole::Production => (1, "prod"),
        NetworkRole::Test => (2, "test"),
        NetworkRole::Host => (3, "host"),
    };
    NewNetworkConfig {
        role,
        ipv4: format!("10.{octet}.0.{n}"),
        ipv6: Some(format!("2001:db8:{octet}::{n}")),
        sshfp: None,
        hostname: format!("{name}{n}.mws.example.org"),
        ipv4_private: None,
        private_hostname: None,
    }
}

pub fn test_config() -> Config {
    Config {
        main_domain: "https://panel.example.org".to_string(),
        support_email: "support@example.org".to_string(),
        ..Config::default()
    }
}

// ─── Mock collaborators ───────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MockRegistrar {
    pub fail_public_key: bool,
    pub fail_sshfp: bool,
    pub key_requests: Arc<AtomicUsize>,
    pub records: Arc<Mutex<Vec<(String, SshfpRecord)>>>,
    pub names: Arc<Mutex<HashMap<String, NameInfo>>>,
}

impl MockRegistrar {
    pub fn records(&self) -> Vec<(String, SshfpRecord)> {
        self.records.lock().unwrap().clone()
    }

    pub fn set_nameinfo(&self, domain: &str, exists: &str) {
        self.names.lock().unwrap().insert(
            domain.to_string(),
            NameInfo {
                exists: Some(exists.to_string()),
            },
        );
    }
}

impl Registrar for MockRegistrar {
    async fn public_key(&self, _site_label: &str, _key_type: KeyType) -> Result<String> {
        self.key_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_public_key {
            return Err(Error::external("registrar", "key service unavailable"));
        }
        Ok(TEST_KEY.to_string())
    }

    async fn set_sshfp(&self, hostname: &str, record: &SshfpRecord) -> Result<()> {
        if self.fail_sshfp {
            return Err(Error::external("registrar", "zone is locked"));
        }
        self.records
            .lock()
            .unwrap()
            .push((hostname.to_string(), record.clone()));
        Ok(())
    }

    async fn nameinfo(&self, domain: &str) -> Result<NameInfo> {
        Ok(self
            .names
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct MockConfigurer {
    /// The first N runs fail
    pub fail_times: Arc<AtomicUsize>,
    pub runs: Arc<Mutex<Vec<String>>>,
}

impl MockConfigurer {
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_times.store(n, Ordering::SeqCst);
    }
}

impl Configurer for MockConfigurer {
    async fn apply(&self, hostname: &str) -> Result<()> {
        self.runs.lock().unwrap().push(hostname.to_string());
        let failing = self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::external("configurer", "playbook failed"));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockNotifier {
    pub sent: Arc<Mutex<Vec<Notification>>>,
}

impl MockNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for MockNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Names default to invisible.
#[derive(Clone, Default)]
pub struct MockResolver {
    pub visible: Arc<Mutex<HashMap<String, Visibility>>>,
}

impl MockResolver {
    pub fn set(&self, name: &str, visibility: Visibility) {
        self.visible
            .lock()
            .unwrap()
            .insert(name.to_string(), visibility);
    }
}

impl DnsResolver for MockResolver {
    async fn visibility(&self, name: &str) -> Result<Visibility> {
        Ok(self
            .visible
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(Visibility::Invisible))
    }
}

#[derive(Clone, Default)]
pub struct MockBackups {
    pub report: Arc<Mutex<BackupReport>>,
}

impl BackupSource for MockBackups {
    async fn report(&self) -> Result<BackupReport> {
        Ok(self.report.lock().unwrap().clone())
    }
}

pub struct MockPlatform {
    pub bridge: MockBridge,
    pub registrar: MockRegistrar,
    pub configurer: MockConfigurer,
    pub notifier: MockNotifier,
    pub resolver: MockResolver,
    pub backups: MockBackups,
}

impl Platform for MockPlatform {
    type Bridge = MockBridge;
    type Registrar = MockRegistrar;
    type Configurer = MockConfigurer;
    type Notifier = MockNotifier;
    type Resolver = MockResolver;
    type Backups = MockBackups;

    fn bridge(&self) -> &MockBridge {
        &self.bridge
    }

    fn registrar(&self) -> &MockRegistrar {
        &self.registrar
    }

    fn configurer(&self) -> &MockConfigurer {
        &self.configurer
    }

    fn notifier(&self) -> &MockNotifier {
        &self.notifier
    }

    fn resolver(&self) -> &MockResolver {
        &self.resolver
    }

    fn backups(&self) -> &MockBackups {
        &self.backups
    }
}

// ─── Orchestrator fixture ─────────────────────────────────────────────────

pub struct Fixture {
    pub orchestrator: Arc<Orchestrator<MockPlatform>>,
    pub bridge: MockCallTracker,
    pub server_type_id: i64,
    _dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_bridge(MockBridgeConfig::default(), MockRegistrar::default()).await
    }

    pub async fn with_bridge(config: MockBridgeConfig, registrar: MockRegistrar) -> Self {
        Self::build(config, registrar, test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::build(MockBridgeConfig::default(), MockRegistrar::default(), config).await
    }

    /// A cluster with one host, one server type and an empty pool.
    async fn build(
        bridge_config: MockBridgeConfig,
        registrar: MockRegistrar,
        config: Config,
    ) -> Self {
        let (db, dir) = test_database().await;
        let (bridge, tracker) = MockBridge::with_config(bridge_config);
        let platform = MockPlatform {
            bridge,
            registrar,
            configurer: MockConfigurer::default(),
            notifier: MockNotifier::default(),
            resolver: MockResolver::default(),
            backups: MockBackups::default(),
        };
        let orchestrator = Orchestrator::new(db, platform, config);

        let store = orchestrator.store();
        let cluster = store.insert_cluster("main").await.unwrap();
        store.insert_host(cluster, HYPERVISOR_HOST).await.unwrap();
        let server_type_id = store
            .insert_server_type("standard", 1, 2, 20, 0)
            .await
            .unwrap();

        Self {
            orchestrator: Arc::new(orchestrator),
            bridge: tracker,
            server_type_id,
            _dir: dir,
        }
    }

    pub fn platform(&self) -> &MockPlatform {
        self.orchestrator.platform()
    }

    /// Import configurations `1..=n` of every role.
    pub async fn fill_pool(&self, n: u32) {
        let mut configs = Vec::new();
        for role in NetworkRole::ALL {
            configs.extend((1..=n).map(|i| network_config(*role, i)));
        }
        self.orchestrator.pool().import(&configs).await.unwrap();
    }
}
