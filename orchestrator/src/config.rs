//! Configuration Management
//!
//! Provides application configuration as a singleton using `OnceLock`.
//! Values are read from environment variables with defaults.
//!
//! ## Configuration Variables
//!
//! - `MWS_DATABASE_URL`: SQLite database (default: `sqlite://mws.db`)
//! - `MWS_BIND_ADDRESS`: HTTP bind address (default: `0.0.0.0:8080`)
//! - `MWS_MAIN_DOMAIN`: Base URL the hypervisor calls back on
//! - `MWS_LOG_DIR`: If set, JSON logs also go to a daily rolling file here
//! - `MWS_VM_API_COMMAND`, `MWS_REGISTRAR_COMMAND`, `MWS_CONFIGURER_COMMAND`,
//!   `MWS_RESOLVER_COMMAND`, `MWS_BACKUP_COMMAND`, `MWS_SENDMAIL_COMMAND`:
//!   whitespace separated argv prefixes of the external collaborators
//! - `MWS_VM_API_TIMEOUT_SECS`, `MWS_COMMAND_TIMEOUT_SECS`
//! - `MWS_DEFAULT_OS`, `MWS_OS_DUE_UPGRADE` (comma separated)
//! - `MWS_MAX_PENDING_UPGRADES`, `MWS_DOMAIN_GRACE_DAYS`
//! - `MWS_LOCK_TTL_SECS` (raised to at least the VM API timeout plus
//!   [`LOCK_TTL_MARGIN_SECS`])
//! - `MWS_WORKER_CONCURRENCY`, `MWS_WORKER_POLL_INTERVAL_MS`,
//!   `MWS_TASK_VISIBILITY_TIMEOUT_SECS`
//! - `MWS_SUPPORT_EMAIL`

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// How long a button lock outlives the longest VM API call it guards.
pub const LOCK_TTL_MARGIN_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub main_domain: String,
    pub log_dir: Option<PathBuf>,

    pub vm_api_command: Vec<String>,
    pub vm_api_timeout_secs: u64,
    pub registrar_command: Vec<String>,
    pub configurer_command: Vec<String>,
    pub resolver_command: Vec<String>,
    pub backup_command: Vec<String>,
    pub sendmail_command: Vec<String>,
    pub command_timeout_secs: u64,

    pub default_os: String,
    pub os_due_upgrade: Vec<String>,
    pub max_pending_upgrades: i64,
    pub domain_grace_days: i64,
    pub support_email: String,

    pub lock_ttl_secs: i64,
    pub worker_concurrency: usize,
    pub worker_poll_interval_ms: u64,
    pub task_visibility_timeout_secs: i64,
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://mws.db".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            main_domain: "http://localhost:8080".to_string(),
            log_dir: None,

            vm_api_command: argv(&["userv", "mws-admin", "mws_xen_vm_api"]),
            vm_api_timeout_secs: 600,
            registrar_command: argv(&["userv", "mws-admin", "mws_ipreg"]),
            configurer_command: argv(&["userv", "mws-admin", "mws_ansible_host"]),
            resolver_command: argv(&["userv", "mws-admin", "mws_dns_visibility"]),
            backup_command: argv(&["userv", "mws-admin", "mws_check_backups"]),
            sendmail_command: argv(&["/usr/sbin/sendmail", "-t"]),
            command_timeout_secs: 300,

            default_os: "stretch".to_string(),
            os_due_upgrade: vec!["jessie".to_string()],
            max_pending_upgrades: 5,
            domain_grace_days: 30,
            support_email: "mws-support@localhost".to_string(),

            lock_ttl_secs: 660,
            worker_concurrency: 2,
            worker_poll_interval_ms: 1000,
            task_visibility_timeout_secs: 3600,
        }
    }
}

impl Config {
    /// Initialize the global config (can only be called once)
    pub fn init() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable values keep
    /// their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        let text = |key: &str, slot: &mut String| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = value;
            }
        };
        text("MWS_DATABASE_URL", &mut config.database_url);
        text("MWS_BIND_ADDRESS", &mut config.bind_address);
        text("MWS_MAIN_DOMAIN", &mut config.main_domain);
        text("MWS_DEFAULT_OS", &mut config.default_os);
        text("MWS_SUPPORT_EMAIL", &mut config.support_email);

        if let Some(dir) = lookup("MWS_LOG_DIR").filter(|v| !v.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }

        let command = |key: &str, slot: &mut Vec<String>| {
            if let Some(value) = lookup(key) {
                let words: Vec<String> = value.split_whitespace().map(str::to_string).collect();
                if !words.is_empty() {
                    *slot = words;
                }
            }
        };
        command("MWS_VM_API_COMMAND", &mut config.vm_api_command);
        command("MWS_REGISTRAR_COMMAND", &mut config.registrar_command);
        command("MWS_CONFIGURER_COMMAND", &mut config.configurer_command);
        command("MWS_RESOLVER_COMMAND", &mut config.resolver_command);
        command("MWS_BACKUP_COMMAND", &mut config.backup_command);
        command("MWS_SENDMAIL_COMMAND", &mut config.sendmail_command);

        if let Some(value) = lookup("MWS_OS_DUE_UPGRADE") {
            config.os_due_upgrade = value
                .split(',')
                .map(str::trim)
                .filter(|os| !os.is_empty())
                .map(str::to_string)
                .collect();
        }

        fn number<T: FromStr>(value: Option<String>, slot: &mut T) {
            if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
                *slot = parsed;
            }
        }
        number(lookup("MWS_VM_API_TIMEOUT_SECS"), &mut config.vm_api_timeout_secs);
        number(lookup("MWS_COMMAND_TIMEOUT_SECS"), &mut config.command_timeout_secs);
        number(lookup("MWS_MAX_PENDING_UPGRADES"), &mut config.max_pending_upgrades);
        number(lookup("MWS_DOMAIN_GRACE_DAYS"), &mut config.domain_grace_days);
        number(lookup("MWS_LOCK_TTL_SECS"), &mut config.lock_ttl_secs);
        number(lookup("MWS_WORKER_CONCURRENCY"), &mut config.worker_concurrency);
        number(lookup("MWS_WORKER_POLL_INTERVAL_MS"), &mut config.worker_poll_interval_ms);
        number(
            lookup("MWS_TASK_VISIBILITY_TIMEOUT_SECS"),
            &mut config.task_visibility_timeout_secs,
        );

        config.lock_ttl_secs = config.lock_ttl_secs.max(config.min_lock_ttl_secs());
        config
    }

    /// A lock must not expire while the bridge call it guards can still be
    /// running.
    pub fn min_lock_ttl_secs(&self) -> i64 {
        let floor = self.vm_api_timeout_secs.saturating_add(LOCK_TTL_MARGIN_SECS);
        i64::try_from(floor).unwrap_or(i64::MAX)
    }

    pub fn vm_api_timeout(&self) -> Duration {
        Duration::from_secs(self.vm_api_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    /// Absolute URL of a callback route, e.g. `post-installation`.
    pub fn callback_endpoint(&self, route: &str) -> String {
        format!(
            "{}/callbacks/{}",
            self.main_domain.trim_end_matches('/'),
            route
        )
    }
}
