//! Command-backed collaborators used in production.
//!
//! Each wraps an [`ExternalCommand`] built from the configured argv prefix.

use bridge::{ExternalCommand, XenBridge};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::platform::{
    BackupReport, BackupSource, Configurer, DnsResolver, NameInfo, Notification, Notifier,
    Platform, Registrar, Visibility,
};
use crate::sshfp::{KeyType, SshfpRecord};

fn command(argv: &[String], name: &str, config: &Config) -> Result<ExternalCommand> {
    ExternalCommand::from_argv(argv)
        .map(|c| c.with_timeout(config.command_timeout()))
        .ok_or_else(|| Error::Configuration(format!("{name} command is empty")))
}

// ─── Registrar ────────────────────────────────────────────────────────────

/// `registrar pubkey` (JSON on stdin), `registrar sshfp <host> <alg> <type> <fp>`
/// and `registrar nameinfo <domain>`.
pub struct CommandRegistrar {
    command: ExternalCommand,
}

#[derive(Deserialize)]
struct PubkeyResponse {
    pubkey: String,
}

impl Registrar for CommandRegistrar {
    async fn public_key(&self, site_label: &str, key_type: KeyType) -> Result<String> {
        let request = json!({"id": site_label, "keytype": key_type.registrar_name()});
        let output = self
            .command
            .run(&["pubkey".to_string()], Some(request.to_string().as_bytes()))
            .await
            .map_err(|e| Error::external("registrar", e))?;

        let response: PubkeyResponse = output.json().map_err(|e| {
            error!(stdout = %output.stdout, stderr = %output.stderr, "pubkey response is not valid JSON");
            Error::external("registrar", e)
        })?;
        Ok(response.pubkey)
    }

    async fn set_sshfp(&self, hostname: &str, record: &SshfpRecord) -> Result<()> {
        let args = vec![
            "sshfp".to_string(),
            hostname.to_string(),
            record.algorithm.to_string(),
            record.fp_type.to_string(),
            record.fingerprint.clone(),
        ];
        self.command
            .run(&args, None)
            .await
            .map_err(|e| Error::external("registrar", e))?;
        Ok(())
    }

    async fn nameinfo(&self, domain: &str) -> Result<NameInfo> {
        let output = self
            .command
            .run(&["nameinfo".to_string(), domain.to_string()], None)
            .await
            .map_err(|e| Error::external("registrar", e))?;
        output.json().map_err(|e| Error::external("registrar", e))
    }
}

// ─── Configurer ───────────────────────────────────────────────────────────

pub struct CommandConfigurer {
    command: ExternalCommand,
}

impl Configurer for CommandConfigurer {
    async fn apply(&self, hostname: &str) -> Result<()> {
        let output = self
            .command
            .run(&[hostname.to_string()], None)
            .await
            .map_err(|e| Error::external("configurer", e))?;
        debug!(hostname, output = %output.combined(), "Configuration run finished");
        Ok(())
    }
}

// ─── Notifier ─────────────────────────────────────────────────────────────

/// Hands a complete message to `sendmail -t`.
pub struct SendmailNotifier {
    command: ExternalCommand,
    from: String,
}

impl SendmailNotifier {
    fn message(&self, notification: &Notification) -> String {
        format!(
            "From: Managed Web Service Support <{from}>\nReturn-Path: {from}\nTo: {to}\nSubject: {subject}\n\n{body}\n",
            from = self.from,
            to = notification.to,
            subject = notification.subject,
            body = notification.body,
        )
    }
}

impl Notifier for SendmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let message = self.message(notification);
        self.command
            .run(&[], Some(message.as_bytes()))
            .await
            .map_err(|e| Error::external("notifier", e))?;
        Ok(())
    }
}

// ─── Resolver ─────────────────────────────────────────────────────────────

/// Prints `global`, `private` or `invisible` for a name.
pub struct CommandResolver {
    command: ExternalCommand,
}

impl DnsResolver for CommandResolver {
    async fn visibility(&self, name: &str) -> Result<Visibility> {
        let output = self
            .command
            .run(&[name.to_string()], None)
            .await
            .map_err(|e| Error::external("resolver", e))?;

        match output.stdout.trim() {
            "global" => Ok(Visibility::Global),
            "private" => Ok(Visibility::Private),
            "invisible" | "" => Ok(Visibility::Invisible),
            other => Err(Error::external(
                "resolver",
                format!("unexpected visibility {other:?} for {name}"),
            )),
        }
    }
}

// ─── Backups ──────────────────────────────────────────────────────────────

pub struct CommandBackups {
    command: ExternalCommand,
}

impl BackupSource for CommandBackups {
    async fn report(&self) -> Result<BackupReport> {
        let output = self
            .command
            .run(&[], None)
            .await
            .map_err(|e| Error::external("backups", e))?;
        output.json().map_err(|e| Error::external("backups", e))
    }
}

// ─── Platform ─────────────────────────────────────────────────────────────

pub struct CommandPlatform {
    bridge: XenBridge,
    registrar: CommandRegistrar,
    configurer: CommandConfigurer,
    notifier: SendmailNotifier,
    resolver: CommandResolver,
    backups: CommandBackups,
}

impl CommandPlatform {
    pub fn from_config(config: &Config) -> Result<Self> {
        let bridge = XenBridge::from_argv(&config.vm_api_command, config.vm_api_timeout())
            .ok_or_else(|| Error::Configuration("VM API command is empty".to_string()))?;

        Ok(Self {
            bridge,
            registrar: CommandRegistrar {
                command: command(&config.registrar_command, "registrar", config)?,
            },
            configurer: CommandConfigurer {
                command: command(&config.configurer_command, "configurer", config)?,
            },
            notifier: SendmailNotifier {
                command: command(&config.sendmail_command, "sendmail", config)?,
                from: config.support_email.clone(),
            },
            resolver: CommandResolver {
                command: command(&config.resolver_command, "resolver", config)?,
            },
            backups: CommandBackups {
                command: command(&config.backup_command, "backup", config)?,
            },
        })
    }
}

impl Platform for CommandPlatform {
    type Bridge = XenBridge;
    type Registrar = CommandRegistrar;
    type Configurer = CommandConfigurer;
    type Notifier = SendmailNotifier;
    type Resolver = CommandResolver;
    type Backups = CommandBackups;

    fn bridge(&self) -> &XenBridge {
        &self.bridge
    }

    fn registrar(&self) -> &CommandRegistrar {
        &self.registrar
    }

    fn configurer(&self) -> &CommandConfigurer {
        &self.configurer
    }

    fn notifier(&self) -> &SendmailNotifier {
        &self.notifier
    }

    fn resolver(&self) -> &CommandResolver {
        &self.resolver
    }

    fn backups(&self) -> &CommandBackups {
        &self.backups
    }
}
