use std::fmt;
use std::path::PathBuf;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use orchestrator::{
    CommandPlatform, Config, Database, DatabaseError, Job, NewNetworkConfig, Orchestrator,
    Platform, PowerState, TaskPayload, TaskStatus,
};
use serde_json::{Value, json};

#[derive(Debug)]
pub enum CliError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Orchestrator(orchestrator::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Io(err) => write!(f, "I/O error: {}", err),
            CliError::Json(err) => write!(f, "Invalid JSON: {}", err),
            CliError::Orchestrator(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CliError {}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io(err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Json(err)
    }
}

impl From<orchestrator::Error> for CliError {
    fn from(err: orchestrator::Error) -> Self {
        CliError::Orchestrator(err)
    }
}

impl From<DatabaseError> for CliError {
    fn from(err: DatabaseError) -> Self {
        CliError::Orchestrator(err.into())
    }
}

fn not_found(what: String) -> CliError {
    CliError::Orchestrator(orchestrator::Error::NotFound(what))
}

#[derive(Debug, Parser)]
#[command(name = "mwsctl", version)]
#[command(about = "Operate the Managed Web Service provisioning core")]
pub struct Cli {
    /// SQLite database URL, overrides MWS_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    pub async fn handle() -> Result<(), CliError> {
        let output = Cli::parse().run().await?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }

    /// Execute against the configured database, returning what to print.
    pub async fn run(self) -> Result<Value, CliError> {
        let mut config = Config::from_env();
        if let Some(url) = self.database_url {
            config.database_url = url;
        }

        let database = Database::new(&config.database_url).await?;
        let platform = CommandPlatform::from_config(&config)?;
        let orchestrator = Orchestrator::new(database, platform, config);
        self.command.execute(&orchestrator).await
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Network configuration pool
    #[command(subcommand)]
    Pool(PoolCommand),
    /// VM sizes offered to sites
    #[command(subcommand)]
    ServerType(ServerTypeCommand),
    /// Hypervisor clusters
    #[command(subcommand)]
    Cluster(ClusterCommand),
    #[command(subcommand)]
    Site(SiteCommand),
    #[command(subcommand)]
    Service(ServiceCommand),
    /// Queue operations on a VM
    #[command(subcommand)]
    Vm(VmCommand),
    #[command(subcommand)]
    Task(TaskCommand),
    /// Run one reconciliation sweep now
    Sweep {
        job: Job,
    },
}

#[derive(Debug, Subcommand)]
enum PoolCommand {
    /// Add configurations from a JSON array file
    Import { file: PathBuf },
    Stats,
}

#[derive(Debug, Subcommand)]
enum ServerTypeCommand {
    Add {
        name: String,
        #[arg(long)]
        cpus: i64,
        /// GiB
        #[arg(long)]
        ram: i64,
        /// GiB
        #[arg(long)]
        disk: i64,
        /// Unassigned sites to keep ready
        #[arg(long, default_value_t = 0)]
        preallocated: i64,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum ClusterCommand {
    Add {
        name: String,
        /// Hypervisor host names
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SiteCommand {
    /// Create an unassigned site of a server type
    Preallocate { server_type_id: i64 },
    /// Hand a preallocated site to its owner
    Assign {
        site_id: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        description: Option<String>,
    },
    Cancel {
        site_id: i64,
        /// Defaults to today
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    Disable { site_id: i64 },
    Enable { site_id: i64 },
    /// Put the site on the upgrade waiting list
    Upgrade { site_id: i64 },
}

#[derive(Debug, Subcommand)]
enum ServiceCommand {
    Show { service_id: i64 },
    Deny { service_id: i64 },
    /// Queue a configuration run
    Configure { service_id: i64 },
}

#[derive(Debug, Subcommand)]
enum VmCommand {
    Power { vm_id: i64, state: PowerState },
    Reset { vm_id: i64 },
    Recreate { vm_id: i64 },
    Destroy { vm_id: i64 },
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

impl Commands {
    async fn execute<P: Platform>(self, orchestrator: &Orchestrator<P>) -> Result<Value, CliError> {
        let store = orchestrator.store();

        let output = match self {
            Commands::Pool(PoolCommand::Import { file }) => {
                let text = tokio::fs::read_to_string(&file).await?;
                let configs: Vec<NewNetworkConfig> = serde_json::from_str(&text)?;
                let imported = orchestrator.pool().import(&configs).await?;
                json!({ "imported": imported })
            }
            Commands::Pool(PoolCommand::Stats) => {
                serde_json::to_value(orchestrator.pool().stats().await?)?
            }

            Commands::ServerType(ServerTypeCommand::Add {
                name,
                cpus,
                ram,
                disk,
                preallocated,
            }) => {
                let id = store
                    .insert_server_type(&name, cpus, ram, disk, preallocated)
                    .await?;
                json!({ "id": id })
            }
            Commands::ServerType(ServerTypeCommand::List) => {
                serde_json::to_value(store.server_types().await?)?
            }

            Commands::Cluster(ClusterCommand::Add { name, hosts }) => {
                let cluster_id = store.insert_cluster(&name).await?;
                let mut host_ids = Vec::with_capacity(hosts.len());
                for host in &hosts {
                    host_ids.push(store.insert_host(cluster_id, host).await?);
                }
                json!({ "id": cluster_id, "hosts": host_ids })
            }

            Commands::Site(command) => command.execute(orchestrator).await?,
            Commands::Service(command) => command.execute(orchestrator).await?,

            Commands::Vm(command) => {
                let (vm_id, payload) = match command {
                    VmCommand::Power { vm_id, state } => (vm_id, TaskPayload::Power { vm_id, state }),
                    VmCommand::Reset { vm_id } => (vm_id, TaskPayload::Reset { vm_id }),
                    VmCommand::Recreate { vm_id } => (vm_id, TaskPayload::Recreate { vm_id }),
                    VmCommand::Destroy { vm_id } => (vm_id, TaskPayload::Destroy { vm_id }),
                };
                if store.vm(vm_id).await?.is_none() {
                    return Err(not_found(format!("VM {}", vm_id)));
                }
                let task_id = orchestrator.tasks().enqueue(&payload).await?;
                json!({ "task_id": task_id })
            }

            Commands::Task(TaskCommand::List { status, limit }) => {
                serde_json::to_value(orchestrator.tasks().list(status, limit).await?)?
            }

            Commands::Sweep { job } => job.run(orchestrator, Utc::now()).await?,
        };
        Ok(output)
    }
}

impl SiteCommand {
    async fn execute<P: Platform>(self, orchestrator: &Orchestrator<P>) -> Result<Value, CliError> {
        let output = match self {
            SiteCommand::Preallocate { server_type_id } => {
                let site = orchestrator.preallocate(server_type_id).await?;
                json!({
                    "site_id": site.site_id,
                    "production_service_id": site.production_service_id,
                    "task_id": site.task_id,
                })
            }
            SiteCommand::Assign {
                site_id,
                name,
                email,
                description,
            } => {
                orchestrator
                    .assign_site(site_id, &name, &email, description.as_deref())
                    .await?;
                json!({ "site_id": site_id })
            }
            SiteCommand::Cancel { site_id, end_date } => {
                let end_date = end_date.unwrap_or_else(|| Utc::now().date_naive());
                orchestrator.cancel_site(site_id, end_date).await?;
                json!({ "site_id": site_id, "end_date": end_date.to_string() })
            }
            SiteCommand::Disable { site_id } => {
                orchestrator.disable_site(site_id).await?;
                json!({ "site_id": site_id })
            }
            SiteCommand::Enable { site_id } => {
                orchestrator.enable_site(site_id).await?;
                json!({ "site_id": site_id })
            }
            SiteCommand::Upgrade { site_id } => {
                let queued = orchestrator.enqueue_upgrade(site_id).await?;
                json!({ "site_id": site_id, "queued": queued })
            }
        };
        Ok(output)
    }
}

impl ServiceCommand {
    async fn execute<P: Platform>(self, orchestrator: &Orchestrator<P>) -> Result<Value, CliError> {
        let store = orchestrator.store();

        let output = match self {
            ServiceCommand::Show { service_id } => {
                let service = store
                    .service(service_id)
                    .await?
                    .ok_or_else(|| not_found(format!("Service {}", service_id)))?;
                json!({
                    "service": service,
                    "history": store.status_history(service_id).await?,
                    "vm": store.vm_for_service(service_id).await?,
                })
            }
            ServiceCommand::Deny { service_id } => {
                orchestrator.deny_service(service_id).await?;
                json!({ "service_id": service_id, "status": "denied" })
            }
            ServiceCommand::Configure { service_id } => {
                let queued = orchestrator.request_configuration(service_id).await?;
                json!({ "service_id": service_id, "queued": queued })
            }
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Helpers ───────────────────────────────────────────────────────

    struct Workspace {
        dir: tempfile::TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn database_url(&self) -> String {
            format!("sqlite://{}", self.dir.path().join("mws.db").display())
        }

        async fn run(&self, args: &[&str]) -> Result<Value, CliError> {
            let url = self.database_url();
            let mut argv = vec!["mwsctl", "--database-url", url.as_str()];
            argv.extend_from_slice(args);
            Cli::try_parse_from(argv).unwrap().run().await
        }

        fn write(&self, name: &str, contents: &str) -> String {
            let path = self.dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path.display().to_string()
        }
    }

    const POOL: &str = r#"[
        {"role": "production", "ipv4": "10.1.0.1", "hostname": "prod1.example.org"},
        {"role": "test", "ipv4": "10.2.0.1", "hostname": "test1.example.org"},
        {"role": "host", "ipv4": "10.3.0.1", "hostname": "host1.example.org"}
    ]"#;

    // ─── Tests ─────────────────────────────────────────────────────────

    #[test]
    fn parses_nested_commands() {
        let cli = Cli::try_parse_from(["mwsctl", "vm", "power", "7", "off"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Vm(VmCommand::Power {
                vm_id: 7,
                state: PowerState::Off
            })
        ));

        let cli = Cli::try_parse_from(["mwsctl", "sweep", "expire-domains"]).unwrap();
        assert!(matches!(cli.command, Commands::Sweep { job: Job::ExpireDomains }));

        assert!(Cli::try_parse_from(["mwsctl", "sweep", "billing"]).is_err());
        assert!(Cli::try_parse_from(["mwsctl", "vm", "power", "7", "sideways"]).is_err());
    }

    #[tokio::test]
    async fn import_then_preallocate() {
        let ws = Workspace::new();
        let file = ws.write("pool.json", POOL);

        let imported = ws.run(&["pool", "import", &file]).await.unwrap();
        assert_eq!(imported, json!({ "imported": 3 }));

        ws.run(&["cluster", "add", "main", "--host", "xen1.example.org"])
            .await
            .unwrap();
        let server_type = ws
            .run(&["server-type", "add", "standard", "--cpus", "1", "--ram", "2", "--disk", "20"])
            .await
            .unwrap();
        let server_type_id = server_type["id"].as_i64().unwrap().to_string();

        let site = ws
            .run(&["site", "preallocate", &server_type_id])
            .await
            .unwrap();
        assert!(site["task_id"].as_i64().is_some());

        let stats = ws.run(&["pool", "stats"]).await.unwrap();
        for role in stats.as_array().unwrap() {
            assert_eq!(role["free"], 0);
            assert_eq!(role["claimed"], 1);
        }

        let tasks = ws.run(&["task", "list", "--status", "queued"]).await.unwrap();
        assert_eq!(tasks[0]["kind"], "create_primary");
    }

    #[tokio::test]
    async fn unknown_vm_is_reported() {
        let ws = Workspace::new();
        let err = ws.run(&["vm", "reset", "42"]).await.unwrap_err();
        assert!(matches!(
            err,
            CliError::Orchestrator(orchestrator::Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_pool_file_is_rejected() {
        let ws = Workspace::new();
        let file = ws.write("pool.json", r#"[{"role": "mainframe"}]"#);
        let err = ws.run(&["pool", "import", &file]).await.unwrap_err();
        assert!(matches!(err, CliError::Json(_)));
    }
}
