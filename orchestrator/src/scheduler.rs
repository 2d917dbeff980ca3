//! Periodic sweeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::lifecycle::Orchestrator;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Preallocation,
    Upgrades,
    DomainRequests,
    ValidateDomains,
    ExpireDomains,
    Backups,
    StaleTasks,
}

impl Job {
    pub const ALL: [Job; 7] = [
        Job::Preallocation,
        Job::Upgrades,
        Job::DomainRequests,
        Job::ValidateDomains,
        Job::ExpireDomains,
        Job::Backups,
        Job::StaleTasks,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::Preallocation => "preallocation",
            Job::Upgrades => "upgrades",
            Job::DomainRequests => "domain-requests",
            Job::ValidateDomains => "validate-domains",
            Job::ExpireDomains => "expire-domains",
            Job::Backups => "backups",
            Job::StaleTasks => "stale-tasks",
        }
    }

    pub fn period(&self) -> Duration {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        Duration::from_secs(match self {
            Job::Preallocation => 5 * MINUTE,
            Job::Upgrades => 10 * MINUTE,
            Job::DomainRequests => HOUR,
            Job::ValidateDomains | Job::ExpireDomains | Job::Backups => 24 * HOUR,
            Job::StaleTasks => MINUTE,
        })
    }

    /// Run the sweep once, returning its report as JSON.
    pub async fn run<P: Platform>(
        &self,
        orchestrator: &Orchestrator<P>,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value> {
        let report = match self {
            Job::Preallocation => serde_json::to_value(orchestrator.preallocation_sweep().await?),
            Job::Upgrades => serde_json::to_value(orchestrator.dequeue_upgrades().await?),
            Job::DomainRequests => {
                serde_json::to_value(orchestrator.resolve_domain_requests(now).await?)
            }
            Job::ValidateDomains => serde_json::to_value(orchestrator.validate_domains(now).await?),
            Job::ExpireDomains => serde_json::to_value(orchestrator.expire_domains(now).await?),
            Job::Backups => serde_json::to_value(orchestrator.audit_backups(now).await?),
            Job::StaleTasks => serde_json::to_value(orchestrator.recover_stale_tasks(now).await?),
        }?;
        Ok(report)
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Job {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Job::ALL
            .into_iter()
            .find(|job| job.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Job::ALL.iter().map(Job::name).collect();
                format!("unknown job {s:?}, expected one of {}", names.join(", "))
            })
    }
}

/// One interval loop per job until `shutdown` fires.
pub fn spawn_scheduler<P: Platform>(
    orchestrator: Arc<Orchestrator<P>>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    Job::ALL
        .into_iter()
        .map(|job| {
            let orchestrator = orchestrator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(job.period());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(%job, period_secs = job.period().as_secs(), "Scheduled");

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match job.run(&orchestrator, Utc::now()).await {
                        Ok(report) => debug!(%job, %report, "Sweep finished"),
                        Err(e) => error!(%job, error = %e, "Sweep failed"),
                    }
                }
            })
        })
        .collect()
}
