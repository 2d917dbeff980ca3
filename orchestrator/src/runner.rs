//! Task runner
//!
//! Claims due tasks from the queue and executes them against the
//! orchestrator. Failures are retried per the task's [`RetryPolicy`];
//! when a hypervisor create task gives up, its VM is marked denied, and a
//! site whose test server could not be cloned goes back on the upgrade
//! waiting list.
//!
//! [`RetryPolicy`]: crate::tasks::RetryPolicy

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::lifecycle::Orchestrator;
use crate::models::{ServiceRole, VmStatus};
use crate::platform::{Notifier, Platform};
use crate::tasks::{Failure, Task, TaskPayload};

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Retrying { run_at: String },
    Abandoned,
}

pub struct TaskRunner<P: Platform> {
    orchestrator: Arc<Orchestrator<P>>,
    name: String,
}

impl<P: Platform> TaskRunner<P> {
    pub fn new(orchestrator: Arc<Orchestrator<P>>, name: impl Into<String>) -> Self {
        Self {
            orchestrator,
            name: name.into(),
        }
    }

    /// Claim and run tasks until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let idle = self.orchestrator.config().worker_poll_interval();
        info!(runner = %self.name, "Task runner started");

        loop {
            let pause = match self.run_once(Utc::now()).await {
                Ok(Some(_)) => None,
                Ok(None) => Some(idle),
                Err(e) => {
                    error!(runner = %self.name, error = %e, "Error fetching tasks");
                    Some(idle * 5)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            } else if shutdown.is_cancelled() {
                break;
            }
        }

        info!(runner = %self.name, "Task runner stopped");
    }

    /// Run at most one due task. `None` when nothing was due.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<TaskOutcome>> {
        let tasks = self.orchestrator.tasks();
        let Some(task) = tasks.claim(now).await? else {
            return Ok(None);
        };

        info!(
            runner = %self.name,
            task_id = task.id,
            kind = %task.kind,
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            "Running task"
        );

        let result = match task.payload() {
            Ok(payload) => self.execute(&payload).await,
            Err(e) => Err(e.into()),
        };

        let outcome = match result {
            Ok(()) => {
                tasks.succeed(task.id, Utc::now()).await?;
                info!(task_id = task.id, kind = %task.kind, "Task succeeded");
                TaskOutcome::Succeeded
            }
            Err(e) => {
                let retryable = e.is_retryable();
                match tasks.fail(&task, &e.to_string(), retryable, now).await? {
                    Failure::Retrying { run_at } => {
                        warn!(
                            task_id = task.id,
                            kind = %task.kind,
                            error = %e,
                            run_at = %run_at,
                            "Task failed, retrying"
                        );
                        TaskOutcome::Retrying { run_at }
                    }
                    Failure::Abandoned => {
                        error!(
                            task_id = task.id,
                            kind = %task.kind,
                            error = %e,
                            attempts = task.attempts,
                            "Task failed for good"
                        );
                        self.on_abandoned(&task).await;
                        TaskOutcome::Abandoned
                    }
                }
            }
        };
        Ok(Some(outcome))
    }

    async fn execute(&self, payload: &TaskPayload) -> Result<()> {
        let orchestrator = &self.orchestrator;
        match payload {
            TaskPayload::CreatePrimary {
                service_id,
                host_config_id,
            } => orchestrator.create_primary(*service_id, *host_config_id).await,
            TaskPayload::Recreate { vm_id } => orchestrator.recreate(*vm_id).await,
            TaskPayload::CloneTestService { site_id } => {
                orchestrator.clone_test_service(*site_id).await
            }
            TaskPayload::Destroy { vm_id } => orchestrator.destroy(*vm_id).await,
            TaskPayload::Power { vm_id, state } => {
                orchestrator.power(*vm_id, *state).await?;
                Ok(())
            }
            TaskPayload::Reset { vm_id } => {
                orchestrator.reset(*vm_id).await?;
                Ok(())
            }
            TaskPayload::Configure { service_id } => orchestrator.configure(*service_id).await,
            TaskPayload::Notify { notification } => {
                orchestrator.platform().notifier().send(notification).await
            }
        }
    }

    /// Mark the VM of a create that ran out of attempts as denied.
    async fn on_abandoned(&self, task: &Task) {
        if let Ok(TaskPayload::CloneTestService { site_id }) = task.payload() {
            match self.orchestrator.enqueue_upgrade(site_id).await {
                Ok(_) => warn!(task_id = task.id, site_id, "Upgrade returned to the waiting list"),
                Err(e) => error!(
                    task_id = task.id,
                    site_id,
                    error = %e,
                    "Could not return upgrade to the waiting list"
                ),
            }
        }

        let vm = match self.vm_of(task).await {
            Ok(Some(vm_id)) => vm_id,
            Ok(None) => return,
            Err(e) => {
                error!(task_id = task.id, error = %e, "Could not find VM of abandoned task");
                return;
            }
        };

        match self
            .orchestrator
            .store()
            .set_vm_status(vm, VmStatus::Denied)
            .await
        {
            Ok(()) => warn!(task_id = task.id, vm_id = vm, "VM marked denied"),
            Err(e) => error!(task_id = task.id, vm_id = vm, error = %e, "Could not deny VM"),
        }
    }

    async fn vm_of(&self, task: &Task) -> Result<Option<i64>> {
        let store = self.orchestrator.store();
        let service_id = match task.payload()? {
            TaskPayload::Recreate { vm_id } => return Ok(Some(vm_id)),
            TaskPayload::CreatePrimary { service_id, .. } => service_id,
            TaskPayload::CloneTestService { site_id } => {
                match store.service_by_role(site_id, ServiceRole::Test).await? {
                    Some(service) => service.id,
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        Ok(store.vm_for_service(service_id).await?.map(|vm| vm.id))
    }
}

/// Start `count` runner loops sharing one orchestrator.
pub fn spawn_runners<P: Platform>(
    orchestrator: Arc<Orchestrator<P>>,
    count: usize,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count.max(1))
        .map(|i| {
            let runner = TaskRunner::new(orchestrator.clone(), format!("runner-{i}"));
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.run(shutdown).await })
        })
        .collect()
}
