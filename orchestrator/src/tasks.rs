//! Task Queue
//!
//! Durable queue of provisioning work:
//! - Enqueuing typed payloads, optionally delayed
//! - Atomic claiming by runners (Queued → Running)
//! - Completion, fixed-backoff retry or terminal failure per [`RetryPolicy`]
//! - Re-queueing of running tasks whose runner vanished
//!
//! The queue is cheap to clone and can be shared across runner loops.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::database::{Database, DatabaseError, Result, timestamp};
use crate::guard::PowerState;
use crate::models::TaskStatus;
use crate::platform::Notification;

const TASK_COLUMNS: &str = "id, kind, payload, status, attempts, max_attempts, backoff_secs, \
                            run_at, last_error, created_at, started_at, finished_at";

/// How often and how far apart a task kind is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Calls into the hypervisor.
    pub const HYPERVISOR: RetryPolicy = RetryPolicy {
        max_attempts: 4,
        backoff: Duration::from_secs(10 * 60),
    };
    pub const CONFIGURE: RetryPolicy = RetryPolicy {
        max_attempts: 6,
        backoff: Duration::from_secs(15 * 60),
    };
    pub const NOTIFY: RetryPolicy = RetryPolicy {
        max_attempts: 13,
        backoff: Duration::from_secs(5 * 60),
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    CreatePrimary {
        service_id: i64,
        host_config_id: Option<i64>,
    },
    Recreate {
        vm_id: i64,
    },
    CloneTestService {
        site_id: i64,
    },
    Destroy {
        vm_id: i64,
    },
    Power {
        vm_id: i64,
        state: PowerState,
    },
    Reset {
        vm_id: i64,
    },
    Configure {
        service_id: i64,
    },
    Notify {
        notification: Notification,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::CreatePrimary { .. } => "create_primary",
            TaskPayload::Recreate { .. } => "recreate",
            TaskPayload::CloneTestService { .. } => "clone_test_service",
            TaskPayload::Destroy { .. } => "destroy",
            TaskPayload::Power { .. } => "power",
            TaskPayload::Reset { .. } => "reset",
            TaskPayload::Configure { .. } => "configure",
            TaskPayload::Notify { .. } => "notify",
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            TaskPayload::Configure { .. } => RetryPolicy::CONFIGURE,
            TaskPayload::Notify { .. } => RetryPolicy::NOTIFY,
            _ => RetryPolicy::HYPERVISOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub status: TaskStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub backoff_secs: i64,
    pub run_at: String,
    pub last_error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Task {
    pub fn payload(&self) -> Result<TaskPayload> {
        serde_json::from_str(&self.payload).map_err(|e| {
            DatabaseError::InvalidData(format!("task {} has unreadable payload: {}", self.id, e))
        })
    }
}

/// What happened to a task that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Retrying { run_at: String },
    Abandoned,
}

#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
}

impl TaskQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue a task to run as soon as a runner is free.
    pub async fn enqueue(&self, payload: &TaskPayload) -> Result<i64> {
        self.enqueue_at(payload, Utc::now()).await
    }

    pub async fn enqueue_at(&self, payload: &TaskPayload, run_at: DateTime<Utc>) -> Result<i64> {
        let policy = payload.retry_policy();
        let json = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::InvalidData(format!("cannot encode task: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (kind, payload, status, max_attempts, backoff_secs, run_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(payload.kind())
        .bind(json)
        .bind(TaskStatus::Queued)
        .bind(policy.max_attempts)
        .bind(policy.backoff.as_secs() as i64)
        .bind(timestamp(run_at))
        .bind(timestamp(Utc::now()))
        .execute(self.db.pool())
        .await?;

        let id = result.last_insert_rowid();
        info!(task_id = id, kind = payload.kind(), "Task enqueued");
        Ok(id)
    }

    /// Take the oldest due task, marking it running and counting the attempt.
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Option<Task>> {
        let now = timestamp(now);
        let task = sqlx::query_as::<_, Task>(&format!(
            r#"
            UPDATE tasks
            SET status = ?, attempts = attempts + 1, started_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = ? AND run_at <= ?
                ORDER BY run_at, id
                LIMIT 1
            )
            AND status = ?
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(TaskStatus::Running)
        .bind(&now)
        .bind(TaskStatus::Queued)
        .bind(&now)
        .bind(TaskStatus::Queued)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    pub async fn succeed(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?, finished_at = ?, last_error = NULL WHERE id = ?")
            .bind(TaskStatus::Succeeded)
            .bind(timestamp(now))
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Re-queue after the task's backoff if it is retryable and has attempts
    /// left, otherwise mark it failed.
    pub async fn fail(
        &self,
        task: &Task,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Failure> {
        if retryable && task.attempts < task.max_attempts {
            let run_at = timestamp(now + chrono::Duration::seconds(task.backoff_secs));
            sqlx::query("UPDATE tasks SET status = ?, run_at = ?, last_error = ? WHERE id = ?")
                .bind(TaskStatus::Queued)
                .bind(&run_at)
                .bind(error)
                .bind(task.id)
                .execute(self.db.pool())
                .await?;
            return Ok(Failure::Retrying { run_at });
        }

        sqlx::query("UPDATE tasks SET status = ?, finished_at = ?, last_error = ? WHERE id = ?")
            .bind(TaskStatus::Failed)
            .bind(timestamp(now))
            .bind(error)
            .bind(task.id)
            .execute(self.db.pool())
            .await?;
        Ok(Failure::Abandoned)
    }

    /// Put tasks that have been running since before `cutoff` back in the queue.
    pub async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, run_at = ? WHERE status = ? AND started_at < ?",
        )
        .bind(TaskStatus::Queued)
        .bind(timestamp(cutoff))
        .bind(TaskStatus::Running)
        .bind(timestamp(cutoff))
        .execute(self.db.pool())
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(count = requeued, "Re-queued tasks abandoned by their runner");
        }
        Ok(requeued)
    }

    pub async fn get(&self, id: i64) -> Result<Task> {
        sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {} not found", id)))
    }

    /// Most recent tasks first.
    pub async fn list(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>> {
        let tasks = match status {
            Some(status) => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id DESC LIMIT ?"
                ))
                .bind(status)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?
            }
        };
        Ok(tasks)
    }
}
