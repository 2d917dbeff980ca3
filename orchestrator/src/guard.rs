//! Concurrency Guard
//!
//! Power and reset presses are gated by a lock row keyed
//! `(vm_id, operation, argument)`. The row is taken with a single upsert that
//! only overwrites an expired holder, so a second identical request while
//! the first is in flight is reported as not dispatched and never reaches
//! the hypervisor. Power on and power off are different keys.
//!
//! A holder that dies keeps its key until the TTL runs out, and an operation
//! that outlives the TTL can overlap the next one.

use bridge::{ButtonAction, HypervisorBridge, VmCommand};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::database::{Database, Result as DbResult, timestamp};
use crate::error::{Error, Result};
use crate::lifecycle::Orchestrator;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl std::str::FromStr for PowerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "on" => Ok(PowerState::On),
            "off" => Ok(PowerState::Off),
            other => Err(format!("power state must be on or off, not {other:?}")),
        }
    }
}

/// Whether a guarded request reached the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    Dispatched,
    /// An identical request is still in flight
    NotDispatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedOperation {
    PowerOn,
    PowerOff,
    Reset,
}

impl LockedOperation {
    fn key(&self) -> (&'static str, &'static str) {
        match self {
            LockedOperation::PowerOn => ("power", "on"),
            LockedOperation::PowerOff => ("power", "off"),
            LockedOperation::Reset => ("reset", ""),
        }
    }

    fn action(&self) -> ButtonAction {
        match self {
            LockedOperation::PowerOn => ButtonAction::PowerOn,
            LockedOperation::PowerOff => ButtonAction::PowerOff,
            LockedOperation::Reset => ButtonAction::Reboot,
        }
    }
}

impl std::fmt::Display for LockedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.action().as_str())
    }
}

/// A lock this process holds until [`OperationLocks::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub vm_id: i64,
    pub operation: LockedOperation,
    pub holder: String,
}

#[derive(Clone)]
pub struct OperationLocks {
    db: Database,
    ttl: chrono::Duration,
}

impl OperationLocks {
    pub fn new(db: Database, ttl_secs: i64) -> Self {
        Self {
            db,
            ttl: chrono::Duration::seconds(ttl_secs),
        }
    }

    /// Take the lock unless a live holder has it.
    pub async fn acquire(
        &self,
        vm_id: i64,
        operation: LockedOperation,
        now: DateTime<Utc>,
    ) -> DbResult<Option<HeldLock>> {
        let (name, argument) = operation.key();
        let holder = Uuid::now_v7().to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO operation_locks (vm_id, operation, argument, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(vm_id, operation, argument) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE operation_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(vm_id)
        .bind(name)
        .bind(argument)
        .bind(&holder)
        .bind(timestamp(now))
        .bind(timestamp(now + self.ttl))
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(HeldLock {
                vm_id,
                operation,
                holder,
            }))
        } else {
            Ok(None)
        }
    }

    /// Drop a lock, only if it still belongs to this holder.
    pub async fn release(&self, lock: &HeldLock) -> DbResult<bool> {
        let (name, argument) = lock.operation.key();
        let result = sqlx::query(
            r#"
            DELETE FROM operation_locks
            WHERE vm_id = ? AND operation = ? AND argument = ? AND holder = ?
            "#,
        )
        .bind(lock.vm_id)
        .bind(name)
        .bind(argument)
        .bind(&lock.holder)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

impl<P: Platform> Orchestrator<P> {
    /// Press the power button of a VM.
    #[instrument(skip(self))]
    pub async fn power(&self, vm_id: i64, state: PowerState) -> Result<Dispatch> {
        let operation = match state {
            PowerState::On => LockedOperation::PowerOn,
            PowerState::Off => LockedOperation::PowerOff,
        };
        self.guarded_press(vm_id, operation).await
    }

    #[instrument(skip(self))]
    pub async fn reset(&self, vm_id: i64) -> Result<Dispatch> {
        self.guarded_press(vm_id, LockedOperation::Reset).await
    }

    async fn guarded_press(&self, vm_id: i64, operation: LockedOperation) -> Result<Dispatch> {
        let vm = self
            .store()
            .vm(vm_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("VM {}", vm_id)))?;
        let vmid = vm.name.clone().ok_or_else(|| {
            Error::Configuration(format!("VM {} has no hypervisor identifier yet", vm_id))
        })?;
        let host = self.target_host(vm.cluster_id).await?;

        let Some(lock) = self.locks().acquire(vm_id, operation, Utc::now()).await? else {
            info!(vm_id, %operation, "Identical request in flight, not dispatching");
            return Ok(Dispatch::NotDispatched);
        };

        let result = self
            .platform()
            .bridge()
            .invoke(&host, &VmCommand::button(operation.action(), vmid))
            .await;

        if let Err(e) = self.locks().release(&lock).await {
            warn!(vm_id, %operation, error = %e, "Failed to release operation lock");
        }

        result?;
        info!(vm_id, %operation, "Dispatched");
        Ok(Dispatch::Dispatched)
    }
}
