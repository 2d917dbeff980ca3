//! Network Allocation Pool
//!
//! Pre-registered network configurations (addresses plus hostname) waiting
//! to be attached to a service or a VM host. A configuration is claimed by
//! a single conditional update, so two callers never receive the same row.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::database::{Database, timestamp};
use crate::error::{Error, Result};
use crate::models::{NetworkConfig, NetworkRole, NewNetworkConfig};

const CONFIG_COLUMNS: &str =
    "id, role, ipv4, ipv6, sshfp, hostname, ipv4_private, private_hostname, claimed_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub role: NetworkRole,
    pub free: i64,
    pub claimed: i64,
}

#[derive(Clone)]
pub struct NetworkPool {
    db: Database,
}

impl NetworkPool {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Claim one free configuration of `role`.
    pub async fn allocate(&self, role: NetworkRole) -> Result<NetworkConfig> {
        let now = timestamp(Utc::now());

        let claimed = sqlx::query_as::<_, NetworkConfig>(&format!(
            r#"
            UPDATE network_configs
            SET claimed_at = ?
            WHERE id = (
                SELECT id FROM network_configs
                WHERE role = ? AND claimed_at IS NULL
                ORDER BY id
                LIMIT 1
            )
            AND claimed_at IS NULL
            RETURNING {CONFIG_COLUMNS}
            "#
        ))
        .bind(&now)
        .bind(role)
        .fetch_optional(self.db.pool())
        .await?;

        match claimed {
            Some(config) => {
                info!(
                    network_config_id = config.id,
                    role = %role,
                    hostname = %config.hostname,
                    "Network configuration claimed"
                );
                Ok(config)
            }
            None => {
                warn!(role = %role, "Network pool exhausted");
                Err(Error::ResourceExhausted(role))
            }
        }
    }

    /// Un-claim a configuration that was claimed but never attached.
    pub async fn release(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE network_configs SET claimed_at = NULL WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        info!(network_config_id = id, "Network configuration released");
        Ok(())
    }

    /// Add free configurations. All or none are inserted.
    pub async fn import(&self, configs: &[NewNetworkConfig]) -> Result<usize> {
        let mut tx = self.db.pool().begin().await?;

        for config in configs {
            sqlx::query(
                r#"
                INSERT INTO network_configs
                    (role, ipv4, ipv6, sshfp, hostname, ipv4_private, private_hostname)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(config.role)
            .bind(&config.ipv4)
            .bind(&config.ipv6)
            .bind(&config.sshfp)
            .bind(&config.hostname)
            .bind(&config.ipv4_private)
            .bind(&config.private_hostname)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::InvalidInput(format!("cannot import {}: {}", config.hostname, e))
            })?;
        }

        tx.commit().await?;
        info!(count = configs.len(), "Network configurations imported");
        Ok(configs.len())
    }

    pub async fn get(&self, id: i64) -> Result<Option<NetworkConfig>> {
        let config = sqlx::query_as::<_, NetworkConfig>(&format!(
            "SELECT {CONFIG_COLUMNS} FROM network_configs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(config)
    }

    /// Free and claimed counts for every role, including empty ones.
    pub async fn stats(&self) -> Result<Vec<PoolStats>> {
        let rows = sqlx::query_as::<_, (NetworkRole, i64, i64)>(
            r#"
            SELECT role,
                   SUM(CASE WHEN claimed_at IS NULL THEN 1 ELSE 0 END),
                   SUM(CASE WHEN claimed_at IS NULL THEN 0 ELSE 1 END)
            FROM network_configs
            GROUP BY role
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(NetworkRole::ALL
            .iter()
            .map(|role| {
                let (free, claimed) = rows
                    .iter()
                    .find(|(r, _, _)| r == role)
                    .map(|(_, free, claimed)| (*free, *claimed))
                    .unwrap_or((0, 0));
                PoolStats {
                    role: *role,
                    free,
                    claimed,
                }
            })
            .collect())
    }
}
