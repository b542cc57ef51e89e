use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Advisory per-VM exclusivity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub vm_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// Lease owner used by an orchestration run.
pub fn run_owner(run_id: &str) -> String {
    format!("run:{run_id}")
}

/// Lease owner used by a manual operation from `actor`.
pub fn manual_owner(actor: &str) -> String {
    format!("manual:{actor}")
}

#[derive(Clone)]
pub struct LeaseStore {
    pool: SqlitePool,
}

impl LeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Take the lease for `vm_id`. Succeeds when no lease exists, the existing
    /// one has expired, or `owner` already holds it (which extends it).
    pub async fn acquire(&self, vm_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_secs(ttl);

        let result = sqlx::query(
            r#"
            INSERT INTO vm_leases (vm_id, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(vm_id) DO UPDATE
            SET owner = excluded.owner,
                acquired_at = CASE WHEN vm_leases.owner = excluded.owner
                                   THEN vm_leases.acquired_at
                                   ELSE excluded.acquired_at END,
                expires_at = excluded.expires_at
            WHERE vm_leases.expires_at <= ? OR vm_leases.owner = excluded.owner
            "#,
        )
        .bind(vm_id)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let holder = self
                .current(vm_id)
                .await?
                .map(|lease| lease.owner)
                .unwrap_or_default();
            return Err(OrchestratorError::LeaseHeld {
                vm_id: vm_id.to_string(),
                owner: holder,
            });
        }

        debug!(vm_id, owner, ttl_secs = ttl.as_secs(), "Lease acquired");

        let row = sqlx::query_as::<_, LeaseRow>("SELECT * FROM vm_leases WHERE vm_id = ?")
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Lease for VM {vm_id}")))?;

        Ok(row.into())
    }

    /// Push back the expiry of a lease `owner` still holds. Returns false if
    /// the lease is gone or belongs to someone else.
    pub async fn extend(&self, vm_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE vm_leases SET expires_at = ? WHERE vm_id = ? AND owner = ?",
        )
        .bind(now + ttl_secs(ttl))
        .bind(vm_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Extend a lease `owner` still holds, taking it back if it lapsed and
    /// nobody else claimed it.
    pub async fn renew(&self, vm_id: &str, owner: &str, ttl: Duration) -> Result<()> {
        if !self.extend(vm_id, owner, ttl).await? {
            self.acquire(vm_id, owner, ttl).await?;
        }
        Ok(())
    }

    /// Drop the lease if `owner` holds it. Returns whether anything was released.
    pub async fn release(&self, vm_id: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vm_leases WHERE vm_id = ? AND owner = ?")
            .bind(vm_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// The live lease on `vm_id`, if any.
    pub async fn current(&self, vm_id: &str) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp();
        let row = sqlx::query_as::<_, LeaseRow>(
            "SELECT * FROM vm_leases WHERE vm_id = ? AND expires_at > ?",
        )
        .bind(vm_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Lease::from))
    }

    /// Delete expired leases and return how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let result = sqlx::query("DELETE FROM vm_leases WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    vm_id: String,
    owner: String,
    acquired_at: i64,
    expires_at: i64,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Self {
            vm_id: row.vm_id,
            owner: row.owner,
            acquired_at: DateTime::from_timestamp(row.acquired_at, 0).unwrap_or_default(),
            expires_at: DateTime::from_timestamp(row.expires_at, 0).unwrap_or_default(),
        }
    }
}
