//! Process-wide lease over a named resource, kept alive by a heartbeat row.
//!
//! The Telegram user session must never be driven from two processes at
//! once. Whoever holds the `actor_leases` row owns it; a row whose heartbeat
//! is older than [`STALE_AFTER`] may be taken over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::error::{CoreError, CoreResult};

pub const STALE_AFTER: Duration = Duration::from_secs(90);
pub const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);

pub fn try_acquire(conn: &mut Connection, name: &str, owner: &str) -> CoreResult<()> {
    try_acquire_at(conn, name, owner, Utc::now())
}

pub fn try_acquire_at(
    conn: &mut Connection,
    name: &str,
    owner: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current: Option<(String, DateTime<Utc>)> = tx
        .query_row(
            "SELECT owner_id, heartbeat_at FROM actor_leases WHERE name = ?",
            [name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((holder, heartbeat_at)) = current {
        let age = now.signed_duration_since(heartbeat_at);
        let fresh = age.to_std().map(|a| a < STALE_AFTER).unwrap_or(true);
        if holder != owner && fresh {
            return Err(CoreError::LeaseHeld {
                name: name.to_string(),
                owner: holder,
            });
        }
        if holder != owner {
            warn!(lease = name, previous = %holder, "taking over stale lease");
        }
    }
    tx.execute(
        "INSERT INTO actor_leases(name, owner_id, heartbeat_at) VALUES(?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET owner_id = excluded.owner_id,
                                         heartbeat_at = excluded.heartbeat_at",
        params![name, owner, now],
    )?;
    tx.commit()?;
    Ok(())
}

/// Refreshes the heartbeat; fails if another process took the lease over.
pub fn heartbeat(conn: &Connection, name: &str, owner: &str) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE actor_leases SET heartbeat_at = ? WHERE name = ? AND owner_id = ?",
        params![Utc::now(), name, owner],
    )?;
    if changed == 0 {
        return Err(CoreError::LeaseHeld {
            name: name.to_string(),
            owner: "another process".into(),
        });
    }
    Ok(())
}

pub fn release(conn: &Connection, name: &str, owner: &str) -> CoreResult<()> {
    conn.execute(
        "DELETE FROM actor_leases WHERE name = ? AND owner_id = ?",
        params![name, owner],
    )?;
    Ok(())
}

/// A held lease. Heartbeats in the background and releases on drop.
///
/// Once a heartbeat finds the row owned by someone else the lease is marked
/// lost for good; [`ActorLease::is_held`] reports that to callers.
pub struct ActorLease {
    db: Db,
    name: String,
    owner: String,
    lost: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

async fn beat(db: &Db, name: &str, owner: &str, lost: &AtomicBool) -> CoreResult<()> {
    let (n, o) = (name.to_string(), owner.to_string());
    let res = db.call(move |conn| heartbeat(conn, &n, &o)).await;
    if let Err(CoreError::LeaseHeld { .. }) = &res {
        lost.store(true, Ordering::SeqCst);
    }
    res
}

impl ActorLease {
    pub async fn acquire(db: Db, name: &str) -> CoreResult<Self> {
        let owner = uuid::Uuid::new_v4().to_string();
        {
            let (name, owner) = (name.to_string(), owner.clone());
            db.call(move |conn| try_acquire(conn, &name, &owner)).await?;
        }
        info!(lease = name, %owner, "lease acquired");

        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat_task = {
            let (db, name, owner, lost) = (db.clone(), name.to_string(), owner.clone(), lost.clone());
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(HEARTBEAT_EVERY);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    match beat(&db, &name, &owner, &lost).await {
                        Ok(()) => debug!(lease = %name, "heartbeat"),
                        Err(e @ CoreError::LeaseHeld { .. }) => {
                            error!(lease = %name, error = %e, "lease lost, stopping heartbeat");
                            break;
                        }
                        Err(e) => warn!(lease = %name, error = %e, "lease heartbeat failed"),
                    }
                }
            })
        };

        Ok(Self {
            db,
            name: name.to_string(),
            owner,
            lost,
            heartbeat: heartbeat_task,
        })
    }

    pub fn is_held(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    /// Heartbeats right away instead of waiting for the next tick.
    pub async fn refresh(&self) -> CoreResult<()> {
        if !self.is_held() {
            return Err(CoreError::LeaseHeld {
                name: self.name.clone(),
                owner: "another process".into(),
            });
        }
        beat(&self.db, &self.name, &self.owner, &self.lost).await
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for ActorLease {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if let Err(e) = self.db.blocking(|conn| release(conn, &self.name, &self.owner)) {
            warn!(lease = %self.name, error = %e, "failed to release lease");
        }
    }
}
