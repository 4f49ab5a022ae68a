//! Soft and hard locks over items and libraries
//!
//! Soft locks are presence markers; any number of holders can announce
//! editing intent. Hard locks are exclusive with a TTL; expiry is the only
//! way a crashed holder's lock is reclaimed. Acquisition runs in one
//! transaction against the single write connection, so grant and denial
//! cannot race.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, SyncError};
use crate::storage::Storage;
use crate::types::{LockMode, LockSession, LockTarget, TargetType};

/// Parse a lock session from a database row
fn lock_from_row(row: &Row) -> rusqlite::Result<LockSession> {
    let target_type_str: String = row.get("target_type")?;
    let mode_str: String = row.get("mode")?;
    let acquired_at: String = row.get("acquired_at")?;
    let expires_at: String = row.get("expires_at")?;

    Ok(LockSession {
        id: row.get("id")?,
        target: LockTarget {
            target_type: target_type_str.parse().unwrap_or(TargetType::Item),
            target_id: row.get("target_id")?,
        },
        mode: mode_str.parse().unwrap_or(LockMode::Soft),
        holder: row.get("holder")?,
        acquired_at: DateTime::parse_from_rfc3339(&acquired_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Lock manager backed by the shared storage handle
#[derive(Clone)]
pub struct LockManager {
    storage: Storage,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(storage: Storage, default_ttl_seconds: i64) -> Self {
        Self {
            storage,
            default_ttl: Duration::seconds(default_ttl_seconds),
        }
    }

    fn ttl(&self, ttl_seconds: Option<i64>) -> Duration {
        ttl_seconds.map(Duration::seconds).unwrap_or(self.default_ttl)
    }

    /// Announce editing presence; multiple holders may coexist
    ///
    /// Re-announcing refreshes the expiry.
    pub fn acquire_soft(
        &self,
        target: LockTarget,
        holder: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<LockSession> {
        let now = Utc::now();
        let expires_at = now + self.ttl(ttl_seconds);

        self.storage.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO lock_sessions (target_type, target_id, mode, holder, acquired_at, expires_at)
                 VALUES (?, ?, 'soft', ?, ?, ?)
                 ON CONFLICT(target_type, target_id, holder, mode)
                 DO UPDATE SET expires_at = excluded.expires_at",
                params![
                    target.target_type.as_str(),
                    target.target_id,
                    holder,
                    now.to_rfc3339(),
                    expires_at.to_rfc3339(),
                ],
            )?;

            get_session(conn, target, holder, LockMode::Soft)?.ok_or_else(|| {
                SyncError::Internal(format!("soft lock on {} vanished after upsert", target))
            })
        })
    }

    /// Acquire exclusive editing intent on a target
    ///
    /// Expired rows for the target are swept first, so a crashed holder's
    /// lock is reclaimable as soon as its TTL lapses. Reacquisition by the
    /// current holder extends the expiry.
    pub fn acquire_hard(
        &self,
        target: LockTarget,
        holder: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<LockSession> {
        let now = Utc::now();
        let expires_at = now + self.ttl(ttl_seconds);

        self.storage.with_transaction(|conn| {
            conn.execute(
                "DELETE FROM lock_sessions
                 WHERE target_type = ? AND target_id = ? AND mode = 'hard' AND expires_at <= ?",
                params![target.target_type.as_str(), target.target_id, now.to_rfc3339()],
            )?;

            if let Some(existing) = live_hard_lock(conn, target, now)? {
                if existing.holder == holder {
                    conn.execute(
                        "UPDATE lock_sessions SET expires_at = ? WHERE id = ?",
                        params![expires_at.to_rfc3339(), existing.id],
                    )?;
                    return Ok(LockSession {
                        expires_at,
                        ..existing
                    });
                }
                return Err(SyncError::LockDenied {
                    holder: existing.holder,
                    expires_at: existing.expires_at,
                });
            }

            conn.execute(
                "INSERT INTO lock_sessions (target_type, target_id, mode, holder, acquired_at, expires_at)
                 VALUES (?, ?, 'hard', ?, ?, ?)",
                params![
                    target.target_type.as_str(),
                    target.target_id,
                    holder,
                    now.to_rfc3339(),
                    expires_at.to_rfc3339(),
                ],
            )?;

            tracing::debug!(target = %target, holder, "hard lock acquired");

            get_session(conn, target, holder, LockMode::Hard)?.ok_or_else(|| {
                SyncError::Internal(format!("hard lock on {} vanished after insert", target))
            })
        })
    }

    /// Extend a held hard lock; denied when the lock was lost
    pub fn heartbeat(&self, target: LockTarget, holder: &str) -> Result<LockSession> {
        let now = Utc::now();
        let expires_at = now + self.default_ttl;

        self.storage.with_transaction(|conn| {
            let changed = conn.execute(
                "UPDATE lock_sessions SET expires_at = ?
                 WHERE target_type = ? AND target_id = ? AND mode = 'hard'
                   AND holder = ? AND expires_at > ?",
                params![
                    expires_at.to_rfc3339(),
                    target.target_type.as_str(),
                    target.target_id,
                    holder,
                    now.to_rfc3339(),
                ],
            )?;

            if changed == 1 {
                return get_session(conn, target, holder, LockMode::Hard)?.ok_or_else(|| {
                    SyncError::Internal(format!("hard lock on {} vanished after heartbeat", target))
                });
            }

            // Lost the lock: either expired (and maybe taken over) or released
            match live_hard_lock(conn, target, now)? {
                Some(other) => Err(SyncError::LockDenied {
                    holder: other.holder,
                    expires_at: other.expires_at,
                }),
                None => Err(SyncError::NotFound(format!("hard lock on {}", target))),
            }
        })
    }

    /// Drop a holder's lock of the given mode; false when nothing was held
    pub fn release(&self, target: LockTarget, holder: &str, mode: LockMode) -> Result<bool> {
        self.storage.with_connection(|conn| {
            let changed = conn.execute(
                "DELETE FROM lock_sessions
                 WHERE target_type = ? AND target_id = ? AND holder = ? AND mode = ?",
                params![
                    target.target_type.as_str(),
                    target.target_id,
                    holder,
                    mode.as_str(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Current live hard lock on a target, if any
    pub fn hard_holder(&self, target: LockTarget) -> Result<Option<LockSession>> {
        let now = Utc::now();
        self.storage
            .with_connection(|conn| live_hard_lock(conn, target, now))
    }

    /// Live soft presence on a target
    pub fn soft_holders(&self, target: LockTarget) -> Result<Vec<LockSession>> {
        let now = Utc::now();
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, target_type, target_id, mode, holder, acquired_at, expires_at
                 FROM lock_sessions
                 WHERE target_type = ? AND target_id = ? AND mode = 'soft' AND expires_at > ?
                 ORDER BY acquired_at",
            )?;

            let sessions: Vec<LockSession> = stmt
                .query_map(
                    params![target.target_type.as_str(), target.target_id, now.to_rfc3339()],
                    lock_from_row,
                )?
                .filter_map(|r| r.ok())
                .collect();
            Ok(sessions)
        })
    }

    /// Remove every expired lock row; returns how many were reclaimed
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        self.storage.with_connection(|conn| {
            let removed = conn.execute(
                "DELETE FROM lock_sessions WHERE expires_at <= ?",
                params![now],
            )?;
            Ok(removed)
        })
    }

    /// Periodic expiry sweep as a background task
    pub fn spawn_sweeper(&self, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(100)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match manager.sweep_expired() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(reclaimed = n, "expired locks swept"),
                    Err(e) => tracing::warn!("lock sweep failed: {}", e),
                }
            }
        })
    }
}

fn get_session(
    conn: &Connection,
    target: LockTarget,
    holder: &str,
    mode: LockMode,
) -> Result<Option<LockSession>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, target_type, target_id, mode, holder, acquired_at, expires_at
         FROM lock_sessions
         WHERE target_type = ? AND target_id = ? AND holder = ? AND mode = ?",
    )?;

    Ok(stmt
        .query_row(
            params![
                target.target_type.as_str(),
                target.target_id,
                holder,
                mode.as_str()
            ],
            lock_from_row,
        )
        .optional()?)
}

pub(crate) fn live_hard_lock(
    conn: &Connection,
    target: LockTarget,
    now: DateTime<Utc>,
) -> Result<Option<LockSession>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, target_type, target_id, mode, holder, acquired_at, expires_at
         FROM lock_sessions
         WHERE target_type = ? AND target_id = ? AND mode = 'hard' AND expires_at > ?",
    )?;

    Ok(stmt
        .query_row(
            params![target.target_type.as_str(), target.target_id, now.to_rfc3339()],
            lock_from_row,
        )
        .optional()?)
}
