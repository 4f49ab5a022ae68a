//! Write classification
//!
//! Every proposed write is classified against the stored row before any
//! mutation happens: clean writes go straight to CAS, stale writes with
//! disjoint change sets get a precomputed merge, everything else is a
//! conflict for the resolver to dispatch on.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::locks::live_hard_lock;
use crate::storage::{history, version_store, Storage};
use crate::sync::merge;
use crate::types::{Item, ItemPayload, LockSession, LockTarget, ProposedWrite, WriteSource};

/// Why a proposed write collided
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ConflictReason {
    /// Histories cannot be aligned: a create race, or the log does not
    /// cover the span between base and current
    VersionRace,
    /// Both sides changed the same fields
    OverlappingFields,
    /// One side deleted while the other edited
    DeleteRace,
    /// A live hard lock belongs to someone else
    HardLockHeld {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl ConflictReason {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictReason::VersionRace => "version_race",
            ConflictReason::OverlappingFields => "overlapping_fields",
            ConflictReason::DeleteRace => "delete_race",
            ConflictReason::HardLockHeld { .. } => "hard_lock_held",
        }
    }
}

/// Outcome of classifying a proposed write
#[derive(Debug, Clone)]
pub enum Detection {
    /// Base matches the stored version (or the item is new); CAS may proceed
    Clean { current: Option<Item> },
    /// Stale, but the two change sets touch disjoint fields
    StaleMergeable {
        current: Item,
        merged_payload: ItemPayload,
    },
    /// A collision the resolution strategy has to decide on
    Conflicting {
        current: Option<Item>,
        reason: ConflictReason,
    },
}

/// Classifies writes against current row state, history, and locks
#[derive(Clone)]
pub struct ConflictDetector {
    storage: Storage,
    events: EventBus,
}

impl ConflictDetector {
    pub fn new(storage: Storage, events: EventBus) -> Self {
        Self { storage, events }
    }

    pub fn classify(&self, write: &ProposedWrite) -> Result<Detection> {
        self.storage
            .with_connection(|conn| self.classify_in(conn, write))
    }

    pub(crate) fn classify_in(&self, conn: &Connection, write: &ProposedWrite) -> Result<Detection> {
        let now = Utc::now();
        let current = version_store::get_by_key(conn, &write.key)?;

        // Hard locks gate local writers only; the remote side is the
        // authoritative source and applies regardless, with the holder told
        if let Some(session) = blocking_lock(conn, write, current.as_ref(), now)? {
            match write.source {
                WriteSource::Local => {
                    tracing::debug!(
                        key = %write.key,
                        holder = %session.holder,
                        "write blocked by hard lock"
                    );
                    return Ok(Detection::Conflicting {
                        current,
                        reason: ConflictReason::HardLockHeld {
                            holder: session.holder,
                            expires_at: session.expires_at,
                        },
                    });
                }
                WriteSource::Remote => {
                    self.events.publish(EngineEvent::lock_overridden(
                        session.target,
                        &session.holder,
                        write.key.library_id,
                        &write.key.external_key,
                    ));
                }
            }
        }

        let Some(current) = current else {
            if write.base_version != 0 {
                return Err(SyncError::InvalidInput(format!(
                    "base version {} for absent item {}",
                    write.base_version, write.key
                )));
            }
            return Ok(Detection::Clean { current: None });
        };

        if write.base_version == current.version {
            return Ok(Detection::Clean {
                current: Some(current),
            });
        }

        if write.base_version > current.version {
            return Err(SyncError::InvalidInput(format!(
                "base version {} is ahead of stored version {} for {}",
                write.base_version, current.version, write.key
            )));
        }

        // Stale from here on: the row moved since the writer read it

        if write.base_version == 0 {
            // Two sides created the same key independently
            return Ok(Detection::Conflicting {
                current: Some(current),
                reason: ConflictReason::VersionRace,
            });
        }

        if write.deleted && current.deleted {
            // Both sides agree the item is gone
            return Ok(Detection::StaleMergeable {
                merged_payload: current.payload.clone(),
                current,
            });
        }

        if write.deleted || current.deleted {
            return Ok(Detection::Conflicting {
                current: Some(current),
                reason: ConflictReason::DeleteRace,
            });
        }

        let records =
            history::records_between(conn, current.id, write.base_version, current.version)?;
        if records.len() as i64 != current.version - write.base_version {
            // Log does not cover the span; no trustworthy base to merge from
            return Ok(Detection::Conflicting {
                current: Some(current),
                reason: ConflictReason::VersionRace,
            });
        }

        let intervening: BTreeSet<String> = records
            .iter()
            .filter_map(|r| r.diff.as_ref())
            .flat_map(history::diff_keys)
            .collect();

        let base_payload = merge::rewind_payload(&current.payload, &records);
        let proposed_fields = merge::changed_fields(&base_payload, &write.payload);

        let overlap: BTreeSet<&String> = intervening.intersection(&proposed_fields).collect();

        if overlap.is_empty() {
            let merged_payload =
                merge::apply_changes(&current.payload, &base_payload, &write.payload);
            return Ok(Detection::StaleMergeable {
                merged_payload,
                current,
            });
        }

        // Tag arrays are the one overlap merged structurally, by union
        if overlap.len() == 1 && overlap.contains(&merge::TAGS_FIELD.to_string()) {
            if let Some(tags) = merge::union_tags(
                current.payload.get(merge::TAGS_FIELD),
                write.payload.get(merge::TAGS_FIELD),
            ) {
                let mut merged_payload =
                    merge::apply_changes(&current.payload, &base_payload, &write.payload);
                merged_payload.insert(merge::TAGS_FIELD.to_string(), tags);
                return Ok(Detection::StaleMergeable {
                    merged_payload,
                    current,
                });
            }
        }

        Ok(Detection::Conflicting {
            current: Some(current),
            reason: ConflictReason::OverlappingFields,
        })
    }
}

/// Live hard lock held by someone other than the writer, if any
///
/// A library-level lock covers every item in it; an item-level lock only
/// exists once the row does.
fn blocking_lock(
    conn: &Connection,
    write: &ProposedWrite,
    current: Option<&Item>,
    now: DateTime<Utc>,
) -> Result<Option<LockSession>> {
    if let Some(session) = live_hard_lock(conn, LockTarget::library(write.key.library_id), now)? {
        if session.holder != write.actor {
            return Ok(Some(session));
        }
    }

    if let Some(item) = current {
        if let Some(session) = live_hard_lock(conn, LockTarget::item(item.id), now)? {
            if session.holder != write.actor {
                return Ok(Some(session));
            }
        }
    }

    Ok(None)
}
