//! Core types for refsync

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Unique identifier for a library
pub type LibraryId = i64;

/// Unique identifier for an item row
pub type ItemId = i64;

/// Unique identifier for a remote connection
pub type ConnectionId = i64;

/// Field map carried by every item (title, creators, date, tags, collections, ...)
pub type ItemPayload = HashMap<String, serde_json::Value>;

/// Identity of an item within the sync domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub library_id: LibraryId,
    /// Key assigned by the external service (8-char uppercase alphanumeric)
    pub external_key: String,
}

impl ItemKey {
    pub fn new(library_id: LibraryId, external_key: impl Into<String>) -> Self {
        Self {
            library_id,
            external_key: external_key.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.library_id, self.external_key)
    }
}

/// External key length enforced by the remote service
pub const EXTERNAL_KEY_LENGTH: usize = 8;

static EXTERNAL_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9]{8}$").expect("valid external key regex"));

/// External key validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    Empty,
    WrongLength,
    InvalidChars,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::Empty => write!(f, "External key cannot be empty"),
            KeyError::WrongLength => {
                write!(f, "External key must be {} characters", EXTERNAL_KEY_LENGTH)
            }
            KeyError::InvalidChars => {
                write!(f, "External key can only contain A-Z and 0-9")
            }
        }
    }
}

impl std::error::Error for KeyError {}

/// Normalize and validate an external item key
///
/// Rules:
/// - Trim whitespace and convert to uppercase
/// - Exactly 8 characters from [A-Z0-9]
pub fn normalize_external_key(s: &str) -> Result<String, KeyError> {
    let normalized = s.trim().to_uppercase();

    if normalized.is_empty() {
        return Err(KeyError::Empty);
    }

    if normalized.len() != EXTERNAL_KEY_LENGTH {
        return Err(KeyError::WrongLength);
    }

    if !EXTERNAL_KEY_RE.is_match(&normalized) {
        return Err(KeyError::InvalidChars);
    }

    Ok(normalized)
}

/// Content hash of a payload (SHA256 over a canonical field ordering, truncated)
///
/// Used as a cheap equality probe; two payloads with the same hash are
/// treated as identical for no-op detection.
pub fn payload_hash(payload: &ItemPayload) -> String {
    let ordered: BTreeMap<&String, &serde_json::Value> = payload.iter().collect();
    let mut hasher = Sha256::new();
    for (field, value) in ordered {
        hasher.update(field.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

/// Item type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Bibliographic record (article, book, webpage, ...)
    #[default]
    Record,
    Collection,
    Note,
    Annotation,
    Attachment,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Record => "record",
            ItemKind::Collection => "collection",
            ItemKind::Note => "note",
            ItemKind::Annotation => "annotation",
            ItemKind::Attachment => "attachment",
        }
    }
}

impl std::str::FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "record" => Ok(ItemKind::Record),
            "collection" => Ok(ItemKind::Collection),
            "note" => Ok(ItemKind::Note),
            "annotation" => Ok(ItemKind::Annotation),
            "attachment" => Ok(ItemKind::Attachment),
            _ => Err(format!("Unknown item kind: {}", s)),
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A versioned item in the local store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Local row id
    pub id: ItemId,
    pub library_id: LibraryId,
    pub external_key: String,
    #[serde(rename = "type", default)]
    pub kind: ItemKind,
    /// Local version, strictly monotonic per item
    pub version: i64,
    /// Named fields as JSON
    #[serde(default)]
    pub payload: ItemPayload,
    /// Tombstone flag; deleted items keep their row and history
    #[serde(default)]
    pub deleted: bool,
    /// False while a local change awaits push to the remote
    #[serde(default)]
    pub synced: bool,
    /// Local version at which this row last agreed with the remote; remote
    /// ingestion diffs against this point, not against `version`
    #[serde(default)]
    pub last_synced_version: i64,
    /// Last remote version this row is known to reflect
    pub remote_version: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Cheap equality probe over the payload
    pub fn payload_hash(&self) -> String {
        payload_hash(&self.payload)
    }
}

/// Library kind on the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LibraryKind {
    #[default]
    Personal,
    Group,
}

impl LibraryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryKind::Personal => "personal",
            LibraryKind::Group => "group",
        }
    }
}

impl std::str::FromStr for LibraryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "personal" => Ok(LibraryKind::Personal),
            "group" => Ok(LibraryKind::Group),
            _ => Err(format!("Unknown library kind: {}", s)),
        }
    }
}

/// A synchronized library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: LibraryId,
    pub connection_id: ConnectionId,
    /// Library identifier on the remote service
    pub remote_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: LibraryKind,
    /// Latest remote library version reported by the adapter
    #[serde(default)]
    pub remote_version: i64,
    /// Highest remote version fully ingested locally (<= remote_version)
    #[serde(default)]
    pub sync_cursor: i64,
    /// Conflict resolution strategy applied to writes in this library
    #[serde(default)]
    pub strategy: ResolutionStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credentialed session with one external account
///
/// Secrets live with the adapter implementation, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConnection {
    pub id: ConnectionId,
    pub user_id: String,
    /// Account identifier on the remote service
    pub account_id: String,
    pub label: Option<String>,
    #[serde(default)]
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Origin of a proposed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteSource {
    #[default]
    Local,
    Remote,
}

impl WriteSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteSource::Local => "local",
            WriteSource::Remote => "remote",
        }
    }
}

impl std::str::FromStr for WriteSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(WriteSource::Local),
            "remote" => Ok(WriteSource::Remote),
            _ => Err(format!("Unknown write source: {}", s)),
        }
    }
}

/// Kind of mutation recorded in the modification log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Create,
    #[default]
    Update,
    Delete,
    /// Collection membership change; otherwise an update
    Move,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Create => "create",
            WriteOperation::Update => "update",
            WriteOperation::Delete => "delete",
            WriteOperation::Move => "move",
        }
    }
}

impl std::str::FromStr for WriteOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(WriteOperation::Create),
            "update" => Ok(WriteOperation::Update),
            "delete" => Ok(WriteOperation::Delete),
            "move" => Ok(WriteOperation::Move),
            _ => Err(format!("Unknown write operation: {}", s)),
        }
    }
}

/// A write proposed against the version store
///
/// `base_version` is the version the writer last observed; 0 means the
/// writer expects the item not to exist yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedWrite {
    /// Idempotency token; retries with the same op_id replay the original result
    pub op_id: String,
    pub key: ItemKey,
    /// Item type, used when this write creates the row; updates keep the stored type
    #[serde(rename = "type", default)]
    pub kind: ItemKind,
    pub base_version: i64,
    #[serde(default)]
    pub payload: ItemPayload,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub operation: WriteOperation,
    pub actor: String,
    #[serde(default)]
    pub source: WriteSource,
    /// Remote version this write carries; stored on the row for remote writes
    pub remote_version: Option<i64>,
    /// Set when the write is applied by conflict resolution; recorded in the log
    #[serde(default)]
    pub resolution: Option<ResolutionStrategy>,
    /// Wall-clock instant the writer produced this payload (latest-wins input)
    pub observed_at: DateTime<Utc>,
}

impl ProposedWrite {
    /// Local creation of a new item
    pub fn create(key: ItemKey, kind: ItemKind, payload: ItemPayload, actor: &str) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            key,
            kind,
            base_version: 0,
            payload,
            deleted: false,
            operation: WriteOperation::Create,
            actor: actor.to_string(),
            source: WriteSource::Local,
            remote_version: None,
            resolution: None,
            observed_at: Utc::now(),
        }
    }

    /// Local edit of an existing item
    pub fn update(key: ItemKey, base_version: i64, payload: ItemPayload, actor: &str) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            key,
            kind: ItemKind::Record,
            base_version,
            payload,
            deleted: false,
            operation: WriteOperation::Update,
            actor: actor.to_string(),
            source: WriteSource::Local,
            remote_version: None,
            resolution: None,
            observed_at: Utc::now(),
        }
    }

    /// Local deletion; the payload snapshot at deletion time is retained
    pub fn delete(key: ItemKey, base_version: i64, payload: ItemPayload, actor: &str) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            key,
            kind: ItemKind::Record,
            base_version,
            payload,
            deleted: true,
            operation: WriteOperation::Delete,
            actor: actor.to_string(),
            source: WriteSource::Local,
            remote_version: None,
            resolution: None,
            observed_at: Utc::now(),
        }
    }
}

/// Result of a committed compare-and-swap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedWrite {
    /// Item state after the write
    pub item: Item,
    /// Modification record appended by this write
    pub record: ModificationRecord,
    /// True when an op_id retry returned the previously committed result
    pub replayed: bool,
}

/// One row of the append-only modification log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub id: i64,
    pub op_id: String,
    pub item_id: ItemId,
    pub library_id: LibraryId,
    pub external_key: String,
    pub actor: String,
    pub operation: WriteOperation,
    pub source: WriteSource,
    /// Field-level diff as {"field": {"old": ..., "new": ...}}
    pub diff: Option<serde_json::Value>,
    /// Item version this write produced
    pub resulting_version: i64,
    /// True when the write was applied by conflict resolution
    #[serde(default)]
    pub is_conflict: bool,
    /// Strategy that produced the write, when is_conflict
    pub conflict_resolution: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lock flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Advisory presence; never blocks anyone
    Soft,
    /// Exclusive editing intent; blocks other local writers until released or expired
    Hard,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Soft => "soft",
            LockMode::Hard => "hard",
        }
    }
}

impl std::str::FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "soft" => Ok(LockMode::Soft),
            "hard" => Ok(LockMode::Hard),
            _ => Err(format!("Unknown lock mode: {}", s)),
        }
    }
}

/// What a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Item,
    Library,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Item => "item",
            TargetType::Library => "library",
        }
    }
}

impl std::str::FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "item" => Ok(TargetType::Item),
            "library" => Ok(TargetType::Library),
            _ => Err(format!("Unknown lock target type: {}", s)),
        }
    }
}

/// Lock target: a specific item row or a whole library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockTarget {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub target_id: i64,
}

impl LockTarget {
    pub fn item(item_id: ItemId) -> Self {
        Self {
            target_type: TargetType::Item,
            target_id: item_id,
        }
    }

    pub fn library(library_id: LibraryId) -> Self {
        Self {
            target_type: TargetType::Library,
            target_id: library_id,
        }
    }
}

impl std::fmt::Display for LockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target_type.as_str(), self.target_id)
    }
}

/// A granted lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSession {
    pub id: i64,
    pub target: LockTarget,
    pub mode: LockMode,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Leave pending until a human resolves it
    #[default]
    Manual,
    /// Later wall-clock write wins; loser is retained in the conflict record
    LatestWins,
    /// Field-level union when the racing writes touch disjoint fields
    AutoMerge,
    /// Manual, restricted to actors with admin capability on the library
    AdminDecides,
    /// Manual, restricted to the library owner
    OwnerDecides,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::LatestWins => "latest_wins",
            ResolutionStrategy::AutoMerge => "auto_merge",
            ResolutionStrategy::AdminDecides => "admin_decides",
            ResolutionStrategy::OwnerDecides => "owner_decides",
        }
    }

    /// Strategies whose completion requires a privileged actor
    pub fn requires_privilege(&self) -> bool {
        matches!(
            self,
            ResolutionStrategy::AdminDecides | ResolutionStrategy::OwnerDecides
        )
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(ResolutionStrategy::Manual),
            "latest_wins" | "latest-wins" => Ok(ResolutionStrategy::LatestWins),
            "auto_merge" | "auto-merge" => Ok(ResolutionStrategy::AutoMerge),
            "admin_decides" | "admin-decides" => Ok(ResolutionStrategy::AdminDecides),
            "owner_decides" | "owner-decides" => Ok(ResolutionStrategy::OwnerDecides),
            _ => Err(format!("Unknown resolution strategy: {}", s)),
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a conflict record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    #[default]
    Pending,
    Resolved,
    /// Automatic resolution exhausted its retries; awaiting manual action
    Escalated,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Escalated => "escalated",
        }
    }
}

impl std::str::FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ConflictStatus::Pending),
            "resolved" => Ok(ConflictStatus::Resolved),
            "escalated" => Ok(ConflictStatus::Escalated),
            _ => Err(format!("Unknown conflict status: {}", s)),
        }
    }
}

/// A detected conflict between two writes racing on the same item
///
/// Rows are never deleted; resolution flips the status and records who
/// decided and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// UUID
    pub id: String,
    pub library_id: LibraryId,
    pub item_id: ItemId,
    pub external_key: String,
    /// Version the losing writer based its change on
    pub base_version: i64,
    /// Committed version it collided with
    pub current_version: i64,
    /// Idempotency key of the write that collided; redelivery of the same
    /// operation maps back to this row instead of a duplicate
    pub incoming_op_id: String,
    /// Payload the losing writer proposed
    pub incoming_payload: ItemPayload,
    #[serde(default)]
    pub incoming_deleted: bool,
    pub incoming_actor: String,
    #[serde(default)]
    pub incoming_source: WriteSource,
    /// Payload committed by the winning writer
    pub current_payload: ItemPayload,
    pub current_actor: Option<String>,
    pub strategy: ResolutionStrategy,
    #[serde(default)]
    pub status: ConflictStatus,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// One change fetched from the remote service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub external_key: String,
    #[serde(rename = "type", default)]
    pub kind: ItemKind,
    /// Remote version of this change
    pub version: i64,
    #[serde(default)]
    pub payload: ItemPayload,
    #[serde(default)]
    pub deleted: bool,
    /// Remote-reported author, when the service exposes one
    pub actor: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// One page of remote changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChangeBatch {
    pub changes: Vec<RemoteChange>,
    /// Latest library version on the remote as of this fetch
    pub latest_version: i64,
    /// More pages remain past this one
    #[serde(default)]
    pub has_more: bool,
}

/// Outcome of pushing one local change to the remote
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "outcome")]
pub enum PushOutcome {
    Accepted { remote_version: i64 },
    Rejected { reason: String },
}

/// Sync pass lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PassState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassState::Running => "running",
            PassState::Completed => "completed",
            PassState::Failed => "failed",
            PassState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PassState::Running)
    }
}

impl std::str::FromStr for PassState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(PassState::Running),
            "completed" => Ok(PassState::Completed),
            "failed" => Ok(PassState::Failed),
            "cancelled" => Ok(PassState::Cancelled),
            _ => Err(format!("Unknown pass state: {}", s)),
        }
    }
}

/// Audit row for one sync pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub id: i64,
    pub library_id: LibraryId,
    pub state: PassState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Remote changes examined
    pub processed: i64,
    pub added: i64,
    pub updated: i64,
    pub deleted: i64,
    /// Remote changes parked as pending conflicts
    pub conflicted: i64,
    /// Local changes accepted by the remote
    pub pushed: i64,
    /// Local changes the remote refused; they stay pending
    pub push_rejected: i64,
    pub cursor_before: i64,
    pub cursor_after: i64,
    pub error: Option<String>,
}

/// Configuration for the sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to SQLite database
    pub db_path: String,
    /// Hard lock time-to-live in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: i64,
    /// Interval between expired-lock sweeps in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub lock_sweep_interval_ms: u64,
    /// CAS retries before an automatic resolution escalates to manual
    #[serde(default = "default_resolve_retries")]
    pub resolve_max_retries: u32,
    /// Quiet period after a local edit before the worker schedules a pass
    #[serde(default = "default_sync_debounce")]
    pub sync_debounce_ms: u64,
    /// Periodic background pass interval in milliseconds (0 disables)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,
    /// Broadcast capacity of the event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_lock_ttl() -> i64 {
    300
}

fn default_sweep_interval() -> u64 {
    30_000
}

fn default_resolve_retries() -> u32 {
    3
}

fn default_sync_debounce() -> u64 {
    5000
}

fn default_sync_interval() -> u64 {
    300_000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "refsync.db".to_string(),
            lock_ttl_seconds: default_lock_ttl(),
            lock_sweep_interval_ms: default_sweep_interval(),
            resolve_max_retries: default_resolve_retries(),
            sync_debounce_ms: default_sync_debounce(),
            sync_interval_ms: default_sync_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}
