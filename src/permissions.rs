//! Capability checks for conflict resolution
//!
//! Who may complete a parked conflict depends on the library's strategy:
//! admin-decides wants an administrator, owner-decides wants the library
//! owner, everything else takes any actor. The engine asks a
//! [`PermissionResolver`] at resolution time; wire formats and session
//! handling live outside this crate.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::{LibraryId, ResolutionStrategy};

/// What an actor is allowed to do within one library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read items and history
    Read,
    /// Propose writes
    Write,
    /// Complete pending conflicts
    Resolve,
    /// Administrative actions, including admin-decides conflicts
    Admin,
    /// Library ownership, required by owner-decides conflicts
    Owner,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Resolve => "resolve",
            Capability::Admin => "admin",
            Capability::Owner => "owner",
        }
    }
}

/// Capability a privileged strategy demands from whoever completes it
///
/// `None` for ordinary strategies; any actor may resolve those.
pub fn required_capability(strategy: ResolutionStrategy) -> Option<Capability> {
    match strategy {
        ResolutionStrategy::AdminDecides => Some(Capability::Admin),
        ResolutionStrategy::OwnerDecides => Some(Capability::Owner),
        _ => None,
    }
}

/// A set of capabilities granted to one actor in one library
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    capabilities: HashSet<Capability>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_capabilities(capabilities: Vec<Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Read access only
    pub fn read_only() -> Self {
        Self::from_capabilities(vec![Capability::Read])
    }

    /// Read and propose writes, but never settle disputes
    pub fn contributor() -> Self {
        Self::from_capabilities(vec![Capability::Read, Capability::Write])
    }

    /// Everything short of ownership
    pub fn admin() -> Self {
        Self::from_capabilities(vec![
            Capability::Read,
            Capability::Write,
            Capability::Resolve,
            Capability::Admin,
        ])
    }

    /// The library owner; passes every check including owner-decides
    pub fn owner() -> Self {
        Self::from_capabilities(vec![
            Capability::Read,
            Capability::Write,
            Capability::Resolve,
            Capability::Admin,
            Capability::Owner,
        ])
    }

    pub fn add(&mut self, capability: Capability) {
        self.capabilities.insert(capability);
    }

    pub fn remove(&mut self, capability: Capability) {
        self.capabilities.remove(&capability);
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn merge(&mut self, other: &PermissionSet) {
        self.capabilities.extend(other.capabilities.iter().cloned());
    }
}

/// Maps an actor to their capabilities in a library
pub trait PermissionResolver: Send + Sync {
    fn resolve_actor_permissions(&self, actor: &str, library_id: LibraryId) -> PermissionSet;
}

/// Fixed grants, used by tests and the single-user CLI
#[derive(Default)]
pub struct StaticPermissions {
    grants: HashMap<(String, LibraryId), PermissionSet>,
    fallback: PermissionSet,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unlisted actor gets the full owner set; single-user mode
    pub fn permissive() -> Self {
        Self {
            grants: HashMap::new(),
            fallback: PermissionSet::owner(),
        }
    }

    /// Capabilities for actors not explicitly listed
    pub fn with_fallback(mut self, fallback: PermissionSet) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn grant(mut self, actor: &str, library_id: LibraryId, set: PermissionSet) -> Self {
        self.grants.insert((actor.to_string(), library_id), set);
        self
    }
}

impl PermissionResolver for StaticPermissions {
    fn resolve_actor_permissions(&self, actor: &str, library_id: LibraryId) -> PermissionSet {
        self.grants
            .get(&(actor.to_string(), library_id))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
