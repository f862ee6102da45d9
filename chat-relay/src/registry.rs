//! Membership tracking for live relay connections.
//!
//! The registry maps each connection id to the handle used to push messages
//! to that connection. Broadcasts never iterate the map directly; they take a
//! [`ConnectionRegistry::snapshot`] and release the lock before sending.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::error;

/// Opaque identifier the hub assigns to a connection when it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Source of connection ids. Implementations must never hand out the same id twice.
pub trait ConnectionIds: Send + Sync + 'static {
    fn next_id(&self) -> ConnectionId;
}

/// Monotonic counter starting at 1. Ids are never recycled.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIds for SequentialIds {
    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two live sessions were given the same id. The id generator is broken.
    #[error("connection id {0} is already registered")]
    DuplicateIdentity(ConnectionId),
}

/// Thread-safe `ConnectionId -> handle` map.
///
/// A single `RwLock` guards the map. `add` and `remove` hold the write lock
/// for constant-time map operations; `snapshot` holds the read lock only while cloning
/// the handles out.
///
/// A poisoned lock is recovered rather than propagated: no critical section
/// can panic between map operations, so the map is never left half-updated.
pub struct ConnectionRegistry<H> {
    entries: RwLock<HashMap<ConnectionId, H>>,
}

impl<H: Clone> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handle` under `id`.
    ///
    /// If `id` is already registered the new handle is rejected and the
    /// existing entry is put back before the write lock is released, so the
    /// live connection never drops out of the registry. The collision is
    /// reported as [`RegistryError::DuplicateIdentity`].
    pub fn add(&self, id: ConnectionId, handle: H) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(previous) = entries.insert(id, handle) else {
            return Ok(());
        };
        entries.insert(id, previous);
        drop(entries);

        error!(connection = %id, "duplicate connection id registered");
        Err(RegistryError::DuplicateIdentity(id))
    }

    /// Removes `id` if present. Returns whether an entry was removed.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Copies out every registered handle. Later adds and removes do not
    /// affect the returned vector.
    pub fn snapshot(&self) -> Vec<(ConnectionId, H)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Clone> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
