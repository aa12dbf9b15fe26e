//! Node handles and lock timeouts.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Source of uniqueness nonces for freshly minted handles.
static UNIQUE_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Durable identifier of a stored node.
///
/// A handle pairs the storage slot id with a uniqueness nonce. Two handles are
/// equal only when both fields match, so a slot that was freed and reused
/// never aliases a stale handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageHandle {
    /// Storage slot identifier.
    pub id: u32,
    /// Uniqueness nonce.
    pub unique: u32,
}

impl StorageHandle {
    /// Size of a serialized handle in bytes.
    pub const SIZE: usize = 8;

    /// Creates a handle for `id` with a fresh nonce.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            unique: UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Creates a handle from both parts, as read back from storage.
    pub fn from_parts(id: u32, unique: u32) -> Self {
        Self { id, unique }
    }

    /// Returns the handle packed into a u64.
    pub fn as_u64(&self) -> u64 {
        ((self.id as u64) << 32) | (self.unique as u64)
    }

    /// Unpacks a handle from its u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            id: (value >> 32) as u32,
            unique: value as u32,
        }
    }
}

impl std::fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.unique)
    }
}

/// Maximum time to wait for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    /// Wait forever.
    Infinite,
    /// Give up after the duration elapses.
    After(Duration),
}

impl LockTimeout {
    /// Converts a millisecond setting where -1 means infinite.
    pub fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            LockTimeout::Infinite
        } else {
            LockTimeout::After(Duration::from_millis(millis as u64))
        }
    }

    /// Returns the timeout in milliseconds, -1 when infinite.
    pub fn as_millis(&self) -> i64 {
        match self {
            LockTimeout::Infinite => -1,
            LockTimeout::After(d) => d.as_millis() as i64,
        }
    }
}

impl Default for LockTimeout {
    fn default() -> Self {
        LockTimeout::After(Duration::from_secs(120))
    }
}
