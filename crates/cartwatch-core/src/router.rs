//! Partition routing: session key → owning worker.
//!
//! A pure, stable hash (FNV-1a) over the session key modulo the worker
//! count. Stability matters more than distribution quality here: the same
//! key must map to the same worker for the lifetime of the process, across
//! restarts, and independent of `HashMap` seed randomization — which is why
//! `std::hash::DefaultHasher` is not used.

use crate::error::RoutingError;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a hash of a byte string.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic session-key → worker-index router.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    workers: usize,
}

impl PartitionRouter {
    /// Create a router over `workers` shards.
    pub fn new(workers: usize) -> Result<Self, RoutingError> {
        if workers == 0 {
            return Err(RoutingError::NoWorkers);
        }
        Ok(Self { workers })
    }

    /// Number of worker shards.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Route a session key to its owning worker.
    ///
    /// Guarantee: for a fixed worker count, every call with the same key
    /// returns the same index.
    pub fn route(&self, session_id: &str) -> Result<usize, RoutingError> {
        if session_id.is_empty() {
            return Err(RoutingError::EmptyKey);
        }
        Ok((fnv1a(session_id.as_bytes()) % self.workers as u64) as usize)
    }
}
