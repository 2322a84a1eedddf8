//! Process-wide memory budget: named byte pools gating in-flight data.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

/// Pool shared by every sink writer in the agent. Backpressures fast
/// sources across the whole process rather than per instance.
pub const AGENT_GLOBAL_WRITER_PERMIT: &str = "agent.global.writer.permit";

struct Pool {
    capacity: usize,
    used: AtomicUsize,
}

/// Registry of named byte pools. Acquisition is non-blocking; callers spin
/// with their own backoff when a pool is exhausted.
///
/// Threaded through construction as an explicit `Arc` handle.
#[derive(Default)]
pub struct MemoryBudget {
    pools: DashMap<String, Pool>,
}

impl MemoryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool with a fixed byte capacity. The first registration
    /// of a name wins.
    pub fn register(&self, name: &str, capacity: usize) {
        if self.pools.contains_key(name) {
            warn!(pool = name, "memory pool already registered, keeping existing capacity");
            return;
        }
        self.pools.insert(
            name.to_string(),
            Pool {
                capacity,
                used: AtomicUsize::new(0),
            },
        );
        info!(pool = name, capacity, "registered memory pool");
    }

    /// Try to reserve `n` bytes. Returns false when the pool is unknown or
    /// the reservation would exceed capacity.
    pub fn try_acquire(&self, name: &str, n: usize) -> bool {
        let Some(pool) = self.pools.get(name) else {
            warn!(pool = name, "try_acquire on unregistered memory pool");
            return false;
        };
        let mut current = pool.used.load(Ordering::Acquire);
        loop {
            if current + n > pool.capacity {
                return false;
            }
            match pool.used.compare_exchange(
                current,
                current + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Return `n` bytes to the pool. Never blocks; releasing more than is
    /// held clamps to zero and logs.
    pub fn release(&self, name: &str, n: usize) {
        let Some(pool) = self.pools.get(name) else {
            warn!(pool = name, "release on unregistered memory pool");
            return;
        };
        let prev = pool
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(n))
            })
            .unwrap_or(0);
        if prev < n {
            warn!(pool = name, released = n, held = prev, "released more than held");
        }
    }

    pub fn used(&self, name: &str) -> usize {
        self.pools
            .get(name)
            .map(|pool| pool.used.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn capacity(&self, name: &str) -> usize {
        self.pools.get(name).map(|pool| pool.capacity).unwrap_or(0)
    }

    /// Log the pool's occupancy, tagged with the caller's context.
    pub fn report(&self, name: &str, tag: &str) {
        if let Some(pool) = self.pools.get(name) {
            info!(
                pool = name,
                tag,
                used = pool.used.load(Ordering::Acquire),
                capacity = pool.capacity,
                "memory pool occupancy"
            );
        }
    }
}
