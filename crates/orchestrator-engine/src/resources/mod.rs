//! Resource Pool (C2): admission control over a fixed capacity vector
//! (§4.2). A single `parking_lot::Mutex` guards the capacity and active
//! allocations — the critical section already makes the operation
//! effectively single-threaded, so `dashmap` (used elsewhere for C3's
//! topic registry and C6's agent table) is not needed here.

use std::collections::HashMap;

use chrono::Utc;
use orchestrator_contracts::{ResourceAllocation, ResourceRequirement};
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("insufficient capacity: requested {requested:?} exceeds available {available:?}")]
    InsufficientCapacity {
        requested: ResourceRequirement,
        available: ResourceRequirement,
    },
}

struct PoolState {
    capacity: ResourceRequirement,
    active: HashMap<String, ResourceRequirement>,
}

pub struct ResourcePool {
    state: Mutex<PoolState>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
    pub storage: f64,
}

impl ResourcePool {
    pub fn new(capacity: ResourceRequirement) -> Self {
        Self {
            state: Mutex::new(PoolState {
                capacity,
                active: HashMap::new(),
            }),
        }
    }

    /// Deterministic, non-blocking admission check (§4.2): no implicit
    /// queueing, the orchestrator is responsible for any waiting.
    pub fn allocate(&self, request_id: impl Into<String>, requirement: ResourceRequirement) -> ResourceAllocation {
        let request_id = request_id.into();
        let mut state = self.state.lock();

        let used = state.active.values().fold(ResourceRequirement::zero(), |acc, r| acc.add(r));
        let projected = used.add(&requirement);

        if projected.fits_within(&state.capacity) {
            state.active.insert(request_id.clone(), requirement);
            ResourceAllocation {
                id: request_id,
                requirement,
                allocated_at: Utc::now(),
                success: true,
                failure_reason: None,
            }
        } else {
            ResourceAllocation {
                id: request_id,
                requirement,
                allocated_at: Utc::now(),
                success: false,
                failure_reason: Some(format!(
                    "requested {requirement:?} would exceed capacity {:?} (in use: {used:?})",
                    state.capacity
                )),
            }
        }
    }

    /// No-op if the allocation id is absent (§4.2, idempotence property 7).
    pub fn release(&self, allocation_id: &str) {
        self.state.lock().active.remove(allocation_id);
    }

    pub fn utilization(&self) -> Utilization {
        let state = self.state.lock();
        let used = state.active.values().fold(ResourceRequirement::zero(), |acc, r| acc.add(r));
        Utilization {
            cpu: safe_ratio(used.cpu, state.capacity.cpu),
            memory: safe_ratio(used.memory_mb, state.capacity.memory_mb),
            gpu: safe_ratio(used.gpu, state.capacity.gpu),
            storage: safe_ratio(used.storage_mb, state.capacity.storage_mb),
        }
    }

    pub fn capacity(&self) -> ResourceRequirement {
        self.state.lock().capacity
    }
}

fn safe_ratio(used: f64, capacity: f64) -> f64 {
    if capacity <= 0.0 {
        0.0
    } else {
        used / capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_denies_when_over_capacity() {
        let pool = ResourcePool::new(ResourceRequirement::new(2.0, 1024.0, 0.0, 0.0));
        let alloc = pool.allocate("req-1", ResourceRequirement::new(4.0, 0.0, 0.0, 0.0));
        assert!(!alloc.success);
        assert!(alloc.failure_reason.is_some());
    }

    #[test]
    fn release_is_idempotent() {
        let pool = ResourcePool::new(ResourceRequirement::new(4.0, 4096.0, 0.0, 0.0));
        let alloc = pool.allocate("req-1", ResourceRequirement::new(1.0, 0.0, 0.0, 0.0));
        assert!(alloc.success);

        pool.release("req-1");
        pool.release("req-1");
        assert_eq!(pool.utilization().cpu, 0.0);
    }

    #[test]
    fn sum_of_active_allocations_never_exceeds_capacity() {
        let pool = ResourcePool::new(ResourceRequirement::new(4.0, 0.0, 0.0, 0.0));
        assert!(pool.allocate("a", ResourceRequirement::new(3.0, 0.0, 0.0, 0.0)).success);
        assert!(!pool.allocate("b", ResourceRequirement::new(2.0, 0.0, 0.0, 0.0)).success);
        assert!(pool.allocate("c", ResourceRequirement::new(1.0, 0.0, 0.0, 0.0)).success);
    }
}
