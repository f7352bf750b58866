//! Resource requirement/allocation shapes for the admission-control pool (C2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request against the four capacity dimensions the pool tracks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirement {
    pub cpu: f64,
    pub memory_mb: f64,
    pub gpu: f64,
    pub storage_mb: f64,
}

impl ResourceRequirement {
    pub fn new(cpu: f64, memory_mb: f64, gpu: f64, storage_mb: f64) -> Self {
        Self {
            cpu,
            memory_mb,
            gpu,
            storage_mb,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Element-wise addition, used to track running totals of active allocations.
    pub fn add(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu + other.cpu,
            memory_mb: self.memory_mb + other.memory_mb,
            gpu: self.gpu + other.gpu,
            storage_mb: self.storage_mb + other.storage_mb,
        }
    }

    /// True iff `self` fits within `capacity` on every dimension.
    pub fn fits_within(&self, capacity: &Self) -> bool {
        self.cpu <= capacity.cpu
            && self.memory_mb <= capacity.memory_mb
            && self.gpu <= capacity.gpu
            && self.storage_mb <= capacity.storage_mb
    }
}

/// A recorded allocation, held exclusively by its owner until released.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceAllocation {
    pub id: String,
    pub requirement: ResourceRequirement,
    pub allocated_at: DateTime<Utc>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_checks_every_dimension() {
        let cap = ResourceRequirement::new(4.0, 8192.0, 1.0, 100.0);
        let req = ResourceRequirement::new(2.0, 4096.0, 0.0, 50.0);
        assert!(req.fits_within(&cap));

        let too_big = ResourceRequirement::new(5.0, 0.0, 0.0, 0.0);
        assert!(!too_big.fits_within(&cap));
    }

    #[test]
    fn add_is_elementwise() {
        let a = ResourceRequirement::new(1.0, 2.0, 3.0, 4.0);
        let b = ResourceRequirement::new(1.0, 1.0, 1.0, 1.0);
        let sum = a.add(&b);
        assert_eq!(sum, ResourceRequirement::new(2.0, 3.0, 4.0, 5.0));
    }
}
