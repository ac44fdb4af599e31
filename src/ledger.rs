//! Fleet-wide bookkeeping of allocated versus total CPU, memory and IO.
//!
//! The ledger is the only authority on "is there capacity". Reservations are
//! keyed by job id so a release can never be applied twice, and totals can
//! only shrink while the remaining allocation still fits.

use std::collections::HashMap;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{OrchestratorError, Result};

const EPSILON: f64 = 1e-9;

/// CPU, memory and IO in units of one standard instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
}

impl Resources {
    pub const fn new(cpu: f64, memory: f64, io: f64) -> Self {
        Self { cpu, memory, io }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Finite and non-negative in every dimension.
    pub fn is_valid(&self) -> bool {
        [self.cpu, self.memory, self.io]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }

    pub fn fits_within(&self, limit: &Resources) -> bool {
        self.cpu <= limit.cpu + EPSILON
            && self.memory <= limit.memory + EPSILON
            && self.io <= limit.io + EPSILON
    }

    /// Largest per-dimension ratio of `self` to `total`, in `[0, 1]` when it fits.
    pub fn ratio_of(&self, total: &Resources) -> f64 {
        let ratio = |part: f64, whole: f64| if whole > 0.0 { part / whole } else { 0.0 };
        ratio(self.cpu, total.cpu)
            .max(ratio(self.memory, total.memory))
            .max(ratio(self.io, total.io))
    }

    /// Sum of the three dimensions, used as a scalar cost.
    pub fn weight(&self) -> f64 {
        self.cpu + self.memory + self.io
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources::new(self.cpu + rhs.cpu, self.memory + rhs.memory, self.io + rhs.io)
    }
}

impl Sub for Resources {
    type Output = Resources;

    /// Saturates at zero.
    fn sub(self, rhs: Resources) -> Resources {
        Resources::new(
            (self.cpu - rhs.cpu).max(0.0),
            (self.memory - rhs.memory).max(0.0),
            (self.io - rhs.io).max(0.0),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLedger {
    total: Resources,
    allocations: HashMap<String, Resources>,
    /// Set when an invariant breach is detected; blocks reservations.
    halted: Option<String>,
}

impl ResourceLedger {
    pub fn new(total: Resources) -> Self {
        Self {
            total,
            allocations: HashMap::new(),
            halted: None,
        }
    }

    pub fn total(&self) -> Resources {
        self.total
    }

    pub fn allocated(&self) -> Resources {
        self.allocations
            .values()
            .fold(Resources::zero(), |acc, r| acc + *r)
    }

    pub fn free(&self) -> Resources {
        self.total - self.allocated()
    }

    pub fn allocation(&self, job_id: &str) -> Option<Resources> {
        self.allocations.get(job_id).copied()
    }

    pub fn reservation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn utilization(&self) -> f64 {
        self.allocated().ratio_of(&self.total)
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn can_reserve(&self, request: &Resources) -> bool {
        !self.is_halted() && request.is_valid() && request.fits_within(&self.free())
    }

    pub fn reserve(&mut self, job_id: &str, request: Resources) -> Result<()> {
        if let Some(reason) = &self.halted {
            return Err(OrchestratorError::ResourceInvariant(format!(
                "admissions halted: {reason}"
            )));
        }
        if !request.is_valid() {
            return Err(OrchestratorError::InvalidInput(format!(
                "invalid resource request for {job_id}: {request:?}"
            )));
        }
        if self.allocations.contains_key(job_id) {
            return Err(OrchestratorError::ResourceInvariant(format!(
                "job {job_id} already holds a reservation"
            )));
        }
        if !request.fits_within(&self.free()) {
            return Err(OrchestratorError::Admission(format!(
                "insufficient capacity for {job_id}"
            )));
        }
        self.allocations.insert(job_id.to_string(), request);
        Ok(())
    }

    /// Releases a reservation. Releasing twice is rejected.
    pub fn release(&mut self, job_id: &str) -> Result<Resources> {
        match self.allocations.remove(job_id) {
            Some(released) => Ok(released),
            None => {
                error!(job_id, "Rejected release of a reservation that does not exist");
                Err(OrchestratorError::ResourceInvariant(format!(
                    "double release for {job_id}"
                )))
            }
        }
    }

    pub fn add_capacity(&mut self, capacity: Resources) {
        self.total = self.total + capacity;
    }

    /// Removes capacity only while the current allocation still fits.
    pub fn remove_capacity(&mut self, capacity: Resources) -> Result<()> {
        let remaining = self.total - capacity;
        if !self.allocated().fits_within(&remaining) {
            return Err(OrchestratorError::Admission(
                "capacity still allocated to running workflows".to_string(),
            ));
        }
        self.total = remaining;
        Ok(())
    }

    /// Checks `allocated ≤ total` and halts admissions when it does not hold.
    pub fn check_invariant(&mut self) -> Result<()> {
        let allocated = self.allocated();
        if allocated.fits_within(&self.total) {
            return Ok(());
        }
        let reason = format!("allocated {allocated:?} exceeds total {:?}", self.total);
        error!(%reason, "Resource ledger invariant violated, halting admissions");
        self.halted = Some(reason.clone());
        Err(OrchestratorError::ResourceInvariant(reason))
    }

    /// Rebuilds allocations from the jobs that are actually running.
    pub fn reconcile(&mut self, live: HashMap<String, Resources>) -> Result<()> {
        self.allocations = live;
        self.halted = None;
        self.check_invariant()?;
        info!(
            reservations = self.allocations.len(),
            "Resource ledger reconciled"
        );
        Ok(())
    }
}
