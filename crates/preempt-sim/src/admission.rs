//! Admission control: per-priority quotas that bound oversubscription.
//!
//! Quotas are derived from datacenter capacity and per-class SLO targets:
//!
//! ```text
//! quota[p] = (capacity - sum(admitted[i] for i < p)) / slo[p] * confidence
//! ```
//!
//! A VM is admitted iff `admitted[p] + vm.mips <= quota[p]`. The check runs
//! before allocation; rejected VMs never reach the allocator.

use std::fmt;

use tracing::debug;

use crate::error::{Result, SimError};
use crate::types::{CAPACITY_EPSILON, Priority, Vm};

/// Gate applied to arriving VMs.
pub trait AdmissionController: fmt::Debug + Send {
    /// Recomputes all quotas from the admitted load per class.
    fn calculate_quota(&mut self, admitted: &[f64]);

    /// Returns true if `vm` may be admitted given the admitted load.
    fn accept(&self, vm: &Vm, admitted: &[f64]) -> bool;

    /// Current quota of class `priority`, if quotas are enforced.
    fn quota(&self, _priority: Priority) -> Option<f64> {
        None
    }
}

/// Admission controller that accepts every VM.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRejection;

impl AdmissionController for NoRejection {
    fn calculate_quota(&mut self, _admitted: &[f64]) {}

    fn accept(&self, _vm: &Vm, _admitted: &[f64]) -> bool {
        true
    }
}

/// Quota-based admission controller.
#[derive(Debug, Clone)]
pub struct QuotaAdmission {
    capacity: f64,
    slo_targets: Vec<f64>,
    confidence_factor: f64,
    quotas: Vec<f64>,
}

impl QuotaAdmission {
    /// Creates a controller for a datacenter of total `capacity`.
    ///
    /// # Errors
    ///
    /// Returns error if the capacity or confidence factor is not positive and
    /// finite, or a target lies outside (0, 1].
    pub fn new(capacity: f64, slo_targets: Vec<f64>, confidence_factor: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(SimError::config(format!(
                "datacenter capacity must be positive, got {capacity}"
            )));
        }
        if !confidence_factor.is_finite() || confidence_factor <= 0.0 {
            return Err(SimError::config(format!(
                "confidence_factor must be positive, got {confidence_factor}"
            )));
        }
        if slo_targets.is_empty() {
            return Err(SimError::config("admission control requires slo_targets"));
        }
        if let Some(bad) = slo_targets.iter().find(|t| !(**t > 0.0 && **t <= 1.0)) {
            return Err(SimError::config(format!("slo target {bad} outside (0, 1]")));
        }

        let mut controller = Self {
            capacity,
            quotas: vec![0.0; slo_targets.len()],
            slo_targets,
            confidence_factor,
        };
        controller.calculate_quota(&[]);
        Ok(controller)
    }
}

impl AdmissionController for QuotaAdmission {
    fn calculate_quota(&mut self, admitted: &[f64]) {
        let mut above = 0.0;
        for (p, quota) in self.quotas.iter_mut().enumerate() {
            let remaining = (self.capacity - above).max(0.0);
            *quota = remaining / self.slo_targets[p] * self.confidence_factor;
            above += admitted.get(p).copied().unwrap_or(0.0);
        }
        debug!(quotas = ?self.quotas, "admission quotas recalculated");
    }

    fn accept(&self, vm: &Vm, admitted: &[f64]) -> bool {
        let Some(quota) = self.quotas.get(vm.priority) else {
            return false;
        };
        let current = admitted.get(vm.priority).copied().unwrap_or(0.0);
        current + vm.mips <= quota + CAPACITY_EPSILON
    }

    fn quota(&self, priority: Priority) -> Option<f64> {
        self.quotas.get(priority).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VmSpec;
    use test_case::test_case;

    fn vm(priority: Priority, mips: f64) -> Vm {
        Vm::from_spec(&VmSpec::new(1, priority, mips, 0, 10))
    }

    #[test]
    fn no_rejection_accepts_everything() {
        let mut gate = NoRejection;
        gate.calculate_quota(&[1e9]);
        assert!(gate.accept(&vm(0, 1e12), &[1e12]));
        assert_eq!(gate.quota(0), None);
    }

    #[test_case(0.0, vec![1.0], 1.0 ; "zero capacity")]
    #[test_case(10.0, vec![1.0], 0.0 ; "zero confidence")]
    #[test_case(10.0, vec![], 1.0 ; "no targets")]
    #[test_case(10.0, vec![0.0], 1.0 ; "zero target")]
    #[test_case(10.0, vec![1.2], 1.0 ; "target above one")]
    fn quota_admission_rejects_invalid_setup(capacity: f64, targets: Vec<f64>, confidence: f64) {
        assert!(QuotaAdmission::new(capacity, targets, confidence).is_err());
    }

    #[test]
    fn quotas_subtract_more_privileged_load() {
        let mut gate = QuotaAdmission::new(100.0, vec![1.0, 0.5], 1.0).expect("valid");
        assert_eq!(gate.quota(0), Some(100.0));
        assert_eq!(gate.quota(1), Some(200.0));

        gate.calculate_quota(&[40.0, 0.0]);
        assert_eq!(gate.quota(0), Some(100.0));
        assert_eq!(gate.quota(1), Some(120.0));
    }

    #[test]
    fn accept_compares_admitted_plus_request_with_quota() {
        let mut gate = QuotaAdmission::new(10.0, vec![1.0, 1.0], 1.0).expect("valid");
        gate.calculate_quota(&[6.0, 0.0]);

        assert!(gate.accept(&vm(0, 4.0), &[6.0, 0.0]));
        assert!(!gate.accept(&vm(0, 4.5), &[6.0, 0.0]));
        assert!(gate.accept(&vm(1, 4.0), &[6.0, 0.0]));
        assert!(!gate.accept(&vm(1, 5.0), &[6.0, 0.0]));
    }

    #[test]
    fn unknown_priority_is_rejected() {
        let gate = QuotaAdmission::new(10.0, vec![1.0], 1.0).expect("valid");
        assert!(!gate.accept(&vm(3, 1.0), &[0.0]));
    }

    #[test]
    fn confidence_factor_scales_quota() {
        let gate = QuotaAdmission::new(10.0, vec![1.0], 0.8).expect("valid");
        let quota = gate.quota(0).expect("quota");
        assert!((quota - 8.0).abs() < 1e-9);
    }

    #[test]
    fn looser_slo_target_never_increases_quota() {
        let admitted = [3.0, 2.0, 1.0];
        let mut previous = f64::INFINITY;
        for target in [0.1, 0.25, 0.5, 0.75, 0.9, 1.0] {
            let mut gate =
                QuotaAdmission::new(50.0, vec![0.9, target, 0.5], 1.2).expect("valid");
            gate.calculate_quota(&admitted);
            let quota = gate.quota(1).expect("quota");
            assert!(quota <= previous);
            previous = quota;
        }
    }
}
