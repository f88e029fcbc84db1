//! Per-host, priority-aware capacity accounting.
//!
//! The [`CapacityLedger`] tracks in-use capacity per priority class and the
//! ordered set of resident VMs per class. Capacity visible to class `p`
//! excludes only the usage of classes `0..=p`: less privileged classes can
//! always be evicted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Result, SimError};
use crate::types::{CAPACITY_EPSILON, HostId, Priority, SimTime, Vm, VmId};

/// Cost reported for capacity that cannot be obtained at any price.
pub const INFINITE_COST: f64 = f64::INFINITY;

/// Ledger view of a resident VM.
///
/// Copies the fields that cannot change while the VM stays resident, so the
/// ledger never holds a reference into the orchestrator's VM table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidentVm {
    /// VM identity.
    pub id: VmId,
    /// Priority class.
    pub priority: Priority,
    /// Requested capacity.
    pub mips: f64,
    /// Submission time.
    pub submit_time: SimTime,
    /// Start of the current execution interval.
    pub start_time: SimTime,
    /// Run time accumulated before the current interval.
    pub prior_run_time: SimTime,
    /// Per-VM availability target, if any.
    pub availability_target: Option<f64>,
}

impl ResidentVm {
    /// Captures the resident view of `vm`.
    #[must_use]
    pub fn of(vm: &Vm) -> Self {
        Self {
            id: vm.id,
            priority: vm.priority,
            mips: vm.mips,
            submit_time: vm.submit_time,
            start_time: vm.start_time.unwrap_or(vm.submit_time),
            prior_run_time: vm.run_time,
            availability_target: vm.availability_target,
        }
    }

    /// Run time achieved up to `now`.
    #[must_use]
    pub fn achieved_runtime(&self, now: SimTime) -> SimTime {
        self.prior_run_time + now.saturating_sub(self.start_time)
    }

    /// Availability at `now`; 0 at the instant of submission.
    #[must_use]
    pub fn current_availability(&self, now: SimTime) -> f64 {
        let elapsed = now.saturating_sub(self.submit_time);
        if elapsed == 0 {
            return 0.0;
        }
        self.achieved_runtime(now) as f64 / elapsed as f64
    }

    /// Margin between current availability and the applicable target.
    ///
    /// The VM's own target wins over the class target.
    #[must_use]
    pub fn availability_margin(&self, now: SimTime, class_target: f64) -> f64 {
        self.current_availability(now) - self.availability_target.unwrap_or(class_target)
    }
}

/// One step of a capacity-cost curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBucket {
    /// Capacity obtainable at this cost.
    pub threshold: f64,
    /// Cumulative eviction cost.
    pub cost: f64,
}

/// Residents of one priority class, ordered by (submit time, id).
type ClassResidents = BTreeMap<(SimTime, VmId), ResidentVm>;

/// Priority-aware capacity accounting for a single host.
#[derive(Debug, Clone)]
pub struct CapacityLedger {
    host: HostId,
    capacity: f64,
    in_use: Vec<f64>,
    resident: Vec<ClassResidents>,
}

impl CapacityLedger {
    /// Creates an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns error if there are no priority classes or the capacity is not
    /// a positive finite number.
    pub fn new(host: HostId, capacity: f64, priority_classes: usize) -> Result<Self> {
        if priority_classes == 0 {
            return Err(SimError::config("priority_classes must be at least 1"));
        }
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(SimError::config(format!(
                "capacity of {host} must be positive and finite, got {capacity}"
            )));
        }

        Ok(Self {
            host,
            capacity,
            in_use: vec![0.0; priority_classes],
            resident: vec![ClassResidents::new(); priority_classes],
        })
    }

    /// Returns the host this ledger belongs to.
    #[must_use]
    pub const fn host(&self) -> HostId {
        self.host
    }

    /// Returns the total host capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Returns the number of priority classes.
    #[must_use]
    pub fn priority_classes(&self) -> usize {
        self.in_use.len()
    }

    /// Capacity in use by class `priority`.
    #[must_use]
    pub fn in_use(&self, priority: Priority) -> f64 {
        self.in_use.get(priority).copied().unwrap_or(0.0)
    }

    /// Capacity in use across all classes.
    #[must_use]
    pub fn total_in_use(&self) -> f64 {
        self.in_use.iter().sum()
    }

    /// Capacity not used by anyone.
    #[must_use]
    pub fn free_capacity(&self) -> f64 {
        self.capacity - self.total_in_use()
    }

    /// Capacity visible to class `priority`: total minus usage of classes `0..=priority`.
    #[must_use]
    pub fn available_mips(&self, priority: Priority) -> f64 {
        let last = priority.min(self.in_use.len() - 1);
        self.capacity - self.in_use[..=last].iter().sum::<f64>()
    }

    /// True iff the capacity visible to the VM's class covers its request.
    #[must_use]
    pub fn is_suitable_for(&self, vm: &Vm) -> bool {
        self.available_mips(vm.priority) + CAPACITY_EPSILON >= vm.mips
    }

    /// True iff the VM fits in unused capacity without evicting anyone.
    #[must_use]
    pub fn fits_without_preemption(&self, vm: &Vm) -> bool {
        self.free_capacity() + CAPACITY_EPSILON >= vm.mips
    }

    /// Returns true if `vm` is resident.
    #[must_use]
    pub fn contains(&self, vm: &Vm) -> bool {
        self.resident
            .get(vm.priority)
            .is_some_and(|class| class.contains_key(&(vm.submit_time, vm.id)))
    }

    /// Records `vm` as resident.
    ///
    /// The caller has already verified capacity; allocating a VM that is
    /// already resident is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::CapacityExceeded`] if the in-use total would exceed
    /// the host capacity; the ledger is left unchanged.
    pub fn allocating(&mut self, vm: &Vm) -> Result<()> {
        let priority = vm.priority.min(self.in_use.len() - 1);
        let key = (vm.submit_time, vm.id);
        if self.resident[priority].contains_key(&key) {
            debug!(host = %self.host, vm = %vm.id, "vm already resident");
            return Ok(());
        }

        let in_use = self.total_in_use() + vm.mips;
        if in_use > self.capacity + CAPACITY_EPSILON {
            error!(
                host = %self.host,
                vm = %vm.id,
                in_use,
                capacity = self.capacity,
                "ledger would exceed host capacity"
            );
            return Err(SimError::CapacityExceeded {
                host: self.host,
                in_use,
                capacity: self.capacity,
            });
        }

        self.resident[priority].insert(key, ResidentVm::of(vm));
        self.in_use[priority] += vm.mips;
        Ok(())
    }

    /// Removes `vm` from the ledger. Returns false if it was not resident.
    pub fn deallocating(&mut self, vm: &Vm) -> bool {
        let priority = vm.priority.min(self.in_use.len() - 1);
        if self.resident[priority]
            .remove(&(vm.submit_time, vm.id))
            .is_none()
        {
            return false;
        }

        if self.resident[priority].is_empty() {
            // drop accumulated rounding error
            self.in_use[priority] = 0.0;
        } else {
            self.in_use[priority] = (self.in_use[priority] - vm.mips).max(0.0);
        }
        true
    }

    /// Residents of class `priority`, oldest submission first.
    pub fn residents(&self, priority: Priority) -> impl DoubleEndedIterator<Item = &ResidentVm> {
        self.resident
            .get(priority)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    /// Number of residents in class `priority`.
    #[must_use]
    pub fn resident_count(&self, priority: Priority) -> usize {
        self.resident.get(priority).map_or(0, BTreeMap::len)
    }

    /// Number of residents across all classes.
    #[must_use]
    pub fn total_residents(&self) -> usize {
        self.resident.iter().map(BTreeMap::len).sum()
    }

    /// Returns true if no VM is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resident.iter().all(BTreeMap::is_empty)
    }

    /// Least privileged non-empty class, scanning from `P-1` toward `0`.
    #[must_use]
    pub fn least_privileged_occupied(&self) -> Option<Priority> {
        (0..self.resident.len())
            .rev()
            .find(|&p| !self.resident[p].is_empty())
    }

    /// Capacity-cost curve seen by an arrival of class `priority`.
    ///
    /// The first bucket is unused capacity at cost 0. Each further bucket adds
    /// the usage of the next evictable class, from least privileged upward,
    /// with a cost that grows with the privilege of the evicted class.
    /// Capacity beyond the last bucket costs [`INFINITE_COST`].
    #[must_use]
    pub fn cost_curve(&self, priority: Priority) -> Vec<CostBucket> {
        let classes = self.in_use.len();
        let mut threshold = self.free_capacity();
        let mut cost = 0.0;
        let mut curve = vec![CostBucket { threshold, cost }];

        for class in (priority.saturating_add(1)..classes).rev() {
            if self.resident[class].is_empty() {
                continue;
            }
            threshold += self.in_use[class];
            cost += (classes - class) as f64;
            curve.push(CostBucket { threshold, cost });
        }
        curve
    }

    /// Marginal cost of obtaining `mips` for an arrival of class `priority`.
    #[must_use]
    pub fn marginal_cost(&self, priority: Priority, mips: f64) -> f64 {
        self.cost_curve(priority)
            .iter()
            .find(|bucket| bucket.threshold + CAPACITY_EPSILON >= mips)
            .map_or(INFINITE_COST, |bucket| bucket.cost)
    }

    /// Checks the ledger invariants.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::CapacityExceeded`] if the in-use total exceeds
    /// capacity, or if a class total disagrees with its residents.
    pub fn verify(&self) -> Result<()> {
        let in_use = self.total_in_use();
        let drifted = self.in_use.iter().zip(&self.resident).any(|(used, class)| {
            let expected: f64 = class.values().map(|vm| vm.mips).sum();
            (used - expected).abs() > CAPACITY_EPSILON
        });
        if drifted || in_use > self.capacity + CAPACITY_EPSILON {
            error!(host = %self.host, in_use, capacity = self.capacity, drifted, "ledger inconsistent");
            return Err(SimError::CapacityExceeded {
                host: self.host,
                in_use,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VmSpec;
    use proptest::prelude::*;

    fn ledger(capacity: f64, classes: usize) -> CapacityLedger {
        CapacityLedger::new(HostId::new(0), capacity, classes).expect("valid ledger")
    }

    fn vm(id: u64, priority: Priority, mips: f64) -> Vm {
        Vm::from_spec(&VmSpec::new(id, priority, mips, id, 100))
    }

    mod construction_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(10.0, 0 ; "no priority classes")]
        #[test_case(0.0, 3 ; "zero capacity")]
        #[test_case(-1.0, 3 ; "negative capacity")]
        #[test_case(f64::INFINITY, 3 ; "infinite capacity")]
        fn ledger_rejects_invalid_setup(capacity: f64, classes: usize) {
            let result = CapacityLedger::new(HostId::new(1), capacity, classes);
            assert!(matches!(result, Err(SimError::InvalidConfig { .. })));
        }

        #[test]
        fn empty_ledger_offers_full_capacity() {
            let l = ledger(10.0, 3);
            for p in 0..3 {
                assert!((l.available_mips(p) - 10.0).abs() < 1e-9);
            }
            assert!(l.is_empty());
            assert_eq!(l.least_privileged_occupied(), None);
        }
    }

    mod accounting_tests {
        use super::*;

        #[test]
        fn available_mips_ignores_less_privileged_usage() {
            let mut l = ledger(10.0, 3);
            l.allocating(&vm(1, 0, 2.0)).expect("fits");
            l.allocating(&vm(2, 1, 3.0)).expect("fits");
            l.allocating(&vm(3, 2, 4.0)).expect("fits");

            assert!((l.available_mips(0) - 8.0).abs() < 1e-9);
            assert!((l.available_mips(1) - 5.0).abs() < 1e-9);
            assert!((l.available_mips(2) - 1.0).abs() < 1e-9);
            assert!((l.free_capacity() - 1.0).abs() < 1e-9);
        }

        #[test]
        fn suitability_uses_class_view() {
            let mut l = ledger(10.0, 2);
            l.allocating(&vm(1, 1, 10.0)).expect("fits");

            let privileged = vm(2, 0, 10.0);
            assert!(l.is_suitable_for(&privileged));
            assert!(!l.fits_without_preemption(&privileged));
            assert!(!l.is_suitable_for(&vm(3, 1, 1.0)));
        }

        #[test]
        fn allocating_beyond_capacity_is_rejected() {
            let mut l = ledger(10.0, 1);
            l.allocating(&vm(1, 0, 6.0)).expect("fits");
            let result = l.allocating(&vm(2, 0, 6.0));
            assert!(matches!(result, Err(SimError::CapacityExceeded { .. })));
            assert_eq!(l.total_residents(), 1);
            assert!((l.in_use(0) - 6.0).abs() < 1e-9);
        }

        #[test]
        fn allocating_twice_is_a_no_op() {
            let mut l = ledger(10.0, 1);
            let v = vm(1, 0, 4.0);
            l.allocating(&v).expect("fits");
            l.allocating(&v).expect("no-op");
            assert!((l.in_use(0) - 4.0).abs() < 1e-9);
        }

        #[test]
        fn deallocating_twice_does_not_double_credit() {
            let mut l = ledger(10.0, 1);
            let v = vm(1, 0, 4.0);
            l.allocating(&v).expect("fits");
            assert!(l.deallocating(&v));
            assert!(!l.deallocating(&v));
            assert!(l.in_use(0).abs() < 1e-9);
            assert!((l.free_capacity() - 10.0).abs() < 1e-9);
        }

        #[test]
        fn residents_are_ordered_by_submission() {
            let mut l = ledger(10.0, 1);
            l.allocating(&vm(3, 0, 1.0)).expect("fits");
            l.allocating(&vm(1, 0, 1.0)).expect("fits");
            l.allocating(&vm(2, 0, 1.0)).expect("fits");
            let ids: Vec<u64> = l.residents(0).map(|r| r.id.value()).collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    mod cost_curve_tests {
        use super::*;

        #[test]
        fn curve_steps_through_evictable_classes() {
            let mut l = ledger(10.0, 3);
            l.allocating(&vm(1, 0, 2.0)).expect("fits");
            l.allocating(&vm(2, 1, 3.0)).expect("fits");
            l.allocating(&vm(3, 2, 4.0)).expect("fits");

            let curve = l.cost_curve(0);
            assert_eq!(curve.len(), 3);
            assert!((curve[0].threshold - 1.0).abs() < 1e-9);
            assert!(curve[0].cost.abs() < 1e-9);
            assert!((curve[1].threshold - 5.0).abs() < 1e-9);
            assert!((curve[2].threshold - l.available_mips(0)).abs() < 1e-9);
            assert!(curve[2].cost > curve[1].cost);
        }

        #[test]
        fn marginal_cost_is_infinite_past_last_threshold() {
            let mut l = ledger(10.0, 2);
            l.allocating(&vm(1, 0, 6.0)).expect("fits");
            l.allocating(&vm(2, 1, 4.0)).expect("fits");

            assert!(l.marginal_cost(0, 0.0).abs() < 1e-9);
            assert!((l.marginal_cost(0, 4.0) - 1.0).abs() < 1e-9);
            assert!(l.marginal_cost(0, 5.0).is_infinite());
            assert!(l.marginal_cost(1, 1.0).is_infinite());
        }
    }

    proptest! {
        #[test]
        fn prop_ledger_invariants_hold(
            ops in proptest::collection::vec((0usize..3, 0.5f64..4.0, any::<bool>()), 1..60)
        ) {
            let mut l = ledger(20.0, 3);
            let mut resident: Vec<Vm> = Vec::new();

            for (i, (priority, mips, remove)) in ops.into_iter().enumerate() {
                if remove && !resident.is_empty() {
                    let v = resident.remove(i % resident.len());
                    prop_assert!(l.deallocating(&v));
                } else {
                    let v = vm(i as u64, priority, mips);
                    if l.fits_without_preemption(&v) {
                        l.allocating(&v).map_err(|e| TestCaseError::fail(e.to_string()))?;
                        resident.push(v);
                    }
                }

                prop_assert!(l.total_in_use() <= l.capacity() + CAPACITY_EPSILON);
                for p in 0..3 {
                    let expected: f64 = resident.iter().filter(|v| v.priority == p).map(|v| v.mips).sum();
                    prop_assert!((l.in_use(p) - expected).abs() < 1e-6);
                    let visible: f64 = (0..=p).map(|q| l.in_use(q)).sum();
                    prop_assert!((l.available_mips(p) - (20.0 - visible)).abs() < 1e-9);
                }
                prop_assert!(l.verify().is_ok());
            }
        }
    }
}
