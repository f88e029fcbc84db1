//! Preemption policies: victim selection and host suitability.
//!
//! Every host owns one [`PreemptionPolicy`] wrapping its [`CapacityLedger`].
//! Victims are always drawn from the least privileged non-empty class; the
//! variants differ in which resident of that class they give up first:
//!
//! - [`FcfsPreemption`]: the most recently submitted VM
//! - [`AvailabilityPreemption`]: the VM farthest above its availability target
//! - [`CostCurvePreemption`]: the VM freeing the most capacity, with
//!   suitability bounded by the host's capacity-cost curve

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::ledger::{CapacityLedger, CostBucket, ResidentVm};
use crate::types::{Priority, SimTime, Vm};

/// Victim ordering used by every host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionKind {
    /// Evict the most recently submitted VM first.
    #[default]
    Fcfs,
    /// Evict the VM with the largest availability margin first.
    Availability,
    /// Derive victims and suitability from the capacity-cost curve.
    CostCurve,
}

impl PreemptionKind {
    /// Returns true if this variant needs per-class SLO targets.
    #[must_use]
    pub const fn needs_slo_targets(&self) -> bool {
        matches!(self, Self::Availability)
    }
}

/// Per-host preemption strategy.
pub trait PreemptionPolicy: fmt::Debug + Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Returns the wrapped ledger.
    fn ledger(&self) -> &CapacityLedger;

    /// Returns the wrapped ledger mutably.
    fn ledger_mut(&mut self) -> &mut CapacityLedger;

    /// Picks the next eviction candidate, or `None` if the host is empty.
    fn next_vm_for_preempting(&self, now: SimTime) -> Option<ResidentVm>;

    /// Records `vm` as resident.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::CapacityExceeded`] if the ledger would be oversold.
    fn allocating(&mut self, vm: &Vm) -> Result<()> {
        self.ledger_mut().allocating(vm)
    }

    /// Removes `vm`. Returns false if it was not resident.
    fn deallocating(&mut self, vm: &Vm) -> bool {
        self.ledger_mut().deallocating(vm)
    }

    /// True iff the host could serve `vm`, evicting less privileged VMs if needed.
    fn is_suitable_for(&self, vm: &Vm) -> bool {
        self.ledger().is_suitable_for(vm)
    }

    /// Capacity visible to class `priority`.
    fn available_mips_by_priority(&self, priority: Priority) -> f64 {
        self.ledger().available_mips(priority)
    }

    /// Marginal cost of serving `vm` on this host.
    fn marginal_cost(&self, vm: &Vm) -> f64 {
        self.ledger().marginal_cost(vm.priority, vm.mips)
    }
}

/// Builds the policy selected by `kind` around `ledger`.
///
/// # Errors
///
/// Returns error if `kind` needs SLO targets and none (or the wrong number)
/// were supplied.
pub fn new_policy(
    kind: PreemptionKind,
    ledger: CapacityLedger,
    slo_targets: Option<&[f64]>,
) -> Result<Box<dyn PreemptionPolicy>> {
    Ok(match kind {
        PreemptionKind::Fcfs => Box::new(FcfsPreemption::new(ledger)),
        PreemptionKind::Availability => {
            let targets = slo_targets.ok_or_else(|| {
                SimError::config("availability preemption requires slo_targets")
            })?;
            Box::new(AvailabilityPreemption::new(ledger, targets.to_vec())?)
        }
        PreemptionKind::CostCurve => Box::new(CostCurvePreemption::new(ledger)),
    })
}

/// Evicts the most recently submitted VM of the least privileged class.
#[derive(Debug, Clone)]
pub struct FcfsPreemption {
    ledger: CapacityLedger,
}

impl FcfsPreemption {
    /// Wraps `ledger`.
    #[must_use]
    pub const fn new(ledger: CapacityLedger) -> Self {
        Self { ledger }
    }
}

impl PreemptionPolicy for FcfsPreemption {
    fn name(&self) -> &'static str {
        "fcfs"
    }

    fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut CapacityLedger {
        &mut self.ledger
    }

    fn next_vm_for_preempting(&self, _now: SimTime) -> Option<ResidentVm> {
        let class = self.ledger.least_privileged_occupied()?;
        // residents are keyed by (submit time, id): the last one is the newest
        self.ledger.residents(class).next_back().copied()
    }
}

/// Evicts the VM with the largest margin above its availability target.
///
/// VMs already below target are chosen only when nothing else is left in
/// the class.
#[derive(Debug, Clone)]
pub struct AvailabilityPreemption {
    ledger: CapacityLedger,
    slo_targets: Vec<f64>,
}

impl AvailabilityPreemption {
    /// Wraps `ledger` with one SLO target per priority class.
    ///
    /// # Errors
    ///
    /// Returns error if the target count differs from the ledger's class
    /// count or a target lies outside (0, 1].
    pub fn new(ledger: CapacityLedger, slo_targets: Vec<f64>) -> Result<Self> {
        if slo_targets.len() != ledger.priority_classes() {
            return Err(SimError::config(format!(
                "expected {} slo targets, got {}",
                ledger.priority_classes(),
                slo_targets.len()
            )));
        }
        if let Some(bad) = slo_targets.iter().find(|t| !(**t > 0.0 && **t <= 1.0)) {
            return Err(SimError::config(format!(
                "slo target {bad} outside (0, 1]"
            )));
        }
        Ok(Self {
            ledger,
            slo_targets,
        })
    }

    /// SLO target of class `priority`.
    #[must_use]
    pub fn slo_target(&self, priority: Priority) -> f64 {
        self.slo_targets.get(priority).copied().unwrap_or(1.0)
    }
}

impl PreemptionPolicy for AvailabilityPreemption {
    fn name(&self) -> &'static str {
        "availability"
    }

    fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut CapacityLedger {
        &mut self.ledger
    }

    fn next_vm_for_preempting(&self, now: SimTime) -> Option<ResidentVm> {
        let class = self.ledger.least_privileged_occupied()?;
        let target = self.slo_target(class);

        // ties go to the most recent submission
        self.ledger
            .residents(class)
            .max_by(|a, b| {
                a.availability_margin(now, target)
                    .total_cmp(&b.availability_margin(now, target))
            })
            .copied()
    }
}

/// Selects victims and suitability from the host's capacity-cost curve.
///
/// The curve is derived from the ledger on every query, so it always
/// reflects the current residents.
#[derive(Debug, Clone)]
pub struct CostCurvePreemption {
    ledger: CapacityLedger,
}

impl CostCurvePreemption {
    /// Wraps `ledger`.
    #[must_use]
    pub const fn new(ledger: CapacityLedger) -> Self {
        Self { ledger }
    }

    /// Curve seen by an arrival of class `priority`.
    #[must_use]
    pub fn cost_curve(&self, priority: Priority) -> Vec<CostBucket> {
        self.ledger.cost_curve(priority)
    }
}

impl PreemptionPolicy for CostCurvePreemption {
    fn name(&self) -> &'static str {
        "cost_curve"
    }

    fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut CapacityLedger {
        &mut self.ledger
    }

    fn is_suitable_for(&self, vm: &Vm) -> bool {
        self.marginal_cost(vm).is_finite()
    }

    fn next_vm_for_preempting(&self, _now: SimTime) -> Option<ResidentVm> {
        let class = self.ledger.least_privileged_occupied()?;
        // one large eviction costs less than several small ones; ties go to the newest
        self.ledger
            .residents(class)
            .max_by(|a, b| a.mips.total_cmp(&b.mips))
            .copied()
    }
}
