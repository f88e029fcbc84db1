//! Hosts: fixed capacity plus an exclusively owned preemption policy.

use std::fmt;

use crate::error::Result;
use crate::ledger::{CapacityLedger, ResidentVm};
use crate::preemption::{PreemptionKind, PreemptionPolicy, new_policy};
use crate::types::{HostId, Priority, SimTime, Vm};

/// A physical host in the datacenter.
pub struct Host {
    id: HostId,
    policy: Box<dyn PreemptionPolicy>,
}

impl Host {
    /// Creates a host with the policy selected by `kind`.
    ///
    /// # Errors
    ///
    /// Returns error if the capacity, class count or SLO targets are invalid.
    pub fn new(
        id: HostId,
        capacity: f64,
        priority_classes: usize,
        kind: PreemptionKind,
        slo_targets: Option<&[f64]>,
    ) -> Result<Self> {
        let ledger = CapacityLedger::new(id, capacity, priority_classes)?;
        Ok(Self {
            id,
            policy: new_policy(kind, ledger, slo_targets)?,
        })
    }

    /// Returns the host ID.
    #[must_use]
    pub const fn id(&self) -> HostId {
        self.id
    }

    /// Returns the host's ledger.
    #[must_use]
    pub fn ledger(&self) -> &CapacityLedger {
        self.policy.ledger()
    }

    /// Total capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.ledger().capacity()
    }

    /// Capacity not used by any class.
    #[must_use]
    pub fn free_capacity(&self) -> f64 {
        self.ledger().free_capacity()
    }

    /// Capacity visible to class `priority`.
    #[must_use]
    pub fn available_mips_by_priority(&self, priority: Priority) -> f64 {
        self.policy.available_mips_by_priority(priority)
    }

    /// True iff this host could serve `vm`, evicting less privileged VMs if needed.
    #[must_use]
    pub fn is_suitable_for(&self, vm: &Vm) -> bool {
        self.policy.is_suitable_for(vm)
    }

    /// True iff `vm` fits without evicting anyone.
    #[must_use]
    pub fn fits_without_preemption(&self, vm: &Vm) -> bool {
        self.ledger().fits_without_preemption(vm)
    }

    /// Marginal cost of serving `vm` here.
    #[must_use]
    pub fn marginal_cost(&self, vm: &Vm) -> f64 {
        self.policy.marginal_cost(vm)
    }

    /// Next eviction candidate according to the host's policy.
    #[must_use]
    pub fn next_vm_for_preempting(&self, now: SimTime) -> Option<ResidentVm> {
        self.policy.next_vm_for_preempting(now)
    }

    pub(crate) fn allocating(&mut self, vm: &Vm) -> Result<()> {
        self.policy.allocating(vm)
    }

    pub(crate) fn deallocating(&mut self, vm: &Vm) -> bool {
        self.policy.deallocating(vm)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("policy", &self.policy.name())
            .field("capacity", &self.capacity())
            .field("free", &self.free_capacity())
            .field("residents", &self.ledger().total_residents())
            .finish()
    }
}
