//! Host selection and the datacenter-wide VM allocator.
//!
//! A [`PlacementStrategy`] only chooses a host; it never mutates state. The
//! [`VmAllocator`] owns the host pool, commits placements to host ledgers and
//! notifies the strategy so index-based strategies stay current.
//!
//! Available strategies:
//! - [`WorstFit`]: the host with the most capacity visible to the VM's class
//! - [`BestFit`]: the suitable host with the least visible capacity
//! - [`PrioritySorted`]: per-class ordered host index, extreme element only
//! - [`CostCurveFit`]: raw free capacity first, then the cheapest eviction
//! - [`AvailabilityAware`]: worst or best fit, demoting hosts with residents
//!   below their availability target

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SimError};
use crate::host::Host;
use crate::ledger::ResidentVm;
use crate::types::{HostId, Priority, SimTime, Vm};

/// Host selection strategy used by the datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    /// Most visible capacity first.
    #[default]
    WorstFit,
    /// Least visible capacity among suitable hosts.
    BestFit,
    /// Per-class ordered host index.
    PrioritySorted,
    /// Raw free capacity, then lowest eviction cost.
    CostCurve,
    /// Worst fit, hosts with SLO-violating residents last.
    AvailabilityWorstFit,
    /// Best fit, hosts with SLO-violating residents last.
    AvailabilityBestFit,
}

impl AllocationKind {
    /// Returns true if this strategy needs per-class SLO targets.
    #[must_use]
    pub const fn needs_slo_targets(&self) -> bool {
        matches!(self, Self::AvailabilityWorstFit | Self::AvailabilityBestFit)
    }
}

/// Chooses a host for a VM.
pub trait PlacementStrategy: fmt::Debug + Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Returns the chosen host, or `None` if no host is a candidate.
    fn select_host(&self, hosts: &[Host], vm: &Vm, now: SimTime) -> Option<HostId>;

    /// Called after every change to `host`'s ledger.
    fn host_changed(&mut self, _host: &Host) {}
}

/// Builds the strategy selected by `kind`.
///
/// # Errors
///
/// Returns error if `kind` needs SLO targets and none were supplied.
pub fn new_strategy(
    kind: AllocationKind,
    priority_classes: usize,
    slo_targets: Option<&[f64]>,
) -> Result<Box<dyn PlacementStrategy>> {
    let targets = || {
        slo_targets
            .map(<[f64]>::to_vec)
            .ok_or_else(|| SimError::config("availability-aware allocation requires slo_targets"))
    };
    Ok(match kind {
        AllocationKind::WorstFit => Box::new(WorstFit),
        AllocationKind::BestFit => Box::new(BestFit),
        AllocationKind::PrioritySorted => Box::new(PrioritySorted::new(priority_classes)),
        AllocationKind::CostCurve => Box::new(CostCurveFit),
        AllocationKind::AvailabilityWorstFit => {
            Box::new(AvailabilityAware::new(Fit::Worst, targets()?))
        }
        AllocationKind::AvailabilityBestFit => {
            Box::new(AvailabilityAware::new(Fit::Best, targets()?))
        }
    })
}

/// Orders hosts by visible capacity, descending, then by id ascending.
fn most_available(a: (f64, HostId), b: (f64, HostId)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

/// Orders hosts by visible capacity, ascending, then by id ascending.
fn least_available(a: (f64, HostId), b: (f64, HostId)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

/// Uses the host with the most capacity visible to the VM's class.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorstFit;

impl PlacementStrategy for WorstFit {
    fn name(&self) -> &'static str {
        "worst_fit"
    }

    fn select_host(&self, hosts: &[Host], vm: &Vm, _now: SimTime) -> Option<HostId> {
        hosts
            .iter()
            .filter(|host| host.is_suitable_for(vm))
            .map(|host| (host.available_mips_by_priority(vm.priority), host.id()))
            .min_by(|a, b| most_available(*a, *b))
            .map(|(_, id)| id)
    }
}

/// Uses the suitable host with the least capacity visible to the VM's class.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestFit;

impl PlacementStrategy for BestFit {
    fn name(&self) -> &'static str {
        "best_fit"
    }

    fn select_host(&self, hosts: &[Host], vm: &Vm, _now: SimTime) -> Option<HostId> {
        hosts
            .iter()
            .filter(|host| host.is_suitable_for(vm))
            .map(|host| (host.available_mips_by_priority(vm.priority), host.id()))
            .min_by(|a, b| least_available(*a, *b))
            .map(|(_, id)| id)
    }
}

/// Index entry: a host and the capacity it offers one class.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    available: f64,
    host: HostId,
}

impl PartialEq for IndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexEntry {}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        most_available((self.available, self.host), (other.available, other.host))
    }
}

/// Keeps one ordered host index per priority class.
///
/// Selection looks only at the extreme element of the VM's class; it does
/// not search further for hosts that would need preemption.
#[derive(Debug, Clone)]
pub struct PrioritySorted {
    index: Vec<BTreeSet<IndexEntry>>,
    current: Vec<Vec<Option<f64>>>,
}

impl PrioritySorted {
    /// Creates an empty index for `priority_classes` classes.
    #[must_use]
    pub fn new(priority_classes: usize) -> Self {
        Self {
            index: vec![BTreeSet::new(); priority_classes],
            current: Vec::new(),
        }
    }

    /// Hosts ordered for class `priority`, best candidate first.
    pub fn ordered_hosts(&self, priority: Priority) -> impl Iterator<Item = HostId> + '_ {
        self.index
            .get(priority)
            .into_iter()
            .flat_map(|set| set.iter().map(|entry| entry.host))
    }
}

impl PlacementStrategy for PrioritySorted {
    fn name(&self) -> &'static str {
        "priority_sorted"
    }

    fn select_host(&self, hosts: &[Host], vm: &Vm, _now: SimTime) -> Option<HostId> {
        let best = self.index.get(vm.priority)?.first()?;
        let host = hosts.get(best.host.index())?;
        host.is_suitable_for(vm).then_some(best.host)
    }

    fn host_changed(&mut self, host: &Host) {
        let slot = host.id().index();
        if self.current.len() <= slot {
            self.current.resize(slot + 1, vec![None; self.index.len()]);
        }

        for (priority, set) in self.index.iter_mut().enumerate() {
            if let Some(previous) = self.current[slot][priority] {
                set.remove(&IndexEntry {
                    available: previous,
                    host: host.id(),
                });
            }
            let available = host.available_mips_by_priority(priority);
            set.insert(IndexEntry {
                available,
                host: host.id(),
            });
            self.current[slot][priority] = Some(available);
        }
    }
}

/// Two-phase selection on raw free capacity and eviction cost.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostCurveFit;

impl PlacementStrategy for CostCurveFit {
    fn name(&self) -> &'static str {
        "cost_curve"
    }

    fn select_host(&self, hosts: &[Host], vm: &Vm, _now: SimTime) -> Option<HostId> {
        let roomiest = hosts
            .iter()
            .map(|host| (host.free_capacity(), host.id()))
            .min_by(|a, b| most_available(*a, *b))?;
        if let Some(host) = hosts.get(roomiest.1.index()) {
            if host.fits_without_preemption(vm) {
                return Some(roomiest.1);
            }
        }

        let (_, cheapest) = hosts
            .iter()
            .map(|host| (host.marginal_cost(vm), host.id()))
            .filter(|(cost, _)| cost.is_finite())
            .min_by(|a, b| least_available(*a, *b))?;
        hosts
            .get(cheapest.index())
            .filter(|host| host.is_suitable_for(vm))
            .map(Host::id)
    }
}

/// Fit direction for [`AvailabilityAware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Most visible capacity first.
    Worst,
    /// Least visible capacity first.
    Best,
}

/// Worst or best fit that places on hosts with SLO-violating residents last.
#[derive(Debug, Clone)]
pub struct AvailabilityAware {
    fit: Fit,
    slo_targets: Vec<f64>,
}

impl AvailabilityAware {
    /// Creates the strategy with one SLO target per class.
    #[must_use]
    pub const fn new(fit: Fit, slo_targets: Vec<f64>) -> Self {
        Self { fit, slo_targets }
    }

    /// True if any resident of `host` is below its availability target.
    #[must_use]
    pub fn has_violations(&self, host: &Host, now: SimTime) -> bool {
        let ledger = host.ledger();
        (0..ledger.priority_classes()).any(|p| {
            let target = self.slo_targets.get(p).copied().unwrap_or(0.0);
            ledger
                .residents(p)
                .any(|vm: &ResidentVm| vm.availability_margin(now, target) < 0.0)
        })
    }
}

impl PlacementStrategy for AvailabilityAware {
    fn name(&self) -> &'static str {
        match self.fit {
            Fit::Worst => "availability_worst_fit",
            Fit::Best => "availability_best_fit",
        }
    }

    fn select_host(&self, hosts: &[Host], vm: &Vm, now: SimTime) -> Option<HostId> {
        let order = match self.fit {
            Fit::Worst => most_available,
            Fit::Best => least_available,
        };
        hosts
            .iter()
            .filter(|host| host.is_suitable_for(vm))
            .map(|host| {
                (
                    self.has_violations(host, now),
                    host.available_mips_by_priority(vm.priority),
                    host.id(),
                )
            })
            .min_by(|a, b| a.0.cmp(&b.0).then(order((a.1, a.2), (b.1, b.2))))
            .map(|(_, _, id)| id)
    }
}

/// Owns the host pool and commits placements.
#[derive(Debug)]
pub struct VmAllocator {
    hosts: Vec<Host>,
    strategy: Box<dyn PlacementStrategy>,
}

impl VmAllocator {
    /// Creates an allocator. Host IDs must equal their position in `hosts`.
    ///
    /// # Errors
    ///
    /// Returns error if the pool is empty or host IDs are not positional.
    pub fn new(hosts: Vec<Host>, mut strategy: Box<dyn PlacementStrategy>) -> Result<Self> {
        if hosts.is_empty() {
            return Err(SimError::config("datacenter needs at least one host"));
        }
        if let Some(host) = hosts.iter().enumerate().find(|(i, h)| h.id().index() != *i) {
            return Err(SimError::config(format!(
                "{} is out of position {}",
                host.1.id(),
                host.0
            )));
        }
        for host in &hosts {
            strategy.host_changed(host);
        }
        debug!(hosts = hosts.len(), strategy = strategy.name(), "allocator ready");
        Ok(Self { hosts, strategy })
    }

    /// Returns all hosts.
    #[must_use]
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Returns a host by ID.
    #[must_use]
    pub fn host(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(id.index())
    }

    /// Returns the placement strategy.
    #[must_use]
    pub fn strategy(&self) -> &dyn PlacementStrategy {
        self.strategy.as_ref()
    }

    /// Total capacity of the pool.
    #[must_use]
    pub fn total_capacity(&self) -> f64 {
        self.hosts.iter().map(Host::capacity).sum()
    }

    /// Chooses a host for `vm` without changing any state.
    #[must_use]
    pub fn select_host(&self, vm: &Vm, now: SimTime) -> Option<HostId> {
        self.strategy.select_host(&self.hosts, vm, now)
    }

    /// Places `vm` on `host`, or on the selected host if none is given.
    ///
    /// Returns `Ok(false)` if there is no candidate host or the host lacks
    /// unused capacity. On success the VM is started at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::CapacityExceeded`] if the host ledger would be
    /// oversold.
    pub fn allocate_host_for_vm(
        &mut self,
        vm: &mut Vm,
        host: Option<HostId>,
        now: SimTime,
    ) -> Result<bool> {
        let Some(target) = host.or_else(|| self.select_host(&*vm, now)) else {
            return Ok(false);
        };
        let Some(host) = self.hosts.get_mut(target.index()) else {
            return Ok(false);
        };
        if !host.fits_without_preemption(vm) {
            return Ok(false);
        }

        vm.start(now, target);
        host.allocating(vm)?;
        self.strategy.host_changed(host);
        debug!(vm = %vm.id, host = %target, priority = vm.priority, mips = vm.mips, "vm allocated");
        Ok(true)
    }

    /// Re-registers a running VM restored from a checkpoint, keeping its
    /// execution interval.
    ///
    /// # Errors
    ///
    /// Returns error if the host is unknown or would be oversold.
    pub fn restore_vm(&mut self, vm: &Vm) -> Result<()> {
        let id = vm.host.ok_or(SimError::VmNotFound { vm: vm.id })?;
        let host = self
            .hosts
            .get_mut(id.index())
            .ok_or(SimError::HostNotFound { host: id })?;
        host.allocating(vm)?;
        self.strategy.host_changed(host);
        Ok(())
    }

    /// Evicts a running VM from its host. Returns false if it has no host.
    pub fn preempt(&mut self, vm: &mut Vm, now: SimTime) -> bool {
        let Some(id) = vm.host else {
            return false;
        };
        let Some(host) = self.hosts.get_mut(id.index()) else {
            return false;
        };
        if !host.deallocating(vm) {
            return false;
        }
        vm.preempted(now);
        self.strategy.host_changed(host);
        info!(vm = %vm.id, host = %id, priority = vm.priority, preemptions = vm.preemptions, "vm preempted");
        true
    }

    /// Removes a departing VM from its host. Returns false if it has no host.
    pub fn deallocate_host_for_vm(&mut self, vm: &mut Vm, now: SimTime) -> bool {
        let Some(id) = vm.host else {
            return false;
        };
        let Some(host) = self.hosts.get_mut(id.index()) else {
            return false;
        };
        let removed = host.deallocating(vm);
        vm.stop(now);
        self.strategy.host_changed(host);
        removed
    }

    /// Next eviction candidate on `host`.
    #[must_use]
    pub fn next_vm_for_preempting(&self, host: HostId, now: SimTime) -> Option<ResidentVm> {
        self.host(host)?.next_vm_for_preempting(now)
    }

    /// Checks every host ledger.
    ///
    /// # Errors
    ///
    /// Returns the first consistency error found.
    pub fn verify(&self) -> Result<()> {
        self.hosts.iter().try_for_each(|host| host.ledger().verify())
    }
}
