//! The datacenter orchestrator.
//!
//! Every VM is in exactly one of three states:
//!
//! ```text
//!              arrival
//!                 │
//!                 ▼
//!   ┌──────── Waiting ◄──────┐
//!   │             │          │ preempted
//!   │   allocated │          │
//!   │             ▼          │
//!   │          Running ──────┘
//!   │             │
//!   │   departure │
//!   │             ▼
//!   └─────────► Terminated
//!     end of simulation
//! ```
//!
//! All transitions happen synchronously while one event is handled. A
//! preempted VM keeps its scheduled departure; that event is recognised as
//! stale when it fires and ignored.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::mem;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::allocation::VmAllocator;
use crate::config::{Intervals, SimConfig};
use crate::error::{Result, SimError};
use crate::persist::SnapshotStore;
use crate::sim::EventQueue;
use crate::snapshot::{
    Checkpoint, DatacenterSnapshot, PriorityTotals, SnapshotBatch, UsageRecord, VmCheckpoint,
};
use crate::types::{CompletedVm, HostId, Priority, QueueKey, SimTime, Vm, VmId, VmSpec};

/// Events delivered to the datacenter.
#[derive(Debug, Clone, PartialEq)]
pub enum DatacenterEvent {
    /// A VM request arrives.
    VmArrival(VmSpec),
    /// A running VM may have reached its required run time.
    VmDeparture(VmId),
    /// Capture per-host usage.
    UsageSnapshot,
    /// Capture datacenter aggregates.
    DatacenterInfo,
    /// Capture a checkpoint.
    Checkpoint,
    /// Terminate everything and halt the clock.
    EndOfSimulation,
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterStats {
    /// Arrival events handled.
    pub arrivals: u64,
    /// Arrivals turned away by admission control.
    pub rejected: u64,
    /// Arrivals dropped for an unknown class, bad capacity or duplicate id.
    pub invalid: u64,
    /// Successful placements, including backfills.
    pub allocations: u64,
    /// Evictions.
    pub preemptions: u64,
    /// Placements made by backfilling.
    pub backfills: u64,
    /// VMs that ran for their full duration.
    pub completed: u64,
    /// VMs force-terminated at the end of the simulation.
    pub terminated: u64,
    /// Departure events ignored as stale.
    pub stale_departures: u64,
    /// Snapshot batches committed.
    pub flushes: u64,
    /// Snapshot batches that failed to commit.
    pub failed_flushes: u64,
}

/// Recurring side activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Usage,
    Info,
    Checkpoint,
}

impl Activity {
    const ALL: [Self; 3] = [Self::Usage, Self::Info, Self::Checkpoint];

    const fn period(self, intervals: &Intervals) -> Option<SimTime> {
        match self {
            Self::Usage => intervals.usage_snapshot,
            Self::Info => intervals.datacenter_info,
            Self::Checkpoint => intervals.checkpoint,
        }
    }

    const fn event(self) -> DatacenterEvent {
        match self {
            Self::Usage => DatacenterEvent::UsageSnapshot,
            Self::Info => DatacenterEvent::DatacenterInfo,
            Self::Checkpoint => DatacenterEvent::Checkpoint,
        }
    }
}

/// Priority-preemptive datacenter.
pub struct Datacenter {
    priority_classes: usize,
    allocator: VmAllocator,
    admission: Box<dyn AdmissionController>,
    intervals: Intervals,
    end_time: Option<SimTime>,
    start_time: SimTime,

    vms: HashMap<VmId, Vm>,
    running: BTreeSet<VmId>,
    waiting: BTreeSet<QueueKey>,
    admitted: Vec<f64>,
    pending_arrivals: usize,
    armed: [bool; 3],

    usage: Vec<UsageRecord>,
    info: Vec<DatacenterSnapshot>,
    checkpoint: Option<Checkpoint>,
    store: Box<dyn SnapshotStore>,

    completed: Vec<CompletedVm>,
    stats: DatacenterStats,
    finished: bool,
}

impl Datacenter {
    /// Builds an empty datacenter from `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: &SimConfig, store: Box<dyn SnapshotStore>) -> Result<Self> {
        config.validate()?;
        let allocator = config.build_allocator()?;
        let admission = config.build_admission()?;
        info!(
            hosts = allocator.hosts().len(),
            capacity = allocator.total_capacity(),
            classes = config.priority_classes,
            strategy = allocator.strategy().name(),
            "datacenter created"
        );
        Ok(Self {
            priority_classes: config.priority_classes,
            allocator,
            admission,
            intervals: config.intervals,
            end_time: config.end_time,
            start_time: 0,
            vms: HashMap::new(),
            running: BTreeSet::new(),
            waiting: BTreeSet::new(),
            admitted: vec![0.0; config.priority_classes],
            pending_arrivals: 0,
            armed: [false; 3],
            usage: Vec::new(),
            info: Vec::new(),
            checkpoint: None,
            store,
            completed: Vec::new(),
            stats: DatacenterStats::default(),
            finished: false,
        })
    }

    /// Rebuilds a datacenter from `checkpoint`.
    ///
    /// Running VMs are re-registered on their hosts with their execution
    /// intervals intact; their departures are scheduled by [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the checkpoint does
    /// not fit the configured hosts.
    pub fn restore(
        config: &SimConfig,
        checkpoint: &Checkpoint,
        store: Box<dyn SnapshotStore>,
    ) -> Result<Self> {
        let mut dc = Self::new(config, store)?;
        dc.start_time = checkpoint.time;

        for saved in checkpoint.running.iter().chain(&checkpoint.waiting) {
            let vm = Vm::from(saved);
            if vm.priority >= dc.priority_classes {
                return Err(SimError::config(format!(
                    "checkpointed {} has priority {} outside 0..{}",
                    vm.id, vm.priority, dc.priority_classes
                )));
            }
            if vm.is_running() {
                dc.allocator.restore_vm(&vm)?;
                dc.running.insert(vm.id);
            } else {
                dc.waiting.insert(vm.queue_key());
            }
            dc.admitted[vm.priority] += vm.mips;
            dc.vms.insert(vm.id, vm);
        }
        dc.admission.calculate_quota(&dc.admitted);
        dc.allocator.verify()?;

        info!(
            time = checkpoint.time,
            running = dc.running.len(),
            waiting = dc.waiting.len(),
            "datacenter restored from checkpoint"
        );
        Ok(dc)
    }

    /// Time the datacenter starts at: 0, or the checkpoint time if restored.
    #[must_use]
    pub const fn start_time(&self) -> SimTime {
        self.start_time
    }

    /// Schedules departures of running VMs, the end-of-simulation event and
    /// the recurring activities.
    pub fn start(&mut self, queue: &mut EventQueue<DatacenterEvent>) {
        let now = queue.now();
        for id in &self.running {
            if let Some(vm) = self.vms.get(id) {
                queue.schedule_at(
                    now.saturating_add(vm.remaining_runtime(now)),
                    DatacenterEvent::VmDeparture(*id),
                );
            }
        }
        if let Some(end) = self.end_time {
            queue.schedule_at(end, DatacenterEvent::EndOfSimulation);
        }
        self.arm_recurring(queue);
    }

    /// Submits a VM request; it arrives at its submit time.
    pub fn submit(&mut self, queue: &mut EventQueue<DatacenterEvent>, spec: VmSpec) {
        self.pending_arrivals += 1;
        queue.schedule_at(spec.submit_time, DatacenterEvent::VmArrival(spec));
        self.arm_recurring(queue);
    }

    /// Handles one event at the queue's current time.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if a host ledger becomes inconsistent.
    pub fn handle(
        &mut self,
        queue: &mut EventQueue<DatacenterEvent>,
        event: DatacenterEvent,
    ) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let result = match event {
            DatacenterEvent::VmArrival(spec) => self.on_arrival(queue, &spec),
            DatacenterEvent::VmDeparture(id) => self.on_departure(queue, id),
            DatacenterEvent::UsageSnapshot => {
                self.on_recurring(queue, Activity::Usage);
                Ok(())
            }
            DatacenterEvent::DatacenterInfo => {
                self.on_recurring(queue, Activity::Info);
                Ok(())
            }
            DatacenterEvent::Checkpoint => {
                self.on_recurring(queue, Activity::Checkpoint);
                Ok(())
            }
            DatacenterEvent::EndOfSimulation => {
                self.finish(queue);
                Ok(())
            }
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, now = queue.now(), "datacenter state is inconsistent");
            }
        }
        result
    }

    fn on_arrival(&mut self, queue: &mut EventQueue<DatacenterEvent>, spec: &VmSpec) -> Result<()> {
        self.pending_arrivals = self.pending_arrivals.saturating_sub(1);
        self.stats.arrivals += 1;

        if spec.priority >= self.priority_classes
            || !spec.mips.is_finite()
            || spec.mips <= 0.0
            || self.vms.contains_key(&spec.id)
        {
            self.stats.invalid += 1;
            warn!(
                vm = %spec.id,
                priority = spec.priority,
                mips = spec.mips,
                "dropping invalid vm request"
            );
            return Ok(());
        }

        let vm = Vm::from_spec(spec);
        if !self.admission.accept(&vm, &self.admitted) {
            self.stats.rejected += 1;
            warn!(
                vm = %vm.id,
                priority = vm.priority,
                mips = vm.mips,
                quota = ?self.admission.quota(vm.priority),
                "vm rejected by admission control"
            );
            return Ok(());
        }

        self.admitted[vm.priority] += vm.mips;
        self.admission.calculate_quota(&self.admitted);
        let id = vm.id;
        self.vms.insert(id, vm);
        self.try_allocate_on_host(queue, id, None)?;
        Ok(())
    }

    /// Places `id` on `host` (or the selected host), preempting strictly
    /// less privileged residents as needed. A VM that cannot be placed is
    /// added to the waiting set.
    fn try_allocate_on_host(
        &mut self,
        queue: &mut EventQueue<DatacenterEvent>,
        id: VmId,
        host: Option<HostId>,
    ) -> Result<bool> {
        let now = queue.now();
        let vm = self.vms.get(&id).ok_or(SimError::VmNotFound { vm: id })?;
        let Some(target) = host.or_else(|| self.allocator.select_host(vm, now)) else {
            debug!(vm = %id, "no candidate host");
            self.enqueue(id);
            return Ok(false);
        };

        // each pass either places the VM or evicts one resident
        let bound = self
            .allocator
            .host(target)
            .map_or(0, |h| h.ledger().total_residents());
        for _ in 0..=bound {
            let vm = self.vms.get_mut(&id).ok_or(SimError::VmNotFound { vm: id })?;
            if self.allocator.allocate_host_for_vm(vm, Some(target), now)? {
                self.mark_running(queue, id);
                return Ok(true);
            }

            let priority = vm.priority;
            let suitable = self
                .allocator
                .host(target)
                .is_some_and(|h| h.is_suitable_for(vm));
            if !suitable {
                break;
            }
            let Some(victim) = self.allocator.next_vm_for_preempting(target, now) else {
                break;
            };
            if victim.priority <= priority {
                break;
            }
            // a victim whose departure is due at this instant leaves instead
            if self.vms.get(&victim.id).is_some_and(|v| v.is_finished(now)) {
                self.retire(victim.id, now);
                continue;
            }
            if !self.preempt_vm(victim.id, now)? {
                break;
            }
        }

        self.enqueue(id);
        Ok(false)
    }

    fn preempt_vm(&mut self, id: VmId, now: SimTime) -> Result<bool> {
        let victim = self.vms.get_mut(&id).ok_or(SimError::VmNotFound { vm: id })?;
        if !self.allocator.preempt(victim, now) {
            return Ok(false);
        }
        self.running.remove(&id);
        self.waiting.insert(victim.queue_key());
        self.stats.preemptions += 1;
        Ok(true)
    }

    fn enqueue(&mut self, id: VmId) {
        if let Some(vm) = self.vms.get(&id) {
            if self.waiting.insert(vm.queue_key()) {
                debug!(vm = %id, priority = vm.priority, waiting = self.waiting.len(), "vm waiting");
            }
        }
    }

    fn mark_running(&mut self, queue: &mut EventQueue<DatacenterEvent>, id: VmId) {
        let now = queue.now();
        let Some(vm) = self.vms.get(&id) else {
            return;
        };
        self.waiting.remove(&vm.queue_key());
        self.running.insert(id);
        self.stats.allocations += 1;
        queue.schedule_at(
            now.saturating_add(vm.remaining_runtime(now)),
            DatacenterEvent::VmDeparture(id),
        );
    }

    fn on_departure(&mut self, queue: &mut EventQueue<DatacenterEvent>, id: VmId) -> Result<()> {
        let now = queue.now();
        let Some(vm) = self.vms.get(&id) else {
            self.stats.stale_departures += 1;
            return Ok(());
        };
        if !vm.is_finished(now) {
            self.stats.stale_departures += 1;
            debug!(vm = %id, achieved = vm.achieved_runtime(now), duration = vm.duration, "stale departure ignored");
            return Ok(());
        }

        let host = vm.host;
        self.retire(id, now);

        if let Some(host) = host {
            if self.intervals.usage_snapshot.is_some() {
                self.capture_host_usage(host, now);
            }
            self.backfill(queue, host)?;
        }
        Ok(())
    }

    /// Terminates a VM that reached its required run time, wherever it is.
    fn retire(&mut self, id: VmId, now: SimTime) {
        let Some(vm) = self.vms.get_mut(&id) else {
            return;
        };
        if vm.is_running() {
            self.allocator.deallocate_host_for_vm(vm, now);
        } else {
            self.waiting.remove(&vm.queue_key());
        }
        vm.terminate(now);
        self.running.remove(&id);
        self.stats.completed += 1;
        self.complete(id, now);
    }

    /// Emits the completion record of a terminated VM and releases its
    /// admitted load.
    fn complete(&mut self, id: VmId, now: SimTime) {
        let Some(vm) = self.vms.remove(&id) else {
            return;
        };
        if let Some(load) = self.admitted.get_mut(vm.priority) {
            *load = (*load - vm.mips).max(0.0);
        }
        self.admission.calculate_quota(&self.admitted);

        let record = CompletedVm::from_vm(&vm, now);
        info!(
            vm = %id,
            priority = vm.priority,
            run_time = record.run_time,
            availability = record.availability,
            preemptions = record.preemptions,
            completed = record.completed,
            "vm terminated"
        );
        self.completed.push(record);
    }

    /// Places waiting VMs on `host` in waiting-set order without evicting
    /// anyone. The scan stops at the first VM that does not fit.
    fn backfill(&mut self, queue: &mut EventQueue<DatacenterEvent>, host: HostId) -> Result<()> {
        let now = queue.now();
        let candidates: Vec<VmId> = self.waiting.iter().map(|key| key.id).collect();
        for id in candidates {
            let Some(vm) = self.vms.get_mut(&id) else {
                continue;
            };
            if !self.allocator.allocate_host_for_vm(vm, Some(host), now)? {
                break;
            }
            vm.backfills += 1;
            self.stats.backfills += 1;
            debug!(vm = %id, host = %host, "vm backfilled");
            self.mark_running(queue, id);
        }
        Ok(())
    }

    fn on_recurring(&mut self, queue: &mut EventQueue<DatacenterEvent>, activity: Activity) {
        let now = queue.now();
        self.armed[activity as usize] = false;
        match activity {
            Activity::Usage => self.capture_usage(now),
            Activity::Info => self.capture_datacenter_info(now),
            Activity::Checkpoint => self.checkpoint = Some(self.checkpoint(now)),
        }
        self.flush(now);
        self.arm_recurring(queue);
    }

    /// True while recurring activities still have something to observe.
    fn keep_alive(&self) -> bool {
        !self.running.is_empty()
            || self.pending_arrivals > 0
            || (!self.waiting.is_empty() && self.end_time.is_some())
    }

    fn arm_recurring(&mut self, queue: &mut EventQueue<DatacenterEvent>) {
        if self.finished || !self.keep_alive() {
            return;
        }
        for activity in Activity::ALL {
            let Some(period) = activity.period(&self.intervals) else {
                continue;
            };
            if !self.armed[activity as usize] {
                queue.schedule_at(queue.now().saturating_add(period), activity.event());
                self.armed[activity as usize] = true;
            }
        }
    }

    fn capture_host_usage(&mut self, host: HostId, now: SimTime) {
        let Some(host) = self.allocator.host(host) else {
            return;
        };
        let ledger = host.ledger();
        self.usage.extend((0..ledger.priority_classes()).map(|p| UsageRecord {
            time: now,
            host: host.id(),
            priority: p,
            in_use: ledger.in_use(p),
            vms: ledger.resident_count(p),
        }));
    }

    fn capture_usage(&mut self, now: SimTime) {
        let ids: Vec<HostId> = self.allocator.hosts().iter().map(|h| h.id()).collect();
        for id in ids {
            self.capture_host_usage(id, now);
        }
    }

    fn capture_datacenter_info(&mut self, now: SimTime) {
        let mut totals: Vec<PriorityTotals> = (0..self.priority_classes)
            .map(|priority| PriorityTotals {
                priority,
                ..PriorityTotals::default()
            })
            .collect();
        for vm in self.running_vms() {
            if let Some(t) = totals.get_mut(vm.priority) {
                t.running += 1;
                t.running_mips += vm.mips;
            }
        }
        for vm in self.waiting_vms() {
            if let Some(t) = totals.get_mut(vm.priority) {
                t.waiting += 1;
                t.waiting_mips += vm.mips;
            }
        }
        self.info.push(DatacenterSnapshot {
            time: now,
            running: self.running.len(),
            waiting: self.waiting.len(),
            by_priority: totals,
        });
    }

    /// Captures the Running and Waiting sets at `now`.
    #[must_use]
    pub fn checkpoint(&self, now: SimTime) -> Checkpoint {
        Checkpoint {
            time: now,
            created_at: Utc::now(),
            running: self.running_vms().map(VmCheckpoint::from).collect(),
            waiting: self.waiting_vms().map(VmCheckpoint::from).collect(),
        }
    }

    /// Writes buffered snapshot records as one batch.
    ///
    /// On failure the records stay buffered for the next flush. Returns true
    /// if nothing remains buffered.
    pub fn flush(&mut self, now: SimTime) -> bool {
        if self.usage.is_empty() && self.info.is_empty() && self.checkpoint.is_none() {
            return true;
        }
        let batch = SnapshotBatch {
            id: Uuid::new_v4(),
            time: now,
            usage: mem::take(&mut self.usage),
            datacenter: mem::take(&mut self.info),
            checkpoint: self.checkpoint.take(),
        };

        match self.store.write_batch(&batch) {
            Ok(()) => {
                self.stats.flushes += 1;
                debug!(
                    batch = %batch.id,
                    usage = batch.usage.len(),
                    datacenter = batch.datacenter.len(),
                    checkpoint = batch.checkpoint.is_some(),
                    "snapshot batch flushed"
                );
                true
            }
            Err(e) => {
                self.stats.failed_flushes += 1;
                warn!(
                    error = %e,
                    usage = batch.usage.len(),
                    datacenter = batch.datacenter.len(),
                    "snapshot flush failed, records kept for retry"
                );
                self.usage = batch.usage;
                self.info = batch.datacenter;
                self.checkpoint = batch.checkpoint;
                false
            }
        }
    }

    /// Force-terminates every Running and Waiting VM, flushes buffered
    /// records and halts the clock.
    pub fn finish(&mut self, queue: &mut EventQueue<DatacenterEvent>) {
        if self.finished {
            return;
        }
        let now = queue.now();

        for id in mem::take(&mut self.running) {
            if let Some(vm) = self.vms.get_mut(&id) {
                self.allocator.deallocate_host_for_vm(vm, now);
                vm.terminate(now);
            }
            self.stats.terminated += 1;
            self.complete(id, now);
        }
        for key in mem::take(&mut self.waiting) {
            if let Some(vm) = self.vms.get_mut(&key.id) {
                vm.terminate(now);
            }
            self.stats.terminated += 1;
            self.complete(key.id, now);
        }

        if !self.flush(now) {
            warn!(now, "final snapshot flush failed");
        }
        queue.halt();
        self.finished = true;
        info!(
            now,
            completed = self.stats.completed,
            terminated = self.stats.terminated,
            preemptions = self.stats.preemptions,
            rejected = self.stats.rejected,
            "simulation ended"
        );
    }

    /// Returns true once [`finish`](Self::finish) has run.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of priority classes.
    #[must_use]
    pub const fn priority_classes(&self) -> usize {
        self.priority_classes
    }

    /// Returns the allocator and its hosts.
    #[must_use]
    pub const fn allocator(&self) -> &VmAllocator {
        &self.allocator
    }

    /// Returns a non-terminated VM.
    #[must_use]
    pub fn vm(&self, id: VmId) -> Option<&Vm> {
        self.vms.get(&id)
    }

    /// Returns true if `id` is running.
    #[must_use]
    pub fn is_running(&self, id: VmId) -> bool {
        self.running.contains(&id)
    }

    /// Returns true if `id` is waiting.
    #[must_use]
    pub fn is_waiting(&self, id: VmId) -> bool {
        self.vms
            .get(&id)
            .is_some_and(|vm| self.waiting.contains(&vm.queue_key()))
    }

    /// Running VMs, by id.
    pub fn running_vms(&self) -> impl Iterator<Item = &Vm> + '_ {
        self.running.iter().filter_map(|id| self.vms.get(id))
    }

    /// Waiting VMs, in waiting-set order.
    pub fn waiting_vms(&self) -> impl Iterator<Item = &Vm> + '_ {
        self.waiting.iter().filter_map(|key| self.vms.get(&key.id))
    }

    /// Number of running VMs.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Number of waiting VMs.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Load admitted and not yet terminated in class `priority`.
    #[must_use]
    pub fn admitted(&self, priority: Priority) -> f64 {
        self.admitted.get(priority).copied().unwrap_or(0.0)
    }

    /// Run counters.
    #[must_use]
    pub const fn stats(&self) -> &DatacenterStats {
        &self.stats
    }

    /// Completion records not yet drained.
    #[must_use]
    pub fn completed(&self) -> &[CompletedVm] {
        &self.completed
    }

    /// Takes all completion records.
    pub fn drain_completed(&mut self) -> Vec<CompletedVm> {
        mem::take(&mut self.completed)
    }

    /// Usage records waiting to be flushed.
    #[must_use]
    pub fn pending_usage(&self) -> &[UsageRecord] {
        &self.usage
    }

    /// Datacenter records waiting to be flushed.
    #[must_use]
    pub fn pending_datacenter_info(&self) -> &[DatacenterSnapshot] {
        &self.info
    }

    /// Checkpoint waiting to be flushed.
    #[must_use]
    pub const fn pending_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }
}

impl fmt::Debug for Datacenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datacenter")
            .field("hosts", &self.allocator.hosts().len())
            .field("running", &self.running.len())
            .field("waiting", &self.waiting.len())
            .field("stats", &self.stats)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
