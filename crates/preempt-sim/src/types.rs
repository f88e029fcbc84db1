//! Core types for the simulation engine.
//!
//! This module provides the fundamental types used throughout preempt-sim:
//! - [`VmId`] and [`HostId`]: identities
//! - [`VmSpec`]: an incoming workload request as supplied by a trace
//! - [`Vm`]: a workload with its runtime accounting
//! - [`CompletedVm`]: the record emitted when a workload terminates

use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulated time in microseconds.
pub type SimTime = u64;

/// Priority class. 0 is the most privileged class.
pub type Priority = usize;

/// Numeric tolerance used for every capacity comparison.
pub const CAPACITY_EPSILON: f64 = 1e-6;

/// Unique identifier for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(u64);

impl VmId {
    /// Creates a new VM ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm-{}", self.0)
    }
}

/// Unique identifier for a host. Doubles as the host's index in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(u32);

impl HostId {
    /// Creates a new host ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the position of this host in its pool.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// A workload request as it arrives from the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    /// VM identity.
    pub id: VmId,
    /// Owning user or tenant.
    #[serde(default)]
    pub owner: u32,
    /// Priority class.
    pub priority: Priority,
    /// Requested capacity (MIPS).
    pub mips: f64,
    /// Submission time.
    pub submit_time: SimTime,
    /// Required total run duration.
    pub duration: SimTime,
    /// Optional per-VM availability target in [0, 1].
    #[serde(default)]
    pub availability_target: Option<f64>,
}

impl VmSpec {
    /// Creates a new VM request.
    #[must_use]
    pub const fn new(
        id: u64,
        priority: Priority,
        mips: f64,
        submit_time: SimTime,
        duration: SimTime,
    ) -> Self {
        Self {
            id: VmId::new(id),
            owner: 0,
            priority,
            mips,
            submit_time,
            duration,
            availability_target: None,
        }
    }

    /// Sets the owner.
    #[must_use]
    pub const fn with_owner(mut self, owner: u32) -> Self {
        self.owner = owner;
        self
    }

    /// Sets the availability target.
    #[must_use]
    pub const fn with_availability_target(mut self, target: f64) -> Self {
        self.availability_target = Some(target);
        self
    }
}

/// Natural order of the waiting set: privilege first, then arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    /// Priority class.
    pub priority: Priority,
    /// Submission time.
    pub submit_time: SimTime,
    /// VM identity.
    pub id: VmId,
}

/// A workload with its runtime accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// VM identity.
    pub id: VmId,
    /// Owning user or tenant.
    pub owner: u32,
    /// Priority class.
    pub priority: Priority,
    /// Requested capacity (MIPS).
    pub mips: f64,
    /// Submission time.
    pub submit_time: SimTime,
    /// Required total run duration.
    pub duration: SimTime,
    /// Start of the current execution, if running.
    pub start_time: Option<SimTime>,
    /// Run time accumulated over completed execution intervals.
    pub run_time: SimTime,
    /// Number of times this VM was evicted.
    pub preemptions: u32,
    /// Number of times this VM resumed on a different host.
    pub migrations: u32,
    /// Number of times this VM was placed by backfilling.
    pub backfills: u32,
    /// Host the VM is resident on.
    pub host: Option<HostId>,
    /// Host the VM last ran on.
    pub last_host: Option<HostId>,
    /// Optional availability target in [0, 1].
    pub availability_target: Option<f64>,
}

impl Vm {
    /// Creates a waiting VM from a request.
    #[must_use]
    pub fn from_spec(spec: &VmSpec) -> Self {
        Self {
            id: spec.id,
            owner: spec.owner,
            priority: spec.priority,
            mips: spec.mips,
            submit_time: spec.submit_time,
            duration: spec.duration,
            start_time: None,
            run_time: 0,
            preemptions: 0,
            migrations: 0,
            backfills: 0,
            host: None,
            last_host: None,
            availability_target: spec.availability_target,
        }
    }

    /// Returns the key ordering this VM in the waiting set.
    #[must_use]
    pub const fn queue_key(&self) -> QueueKey {
        QueueKey {
            priority: self.priority,
            submit_time: self.submit_time,
            id: self.id,
        }
    }

    /// Returns true if the VM is currently executing.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.start_time.is_some()
    }

    /// Run time achieved up to `now`, including the current interval.
    #[must_use]
    pub fn achieved_runtime(&self, now: SimTime) -> SimTime {
        match self.start_time {
            Some(start) => self.run_time + now.saturating_sub(start),
            None => self.run_time,
        }
    }

    /// Run time still required as of `now`.
    #[must_use]
    pub fn remaining_runtime(&self, now: SimTime) -> SimTime {
        self.duration.saturating_sub(self.achieved_runtime(now))
    }

    /// Returns true once the VM has run for its required duration.
    #[must_use]
    pub fn is_finished(&self, now: SimTime) -> bool {
        self.achieved_runtime(now) >= self.duration
    }

    /// Fraction of the time since submission during which the VM ran.
    ///
    /// Defined as 0 at the instant of submission.
    #[must_use]
    pub fn current_availability(&self, now: SimTime) -> f64 {
        let elapsed = now.saturating_sub(self.submit_time);
        if elapsed == 0 {
            return 0.0;
        }
        self.achieved_runtime(now) as f64 / elapsed as f64
    }

    /// Marks the VM as running on `host` from `now`.
    pub fn start(&mut self, now: SimTime, host: HostId) {
        if self.last_host.is_some_and(|last| last != host) {
            self.migrations += 1;
        }
        self.start_time = Some(now);
        self.host = Some(host);
    }

    /// Closes the current execution interval at `now`.
    pub fn stop(&mut self, now: SimTime) {
        self.run_time = self.achieved_runtime(now);
        self.start_time = None;
        if self.host.is_some() {
            self.last_host = self.host.take();
        }
    }

    /// Records an eviction at `now`; the VM returns to the waiting state.
    pub fn preempted(&mut self, now: SimTime) {
        self.stop(now);
        self.preemptions += 1;
    }

    /// Terminates the VM at `now`.
    pub fn terminate(&mut self, now: SimTime) {
        self.stop(now);
    }
}

/// Record emitted to the broker when a VM terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedVm {
    /// VM identity.
    pub id: VmId,
    /// Owning user or tenant.
    pub owner: u32,
    /// Priority class.
    pub priority: Priority,
    /// Requested capacity (MIPS).
    pub mips: f64,
    /// Submission time.
    pub submit_time: SimTime,
    /// Termination time.
    pub finish_time: SimTime,
    /// Required run duration.
    pub duration: SimTime,
    /// Achieved run time.
    pub run_time: SimTime,
    /// Final availability.
    pub availability: f64,
    /// Number of evictions.
    pub preemptions: u32,
    /// Number of host changes.
    pub migrations: u32,
    /// Number of backfill placements.
    pub backfills: u32,
    /// True if the VM ran for its full duration.
    pub completed: bool,
}

impl CompletedVm {
    /// Builds the record for `vm` terminating at `now`.
    #[must_use]
    pub fn from_vm(vm: &Vm, now: SimTime) -> Self {
        Self {
            id: vm.id,
            owner: vm.owner,
            priority: vm.priority,
            mips: vm.mips,
            submit_time: vm.submit_time,
            finish_time: now,
            duration: vm.duration,
            run_time: vm.achieved_runtime(now),
            availability: vm.current_availability(now),
            preemptions: vm.preemptions,
            migrations: vm.migrations,
            backfills: vm.backfills,
            completed: vm.is_finished(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: u64, priority: Priority, submit_time: SimTime) -> Vm {
        Vm::from_spec(&VmSpec::new(id, priority, 5.0, submit_time, 100))
    }

    mod id_tests {
        use super::*;

        #[test]
        fn ids_display() {
            assert_eq!(VmId::new(7).to_string(), "vm-7");
            assert_eq!(HostId::new(2).to_string(), "host-2");
            assert_eq!(HostId::new(2).index(), 2);
        }

        #[test]
        fn ids_serialize_transparently() {
            let json = serde_json::to_string(&VmId::new(9)).expect("serialize");
            assert_eq!(json, "9");
            let parsed: HostId = serde_json::from_str("4").expect("deserialize");
            assert_eq!(parsed, HostId::new(4));
        }
    }

    mod runtime_tests {
        use super::*;

        #[test]
        fn achieved_runtime_only_advances_while_running() {
            let mut v = vm(1, 0, 0);
            assert_eq!(v.achieved_runtime(50), 0);

            v.start(10, HostId::new(0));
            assert_eq!(v.achieved_runtime(30), 20);

            v.stop(30);
            assert_eq!(v.run_time, 20);
            assert_eq!(v.achieved_runtime(1_000), 20);

            v.start(40, HostId::new(0));
            assert_eq!(v.achieved_runtime(60), 40);
            assert_eq!(v.remaining_runtime(60), 60);
        }

        #[test]
        fn finished_once_duration_reached() {
            let mut v = vm(1, 0, 0);
            v.start(0, HostId::new(0));
            assert!(!v.is_finished(99));
            assert!(v.is_finished(100));
        }

        #[test]
        fn availability_is_zero_at_submission() {
            let v = vm(1, 0, 25);
            assert!(v.current_availability(25).abs() < f64::EPSILON);
        }

        #[test]
        fn availability_is_fraction_of_elapsed() {
            let mut v = vm(1, 0, 0);
            v.start(50, HostId::new(0));
            let availability = v.current_availability(100);
            assert!((availability - 0.5).abs() < 1e-9);
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[test]
        fn preemption_records_and_returns_to_waiting() {
            let mut v = vm(1, 1, 0);
            v.start(0, HostId::new(3));
            v.preempted(10);

            assert_eq!(v.preemptions, 1);
            assert!(!v.is_running());
            assert_eq!(v.host, None);
            assert_eq!(v.last_host, Some(HostId::new(3)));
            assert_eq!(v.run_time, 10);
        }

        #[test]
        fn resuming_elsewhere_counts_a_migration() {
            let mut v = vm(1, 1, 0);
            v.start(0, HostId::new(0));
            v.preempted(5);
            v.start(6, HostId::new(0));
            assert_eq!(v.migrations, 0);

            v.preempted(7);
            v.start(8, HostId::new(1));
            assert_eq!(v.migrations, 1);
        }

        #[test]
        fn queue_key_orders_by_priority_then_arrival() {
            let a = vm(5, 0, 100).queue_key();
            let b = vm(1, 1, 0).queue_key();
            let c = vm(2, 1, 0).queue_key();
            let d = vm(0, 1, 10).queue_key();
            let mut keys = vec![d, c, b, a];
            keys.sort();
            assert_eq!(keys, vec![a, b, c, d]);
        }

        #[test]
        fn completed_record_reflects_final_state() {
            let mut v = vm(3, 2, 0);
            v.start(0, HostId::new(0));
            v.terminate(100);
            let record = CompletedVm::from_vm(&v, 100);
            assert!(record.completed);
            assert_eq!(record.run_time, 100);
            assert!((record.availability - 1.0).abs() < 1e-9);
            assert!(!v.is_running());
            assert_eq!(v.host, None);
        }
    }
}
