//! Priority-preemptive VM allocation and eviction for datacenter simulation.
//!
//! `preempt-sim` decides, for every arriving virtual machine, which host
//! receives it, which less privileged VMs are evicted to make room, and what
//! happens to evicted VMs afterwards. Time is simulated: every transition runs
//! while one event of a discrete-event queue is handled.
//!
//! # Features
//!
//! - **Capacity Ledger**: per-host, per-priority usage and resident VMs
//! - **Preemption Policies**: FCFS, availability (SLO margin), capacity-cost
//! - **Admission Control**: per-priority quotas that bound oversubscription
//! - **Allocation Strategies**: worst fit, best fit, priority-sorted index,
//!   cost curve, availability-aware worst and best fit
//! - **Orchestrator**: arrival with preemption cascade, departure with
//!   backfilling, end of simulation
//! - **Snapshots**: usage, datacenter aggregates and resumable checkpoints,
//!   written in transactional batches
//!
//! Priority 0 is the most privileged class. A VM only ever evicts VMs of a
//! strictly less privileged class.
//!
//! # Example
//!
//! ```rust
//! use preempt_sim::{MemoryStore, Datacenter, SimConfig, Simulation, VmSpec};
//!
//! let config = SimConfig::new(2).with_hosts(1, 10.0);
//! let datacenter = Datacenter::new(&config, Box::new(MemoryStore::new()))?;
//! let mut sim = Simulation::new(datacenter);
//!
//! // a low priority VM fills the host, then a high priority VM arrives
//! sim.submit(VmSpec::new(1, 1, 10.0, 0, 100));
//! sim.submit(VmSpec::new(2, 0, 10.0, 5, 20));
//! sim.run()?;
//!
//! let records = sim.datacenter().completed();
//! let evicted = records.iter().find(|r| r.id.value() == 1).map(|r| r.preemptions);
//! assert_eq!(evicted, Some(1));
//! # Ok::<(), preempt_sim::SimError>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │                Simulation                 │
//! │  ┌─────────────────────────────────────┐  │
//! │  │   EventQueue (clock, stable order)  │  │
//! │  └──────────────────┬──────────────────┘  │
//! │                     ▼                     │
//! │  ┌─────────────────────────────────────┐  │
//! │  │             Datacenter              │  │
//! │  │  admission ─► allocator ─► hosts    │  │
//! │  │                   │         │       │  │
//! │  │          PlacementStrategy  │       │  │
//! │  │                   PreemptionPolicy  │  │
//! │  │                     (CapacityLedger)│  │
//! │  └──────────────────┬──────────────────┘  │
//! │                     ▼                     │
//! │  ┌─────────────────────────────────────┐  │
//! │  │     SnapshotStore (batch writes)    │  │
//! │  └─────────────────────────────────────┘  │
//! └───────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod admission;
pub mod allocation;
pub mod config;
pub mod datacenter;
pub mod error;
pub mod host;
pub mod ledger;
pub mod persist;
pub mod preemption;
pub mod sim;
pub mod snapshot;
pub mod types;

// Re-export main types
pub use admission::{AdmissionController, NoRejection, QuotaAdmission};
pub use allocation::{
    AllocationKind, AvailabilityAware, BestFit, CostCurveFit, Fit, PlacementStrategy,
    PrioritySorted, VmAllocator, WorstFit,
};
pub use config::{AdmissionConfig, HostGroup, Intervals, SimConfig};
pub use datacenter::{Datacenter, DatacenterEvent, DatacenterStats};
pub use error::{Result, SimError};
pub use host::Host;
pub use ledger::{CapacityLedger, CostBucket, INFINITE_COST, ResidentVm};
pub use persist::{JsonFileStore, MemoryStore, SnapshotStore};
pub use preemption::{
    AvailabilityPreemption, CostCurvePreemption, FcfsPreemption, PreemptionKind,
    PreemptionPolicy,
};
pub use sim::{EventQueue, Simulation};
pub use snapshot::{
    Checkpoint, DatacenterSnapshot, PriorityTotals, SnapshotBatch, UsageRecord, VmCheckpoint,
};
pub use types::{
    CAPACITY_EPSILON, CompletedVm, HostId, Priority, SimTime, Vm, VmId, VmSpec,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::allocation::AllocationKind;
    pub use crate::config::{Intervals, SimConfig};
    pub use crate::datacenter::Datacenter;
    pub use crate::error::{Result, SimError};
    pub use crate::persist::{JsonFileStore, MemoryStore, SnapshotStore};
    pub use crate::preemption::PreemptionKind;
    pub use crate::sim::Simulation;
    pub use crate::types::{CompletedVm, HostId, Priority, SimTime, VmId, VmSpec};
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::collections::BTreeSet;

    fn simulation(config: &SimConfig) -> (Simulation, MemoryStore) {
        let store = MemoryStore::new();
        let datacenter = Datacenter::new(config, Box::new(store.clone())).expect("valid config");
        (Simulation::new(datacenter), store)
    }

    fn record(sim: &Simulation, id: u64) -> CompletedVm {
        sim.datacenter()
            .completed()
            .iter()
            .find(|r| r.id == VmId::new(id))
            .cloned()
            .expect("completion record")
    }

    #[test]
    fn single_vm_runs_to_completion() {
        let (mut sim, _) = simulation(&SimConfig::new(1).with_hosts(1, 10.0));
        sim.submit(VmSpec::new(0, 0, 5.0, 0, 10));

        sim.run_until(0).expect("consistent");
        assert!(sim.datacenter().is_running(VmId::new(0)));

        sim.run_until(10).expect("consistent");
        assert_eq!(sim.datacenter().running_count(), 0);
        assert_eq!(sim.datacenter().waiting_count(), 0);

        let done = record(&sim, 0);
        assert!(done.completed);
        assert_eq!(done.finish_time, 10);
        assert!((done.availability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn higher_priority_arrival_preempts_full_host() {
        let (mut sim, _) = simulation(&SimConfig::new(2).with_hosts(1, 10.0));
        sim.submit(VmSpec::new(1, 1, 10.0, 0, 100));
        sim.submit(VmSpec::new(2, 0, 10.0, 0, 100));
        sim.run_until(0).expect("consistent");

        let dc = sim.datacenter();
        assert!(dc.is_running(VmId::new(2)));
        assert!(dc.is_waiting(VmId::new(1)));
        assert_eq!(dc.vm(VmId::new(1)).map(|v| v.preemptions), Some(1));
        assert_eq!(dc.stats().preemptions, 1);
    }

    #[test]
    fn lower_priority_arrival_never_preempts_upward() {
        let (mut sim, _) = simulation(&SimConfig::new(3).with_hosts(1, 10.0));
        sim.submit(VmSpec::new(0, 0, 5.0, 0, 100));
        sim.submit(VmSpec::new(1, 1, 5.0, 0, 100));
        sim.submit(VmSpec::new(2, 2, 5.0, 1, 100));
        sim.run_until(1).expect("consistent");

        let dc = sim.datacenter();
        assert!(dc.is_running(VmId::new(0)));
        assert!(dc.is_running(VmId::new(1)));
        assert!(dc.is_waiting(VmId::new(2)));
        assert_eq!(dc.stats().preemptions, 0);
    }

    #[test]
    fn less_privileged_vm_waits_until_capacity_frees() {
        let (mut sim, _) = simulation(&SimConfig::new(2).with_hosts(1, 10.0));
        sim.submit(VmSpec::new(0, 0, 6.0, 0, 10));
        sim.submit(VmSpec::new(1, 1, 6.0, 0, 10));

        sim.run_until(9).expect("consistent");
        assert!(sim.datacenter().is_running(VmId::new(0)));
        assert!(sim.datacenter().is_waiting(VmId::new(1)));

        sim.run().expect("consistent");
        let waited = record(&sim, 1);
        assert!(waited.completed);
        assert_eq!(waited.finish_time, 20);
        assert_eq!(waited.backfills, 1);
        assert_eq!(waited.preemptions, 0);
    }

    #[test]
    fn evicted_vm_resumes_on_another_host() {
        let (mut sim, _) = simulation(&SimConfig::new(2).with_hosts(2, 10.0));
        sim.submit(VmSpec::new(2, 0, 4.0, 0, 3));
        sim.submit(VmSpec::new(1, 1, 6.0, 0, 50));
        // host 1 is the only one showing 10 to priority 0: vm 1 is evicted there
        sim.submit(VmSpec::new(3, 0, 10.0, 1, 5));
        sim.run().expect("consistent");

        // vm 2 leaves host 0 at 3 and vm 1 is backfilled onto it
        let evicted = record(&sim, 1);
        assert_eq!(evicted.preemptions, 1);
        assert_eq!(evicted.migrations, 1);
        assert_eq!(evicted.backfills, 1);
        assert!(evicted.completed);
        assert_eq!(evicted.finish_time, 52);
        assert_eq!(record(&sim, 3).finish_time, 6);
        assert_eq!(sim.datacenter().stats().stale_departures, 1);
    }

    #[test]
    fn checkpoint_resume_matches_uninterrupted_run() {
        let config = SimConfig::new(2)
            .with_hosts(2, 10.0)
            .with_intervals(Intervals {
                checkpoint: Some(25),
                ..Intervals::default()
            });
        let trace = vec![
            VmSpec::new(0, 0, 8.0, 0, 40),
            VmSpec::new(1, 1, 6.0, 0, 60),
            VmSpec::new(2, 1, 6.0, 10, 30),
            VmSpec::new(3, 0, 10.0, 20, 30),
        ];

        let (mut full, store) = simulation(&config);
        full.submit_all(trace.clone());
        full.run_until(25).expect("consistent");
        let checkpoint = store
            .latest_checkpoint()
            .expect("read")
            .expect("checkpoint at 25");
        assert_eq!(checkpoint.time, 25);
        full.run().expect("consistent");

        let resumed_dc = Datacenter::restore(&config, &checkpoint, Box::new(MemoryStore::new()))
            .expect("restore");
        let mut resumed = Simulation::new(resumed_dc);
        resumed.run().expect("consistent");

        let finish = |sim: &Simulation| {
            let mut times: Vec<(VmId, SimTime, u32)> = sim
                .datacenter()
                .completed()
                .iter()
                .map(|r| (r.id, r.finish_time, r.preemptions))
                .collect();
            times.sort_unstable();
            times
        };
        assert_eq!(finish(&full), finish(&resumed));
    }

    #[test]
    fn persistence_failure_does_not_stop_the_run() {
        let config = SimConfig::new(1)
            .with_hosts(1, 10.0)
            .with_intervals(Intervals {
                usage_snapshot: Some(2),
                ..Intervals::default()
            });
        let (mut sim, store) = simulation(&config);
        store.fail_next(3);
        sim.submit(VmSpec::new(0, 0, 5.0, 0, 10));
        sim.run().expect("consistent");

        let stats = sim.datacenter().stats();
        assert_eq!(stats.failed_flushes, 3);
        assert!(stats.flushes > 0);
        assert_eq!(stats.completed, 1);
        // the first committed batch carries the records of the failed ones
        assert_eq!(store.batches()[0].usage.len(), 4);
    }

    #[test]
    fn run_without_end_event_terminates_stuck_vms() {
        let (mut sim, _) = simulation(&SimConfig::new(1).with_hosts(1, 10.0));
        sim.submit(VmSpec::new(0, 0, 20.0, 0, 10));
        sim.run().expect("consistent");

        let stuck = record(&sim, 0);
        assert!(!stuck.completed);
        assert_eq!(stuck.run_time, 0);
        assert!(sim.datacenter().is_finished());
    }

    #[test]
    fn every_allocation_strategy_keeps_ledgers_consistent() {
        let kinds = [
            AllocationKind::WorstFit,
            AllocationKind::BestFit,
            AllocationKind::PrioritySorted,
            AllocationKind::CostCurve,
            AllocationKind::AvailabilityWorstFit,
            AllocationKind::AvailabilityBestFit,
        ];
        let preemptions = [
            PreemptionKind::Fcfs,
            PreemptionKind::Availability,
            PreemptionKind::CostCurve,
        ];
        for allocation in kinds {
            for preemption in preemptions {
                let config = SimConfig::new(3)
                    .with_hosts(3, 16.0)
                    .with_slo_targets(&[0.99, 0.8, 0.4])
                    .with_allocation(allocation)
                    .with_preemption(preemption);
                let (mut sim, _) = simulation(&config);
                for i in 0..60_u64 {
                    let priority = (i % 3) as usize;
                    let mips = 2.0 + (i * 7 % 9) as f64;
                    sim.submit(VmSpec::new(i, priority, mips, i * 3, 20 + i % 17));
                }
                while sim.step().expect("consistent") {
                    let dc = sim.datacenter();
                    assert!(dc.allocator().verify().is_ok());

                    let running: BTreeSet<VmId> = dc.running_vms().map(|vm| vm.id).collect();
                    let waiting: BTreeSet<VmId> = dc.waiting_vms().map(|vm| vm.id).collect();
                    assert!(running.is_disjoint(&waiting));
                    assert_eq!(running.len(), dc.running_count());
                    assert_eq!(waiting.len(), dc.waiting_count());
                    let live: BTreeSet<VmId> =
                        (0..60).map(VmId::new).filter(|id| dc.vm(*id).is_some()).collect();
                    let tracked: BTreeSet<VmId> = running.union(&waiting).copied().collect();
                    assert_eq!(live, tracked, "{allocation:?}/{preemption:?}");
                }
                sim.run().expect("consistent");

                let dc = sim.datacenter();
                assert_eq!(dc.completed().len(), 60, "{allocation:?}/{preemption:?}");
                assert!(dc.completed().iter().all(|r| r.completed));
            }
        }
    }
}
