//! Snapshot and checkpoint records handed to the persistence collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{HostId, Priority, SimTime, Vm, VmId};

/// Usage of one priority class on one host at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Simulated time of the capture.
    pub time: SimTime,
    /// Host.
    pub host: HostId,
    /// Priority class.
    pub priority: Priority,
    /// Capacity in use by the class.
    pub in_use: f64,
    /// Number of resident VMs of the class.
    pub vms: usize,
}

/// Running and waiting totals of one priority class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityTotals {
    /// Priority class.
    pub priority: Priority,
    /// Running VMs.
    pub running: usize,
    /// Waiting VMs.
    pub waiting: usize,
    /// Capacity requested by running VMs.
    pub running_mips: f64,
    /// Capacity requested by waiting VMs.
    pub waiting_mips: f64,
}

/// Aggregate datacenter state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatacenterSnapshot {
    /// Simulated time of the capture.
    pub time: SimTime,
    /// Running VMs.
    pub running: usize,
    /// Waiting VMs.
    pub waiting: usize,
    /// Totals per priority class.
    pub by_priority: Vec<PriorityTotals>,
}

/// Per-VM state needed to resume a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCheckpoint {
    /// VM identity.
    pub id: VmId,
    /// Owning user or tenant.
    pub owner: u32,
    /// Requested capacity.
    pub mips: f64,
    /// Submission time.
    pub submit_time: SimTime,
    /// Priority class.
    pub priority: Priority,
    /// Required run duration.
    pub duration: SimTime,
    /// Start of the current execution, if running.
    pub start_time: Option<SimTime>,
    /// Accumulated run time before the current execution.
    pub run_time: SimTime,
    /// Eviction count.
    pub preemptions: u32,
    /// Host change count.
    pub migrations: u32,
    /// Backfill placement count.
    pub backfills: u32,
    /// Resident host, if running.
    pub host: Option<HostId>,
    /// Last host the VM ran on.
    pub last_host: Option<HostId>,
    /// Per-VM availability target.
    pub availability_target: Option<f64>,
}

impl From<&Vm> for VmCheckpoint {
    fn from(vm: &Vm) -> Self {
        Self {
            id: vm.id,
            owner: vm.owner,
            mips: vm.mips,
            submit_time: vm.submit_time,
            priority: vm.priority,
            duration: vm.duration,
            start_time: vm.start_time,
            run_time: vm.run_time,
            preemptions: vm.preemptions,
            migrations: vm.migrations,
            backfills: vm.backfills,
            host: vm.host,
            last_host: vm.last_host,
            availability_target: vm.availability_target,
        }
    }
}

impl From<&VmCheckpoint> for Vm {
    fn from(saved: &VmCheckpoint) -> Self {
        let running = saved.start_time.is_some() && saved.host.is_some();
        Self {
            id: saved.id,
            owner: saved.owner,
            priority: saved.priority,
            mips: saved.mips,
            submit_time: saved.submit_time,
            duration: saved.duration,
            start_time: if running { saved.start_time } else { None },
            run_time: saved.run_time,
            preemptions: saved.preemptions,
            migrations: saved.migrations,
            backfills: saved.backfills,
            host: if running { saved.host } else { None },
            last_host: saved.last_host,
            availability_target: saved.availability_target,
        }
    }
}

/// Full Running and Waiting state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Simulated time of the checkpoint.
    pub time: SimTime,
    /// Wall-clock time the checkpoint was taken.
    pub created_at: DateTime<Utc>,
    /// Running VMs.
    pub running: Vec<VmCheckpoint>,
    /// Waiting VMs, in waiting-set order.
    pub waiting: Vec<VmCheckpoint>,
}

/// Records written together in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBatch {
    /// Batch identity.
    pub id: Uuid,
    /// Simulated time of the flush.
    pub time: SimTime,
    /// Host usage records.
    pub usage: Vec<UsageRecord>,
    /// Datacenter aggregate records.
    pub datacenter: Vec<DatacenterSnapshot>,
    /// Checkpoint, if one is pending.
    pub checkpoint: Option<Checkpoint>,
}

impl SnapshotBatch {
    /// Returns true if the batch carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.usage.is_empty() && self.datacenter.is_empty() && self.checkpoint.is_none()
    }
}
