//! Simulation configuration.
//!
//! Configuration is loaded from JSON and validated before any host is built:
//!
//! ```json
//! {
//!   "priority_classes": 3,
//!   "hosts": [{ "count": 4, "capacity": 100.0 }],
//!   "preemption": "availability",
//!   "allocation": "availability_worst_fit",
//!   "slo_targets": { "0": 0.99, "1": 0.9, "2": 0.5 },
//!   "admission": { "enabled": true, "confidence_factor": 1.0 },
//!   "intervals": { "usage_snapshot": 60000000, "checkpoint": 3600000000 },
//!   "end_time": 86400000000
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionController, NoRejection, QuotaAdmission};
use crate::allocation::{AllocationKind, VmAllocator, new_strategy};
use crate::error::{Result, SimError};
use crate::host::Host;
use crate::preemption::PreemptionKind;
use crate::types::{HostId, SimTime};

/// A group of identical hosts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostGroup {
    /// Number of hosts in the group.
    pub count: u32,
    /// Capacity of each host.
    pub capacity: f64,
}

/// Admission control settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Enforce per-class quotas. Disabled admits every VM.
    #[serde(default)]
    pub enabled: bool,
    /// Multiplier applied to every quota.
    #[serde(default = "default_confidence_factor")]
    pub confidence_factor: f64,
}

const fn default_confidence_factor() -> f64 {
    1.0
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_factor: default_confidence_factor(),
        }
    }
}

/// Periods of the recurring side activities. `None` disables an activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervals {
    /// Per-host usage capture.
    #[serde(default)]
    pub usage_snapshot: Option<SimTime>,
    /// Datacenter aggregate capture.
    #[serde(default)]
    pub datacenter_info: Option<SimTime>,
    /// Checkpoint of the Running and Waiting sets.
    #[serde(default)]
    pub checkpoint: Option<SimTime>,
}

/// Complete simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of priority classes.
    pub priority_classes: usize,
    /// Host pool.
    pub hosts: Vec<HostGroup>,
    /// Preemption policy used by every host.
    #[serde(default)]
    pub preemption: PreemptionKind,
    /// Host selection strategy.
    #[serde(default)]
    pub allocation: AllocationKind,
    /// Required availability per class, keyed "0".."P-1".
    #[serde(default)]
    pub slo_targets: BTreeMap<String, serde_json::Value>,
    /// Admission control.
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Recurring side activities.
    #[serde(default)]
    pub intervals: Intervals,
    /// Time of the end-of-simulation event.
    #[serde(default)]
    pub end_time: Option<SimTime>,
}

impl SimConfig {
    /// Creates a configuration with `priority_classes` classes and no hosts.
    #[must_use]
    pub fn new(priority_classes: usize) -> Self {
        Self {
            priority_classes,
            hosts: Vec::new(),
            preemption: PreemptionKind::default(),
            allocation: AllocationKind::default(),
            slo_targets: BTreeMap::new(),
            admission: AdmissionConfig::default(),
            intervals: Intervals::default(),
            end_time: None,
        }
    }

    /// Adds `count` hosts of `capacity`.
    #[must_use]
    pub fn with_hosts(mut self, count: u32, capacity: f64) -> Self {
        self.hosts.push(HostGroup { count, capacity });
        self
    }

    /// Sets the preemption policy.
    #[must_use]
    pub const fn with_preemption(mut self, kind: PreemptionKind) -> Self {
        self.preemption = kind;
        self
    }

    /// Sets the allocation strategy.
    #[must_use]
    pub const fn with_allocation(mut self, kind: AllocationKind) -> Self {
        self.allocation = kind;
        self
    }

    /// Sets one SLO target per class, in class order.
    #[must_use]
    pub fn with_slo_targets(mut self, targets: &[f64]) -> Self {
        self.slo_targets = targets
            .iter()
            .enumerate()
            .map(|(p, t)| (p.to_string(), serde_json::Value::from(*t)))
            .collect();
        self
    }

    /// Enables quota admission with `confidence_factor`.
    #[must_use]
    pub const fn with_admission(mut self, confidence_factor: f64) -> Self {
        self.admission = AdmissionConfig {
            enabled: true,
            confidence_factor,
        };
        self
    }

    /// Sets the recurring activity periods.
    #[must_use]
    pub const fn with_intervals(mut self, intervals: Intervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Sets the end-of-simulation time.
    #[must_use]
    pub const fn with_end_time(mut self, end_time: SimTime) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the configuration invalid.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or the configuration is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SimError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Checks the configuration, reporting the first problem found.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] describing the violation.
    pub fn validate(&self) -> Result<()> {
        if self.priority_classes == 0 {
            return Err(SimError::config("priority_classes must be at least 1"));
        }
        if self.hosts.is_empty() || self.host_count() == 0 {
            return Err(SimError::config("at least one host is required"));
        }
        if let Some(group) = self
            .hosts
            .iter()
            .find(|g| !g.capacity.is_finite() || g.capacity <= 0.0)
        {
            return Err(SimError::config(format!(
                "host capacity must be positive, got {}",
                group.capacity
            )));
        }
        if !self.admission.confidence_factor.is_finite() || self.admission.confidence_factor <= 0.0
        {
            return Err(SimError::config(format!(
                "confidence_factor must be positive, got {}",
                self.admission.confidence_factor
            )));
        }
        for (name, period) in [
            ("usage_snapshot", self.intervals.usage_snapshot),
            ("datacenter_info", self.intervals.datacenter_info),
            ("checkpoint", self.intervals.checkpoint),
        ] {
            if period == Some(0) {
                return Err(SimError::config(format!("{name} interval must be positive")));
            }
        }

        let targets = self.slo_targets()?;
        if targets.is_none() && self.needs_slo_targets() {
            return Err(SimError::config(format!(
                "slo_targets required by {:?} preemption, {:?} allocation or admission control",
                self.preemption, self.allocation
            )));
        }
        Ok(())
    }

    /// Returns true if the selected policies need SLO targets.
    #[must_use]
    pub const fn needs_slo_targets(&self) -> bool {
        self.preemption.needs_slo_targets()
            || self.allocation.needs_slo_targets()
            || self.admission.enabled
    }

    /// Parses the SLO targets into one value per class.
    ///
    /// Returns `None` if no targets are configured.
    ///
    /// # Errors
    ///
    /// Returns error if keys are not exactly "0".."P-1" or a value is not a
    /// number in (0, 1].
    pub fn slo_targets(&self) -> Result<Option<Vec<f64>>> {
        if self.slo_targets.is_empty() {
            return Ok(None);
        }

        let mut targets = vec![None; self.priority_classes];
        for (key, value) in &self.slo_targets {
            let priority: usize = key
                .parse()
                .map_err(|_| SimError::config(format!("slo_targets key {key:?} is not a priority")))?;
            let slot = targets.get_mut(priority).ok_or_else(|| {
                SimError::config(format!(
                    "slo_targets key {priority} outside 0..{}",
                    self.priority_classes
                ))
            })?;
            if slot.is_some() {
                return Err(SimError::config(format!("slo_targets key {priority} repeated")));
            }
            let target = value.as_f64().ok_or_else(|| {
                SimError::config(format!("slo_targets[{priority}] is not a number: {value}"))
            })?;
            if !(target > 0.0 && target <= 1.0) {
                return Err(SimError::config(format!(
                    "slo_targets[{priority}] = {target} outside (0, 1]"
                )));
            }
            *slot = Some(target);
        }

        targets
            .into_iter()
            .enumerate()
            .map(|(p, t)| t.ok_or_else(|| SimError::config(format!("slo_targets missing key {p}"))))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Total number of hosts.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.iter().map(|g| g.count as usize).sum()
    }

    /// Sum of all host capacities.
    #[must_use]
    pub fn total_capacity(&self) -> f64 {
        self.hosts.iter().map(|g| f64::from(g.count) * g.capacity).sum()
    }

    /// Builds the host pool, numbering hosts from 0 in group order.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn build_hosts(&self) -> Result<Vec<Host>> {
        let targets = self.slo_targets()?;
        let mut hosts = Vec::with_capacity(self.host_count());
        for group in &self.hosts {
            for _ in 0..group.count {
                let id = u32::try_from(hosts.len())
                    .map_err(|_| SimError::config("too many hosts"))?;
                hosts.push(Host::new(
                    HostId::new(id),
                    group.capacity,
                    self.priority_classes,
                    self.preemption,
                    targets.as_deref(),
                )?);
            }
        }
        Ok(hosts)
    }

    /// Builds the allocator over a fresh host pool.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn build_allocator(&self) -> Result<VmAllocator> {
        self.validate()?;
        let targets = self.slo_targets()?;
        let strategy = new_strategy(self.allocation, self.priority_classes, targets.as_deref())?;
        VmAllocator::new(self.build_hosts()?, strategy)
    }

    /// Builds the admission controller.
    ///
    /// # Errors
    ///
    /// Returns error if quotas are enabled without valid SLO targets.
    pub fn build_admission(&self) -> Result<Box<dyn AdmissionController>> {
        if !self.admission.enabled {
            return Ok(Box::new(NoRejection));
        }
        let targets = self
            .slo_targets()?
            .ok_or_else(|| SimError::config("admission control requires slo_targets"))?;
        Ok(Box::new(QuotaAdmission::new(
            self.total_capacity(),
            targets,
            self.admission.confidence_factor,
        )?))
    }
}
