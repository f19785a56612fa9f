// src/registry/mod.rs

//! Worker Registry: connected workers, their capacity, load, held objects
//! and liveness.
//!
//! Liveness is driven by heartbeats. A window is one heartbeat interval and
//! the first interval after a heartbeat is grace time. After
//! `max(N - 1, 1)` missed windows a worker is Suspected and after `N` it is
//! Disconnected, where `N` is `disconnect_after_missed_heartbeats`.
//!
//! A worker is always Suspected for at least one liveness check before it
//! is disconnected, so with `N = 1`, or when checks are far apart, the
//! disconnect lands on the check after the one that suspected it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::RegistryError;
use crate::types::{LoadSnapshot, ObjectId, Resources, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Connected,
    /// Missed heartbeats; receives no new work until it is heard from again.
    Suspected,
    /// Terminal. A reconnecting process gets a new identity.
    Disconnected,
}

/// What a worker announces when it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Peer address of the control connection.
    pub address: String,
    /// Where peers and clients fetch objects from this worker.
    pub data_address: String,
    pub capacity: Resources,
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub info: WorkerInfo,
    /// Sum of the requirements of tasks dispatched to this worker.
    pub committed: Resources,
    /// Last load the worker reported.
    pub load: LoadSnapshot,
    pub running: BTreeSet<TaskId>,
    pub objects: BTreeSet<ObjectId>,
    pub liveness: Liveness,
    pub last_heartbeat: Instant,
    /// Rejected a dispatch for lack of resources; cleared by the next heartbeat.
    pub saturated: bool,
}

impl WorkerRecord {
    /// Accepts new dispatches.
    pub fn is_schedulable(&self) -> bool {
        self.liveness == Liveness::Connected && !self.saturated
    }

    pub fn remaining(&self) -> Resources {
        self.info.capacity.saturating_sub(&self.committed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub heartbeat_interval: Duration,
    pub disconnect_after_missed_heartbeats: u32,
}

impl LivenessPolicy {
    fn missed_windows(&self, elapsed: Duration) -> u32 {
        let interval = self.heartbeat_interval.as_millis().max(1);
        let late = elapsed.as_millis().saturating_sub(interval);
        u32::try_from(late / interval).unwrap_or(u32::MAX)
    }

    fn suspect_after(&self) -> u32 {
        self.disconnect_after_missed_heartbeats.saturating_sub(1).max(1)
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            disconnect_after_missed_heartbeats: 2,
        }
    }
}

/// Liveness transitions found by one [`WorkerRegistry::check_liveness`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub suspected: Vec<WorkerId>,
    /// These workers still have their records; the caller runs recovery.
    pub disconnected: Vec<WorkerId>,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    policy: LivenessPolicy,
}

impl WorkerRegistry {
    pub fn new(policy: LivenessPolicy) -> Self {
        Self {
            workers: BTreeMap::new(),
            policy,
        }
    }

    pub fn register(
        &mut self,
        id: WorkerId,
        info: WorkerInfo,
        now: Instant,
    ) -> Result<(), RegistryError> {
        if self.workers.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        info!(
            worker = %id,
            address = %info.address,
            data_address = %info.data_address,
            cpus = info.capacity.cpus,
            memory_bytes = info.capacity.memory_bytes,
            "worker registered"
        );
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                info,
                committed: Resources::default(),
                load: LoadSnapshot::default(),
                running: BTreeSet::new(),
                objects: BTreeSet::new(),
                liveness: Liveness::Connected,
                last_heartbeat: now,
                saturated: false,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    /// Workers in ascending id order.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Schedulable workers in ascending id order.
    pub fn candidates(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values().filter(|w| w.is_schedulable())
    }

    /// Refresh liveness and load.
    ///
    /// Returns `true` if the worker became schedulable again.
    pub fn heartbeat(
        &mut self,
        id: WorkerId,
        load: LoadSnapshot,
        now: Instant,
    ) -> Result<bool, RegistryError> {
        let record = self
            .workers
            .get_mut(&id)
            .ok_or(RegistryError::UnknownWorker(id))?;
        let was_schedulable = record.is_schedulable();
        record.load = load;
        record.last_heartbeat = now;
        record.saturated = false;
        if record.liveness == Liveness::Suspected {
            info!(worker = %id, "suspected worker is back");
            record.liveness = Liveness::Connected;
        }
        Ok(!was_schedulable && record.is_schedulable())
    }

    /// Any message from the worker proves it is alive.
    pub fn touch(&mut self, id: WorkerId, now: Instant) {
        if let Some(record) = self.workers.get_mut(&id) {
            record.last_heartbeat = now;
            if record.liveness == Liveness::Suspected {
                record.liveness = Liveness::Connected;
            }
        }
    }

    /// Demote workers that stopped sending heartbeats.
    pub fn check_liveness(&mut self, now: Instant) -> LivenessReport {
        let mut report = LivenessReport::default();
        let policy = self.policy;

        for record in self.workers.values_mut() {
            if record.liveness == Liveness::Disconnected {
                continue;
            }
            let missed = policy.missed_windows(now.saturating_duration_since(record.last_heartbeat));
            let suspected = record.liveness == Liveness::Suspected;
            if suspected && missed >= policy.disconnect_after_missed_heartbeats {
                warn!(worker = %record.id, missed, "worker missed too many heartbeats; disconnecting");
                record.liveness = Liveness::Disconnected;
                report.disconnected.push(record.id);
            } else if !suspected && missed >= policy.suspect_after() {
                warn!(worker = %record.id, missed, "worker suspected");
                record.liveness = Liveness::Suspected;
                report.suspected.push(record.id);
            }
        }

        report
    }

    /// Remove a worker whose disconnection is confirmed, handing back its
    /// record for failure recovery.
    pub fn on_disconnect(&mut self, id: WorkerId) -> Option<WorkerRecord> {
        let mut record = self.workers.remove(&id)?;
        record.liveness = Liveness::Disconnected;
        info!(
            worker = %id,
            running = record.running.len(),
            objects = record.objects.len(),
            "worker disconnected"
        );
        Some(record)
    }

    pub fn mark_saturated(&mut self, id: WorkerId) {
        if let Some(record) = self.workers.get_mut(&id) {
            debug!(worker = %id, "worker saturated until next heartbeat");
            record.saturated = true;
        }
    }

    pub fn commit(&mut self, id: WorkerId, task: TaskId, resources: Resources) -> bool {
        let Some(record) = self.workers.get_mut(&id) else {
            return false;
        };
        if record.running.insert(task) {
            record.committed = record.committed.add(&resources);
        }
        true
    }

    pub fn uncommit(&mut self, id: WorkerId, task: TaskId, resources: Resources) -> bool {
        let Some(record) = self.workers.get_mut(&id) else {
            return false;
        };
        if record.running.remove(&task) {
            record.committed = record.committed.saturating_sub(&resources);
            return true;
        }
        false
    }

    pub fn add_object(&mut self, id: WorkerId, object: ObjectId) -> bool {
        match self.workers.get_mut(&id) {
            Some(record) => record.objects.insert(object),
            None => false,
        }
    }

    pub fn remove_object(&mut self, id: WorkerId, object: ObjectId) -> bool {
        match self.workers.get_mut(&id) {
            Some(record) => record.objects.remove(&object),
            None => false,
        }
    }
}
