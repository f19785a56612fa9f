// src/store/mod.rs

//! Object Store Model: where every object lives and who still needs it.
//!
//! Placement is a location fact and never changes reference counts. A
//! reference is a (object, consumer task) hold; the count is the number of
//! holds, so it cannot underflow and a double release is reported as an
//! error instead.
//!
//! Objects with no holds and no pin become collection candidates. They are
//! removed by [`ObjectStore::gc_sweep`], or earlier by
//! [`ObjectStore::evict`] when a worker reports memory pressure.

pub mod object;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, trace, warn};

use crate::errors::StoreError;
use crate::types::{ObjectId, SessionId, TaskId, WorkerId};

pub use object::{Location, ObjectRecord, Replica};

/// Removal instructions grouped by the worker that has to delete the data.
pub type Removals = BTreeMap<WorkerId, Vec<ObjectId>>;

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<ObjectId, ObjectRecord>,
    gc_candidates: BTreeSet<ObjectId>,
    clock: u64,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for a newly submitted object.
    ///
    /// Objects with `data` start out uploaded; everything else is unplaced
    /// until its producer finishes.
    pub fn register(
        &mut self,
        id: ObjectId,
        session: SessionId,
        producer: Option<TaskId>,
        pinned: bool,
        data: Option<Vec<u8>>,
    ) {
        let (size, location) = match data {
            Some(bytes) => (Some(bytes.len() as u64), Location::Uploaded(bytes)),
            None => (None, Location::Unplaced),
        };
        let record = ObjectRecord {
            id,
            session,
            producer,
            size,
            location,
            holds: BTreeSet::new(),
            pinned,
            last_acquired: 0,
        };
        if !record.is_needed() && record.location.is_available() {
            self.gc_candidates.insert(id);
        }
        self.objects.insert(id, record);
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectRecord> {
        self.objects.get(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Content can be read right now from a worker or from the coordinator.
    pub fn is_available(&self, id: ObjectId) -> bool {
        self.objects
            .get(&id)
            .is_some_and(|record| record.location.is_available())
    }

    pub fn is_removed(&self, id: ObjectId) -> bool {
        self.objects
            .get(&id)
            .is_some_and(|record| record.location == Location::Removed)
    }

    pub fn ref_count(&self, id: ObjectId) -> usize {
        self.objects.get(&id).map_or(0, ObjectRecord::ref_count)
    }

    pub fn size(&self, id: ObjectId) -> u64 {
        self.objects
            .get(&id)
            .and_then(|record| record.size)
            .unwrap_or(0)
    }

    /// Record that `worker` holds a copy of `id`.
    ///
    /// Returns `true` if this is a new replica.
    pub fn place(
        &mut self,
        id: ObjectId,
        worker: WorkerId,
        size: u64,
        spilled: bool,
    ) -> Result<bool, StoreError> {
        let record = self
            .objects
            .get_mut(&id)
            .ok_or(StoreError::UnknownObject(id))?;

        let inserted = match &mut record.location {
            Location::Removed => return Err(StoreError::Removed(id)),
            Location::Uploaded(_) => {
                debug!(object = %id, worker = %worker, "ignoring placement of uploaded object");
                return Ok(false);
            }
            Location::Unplaced => {
                let mut replicas = BTreeMap::new();
                replicas.insert(worker, Replica { spilled });
                record.location = Location::Placed { replicas };
                true
            }
            Location::Placed { replicas } => {
                replicas.insert(worker, Replica { spilled }).is_none()
            }
        };

        record.size.get_or_insert(size);
        if !record.is_needed() {
            self.gc_candidates.insert(id);
        }
        trace!(object = %id, worker = %worker, size, inserted, "object placed");
        Ok(inserted)
    }

    pub fn mark_spilled(&mut self, id: ObjectId, worker: WorkerId) -> bool {
        match self.objects.get_mut(&id).map(|record| &mut record.location) {
            Some(Location::Placed { replicas }) => match replicas.get_mut(&worker) {
                Some(replica) => {
                    replica.spilled = true;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Forget the copy on `worker`. Returns `true` if that was the last copy
    /// and the object is now unplaced.
    pub fn remove_replica(&mut self, id: ObjectId, worker: WorkerId) -> bool {
        let Some(record) = self.objects.get_mut(&id) else {
            return false;
        };
        let Location::Placed { replicas } = &mut record.location else {
            return false;
        };
        if replicas.remove(&worker).is_none() {
            return false;
        }
        if replicas.is_empty() {
            record.location = Location::Unplaced;
            return true;
        }
        false
    }

    /// Register `task` as a consumer still needing `id`.
    ///
    /// Acquiring twice for the same task is a no-op and returns `false`.
    pub fn acquire(&mut self, id: ObjectId, task: TaskId) -> Result<bool, StoreError> {
        let record = self
            .objects
            .get_mut(&id)
            .ok_or(StoreError::UnknownObject(id))?;
        if record.location == Location::Removed {
            return Err(StoreError::Removed(id));
        }
        self.clock += 1;
        record.last_acquired = self.clock;
        let inserted = record.holds.insert(task);
        if inserted {
            self.gc_candidates.remove(&id);
        }
        Ok(inserted)
    }

    pub fn release(&mut self, id: ObjectId, task: TaskId) -> Result<(), StoreError> {
        let record = self
            .objects
            .get_mut(&id)
            .ok_or(StoreError::UnknownObject(id))?;
        if !record.holds.remove(&task) {
            return Err(StoreError::NotHeld { object: id, task });
        }
        if !record.is_needed() {
            self.gc_candidates.insert(id);
        }
        Ok(())
    }

    pub fn pin(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(&id) {
            Some(record) => {
                record.pinned = true;
                self.gc_candidates.remove(&id);
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, id: ObjectId) -> bool {
        let Some(record) = self.objects.get_mut(&id) else {
            return false;
        };
        record.pinned = false;
        if !record.is_needed() {
            self.gc_candidates.insert(id);
        }
        true
    }

    /// Remove every unreferenced, unpinned object that has content somewhere.
    ///
    /// Returns the workers that must delete their copies.
    pub fn gc_sweep(&mut self) -> Removals {
        let mut removals = Removals::new();
        let candidates = std::mem::take(&mut self.gc_candidates);

        for id in candidates {
            let Some(record) = self.objects.get_mut(&id) else {
                continue;
            };
            if record.is_needed() {
                continue;
            }
            match std::mem::replace(&mut record.location, Location::Removed) {
                Location::Placed { replicas } => {
                    for worker in replicas.into_keys() {
                        removals.entry(worker).or_default().push(id);
                    }
                    debug!(object = %id, "object collected");
                }
                Location::Uploaded(_) => {
                    debug!(object = %id, "uploaded object collected");
                }
                other => {
                    // Not materialised yet; it becomes a candidate again once placed.
                    record.location = other;
                }
            }
        }

        removals
    }

    /// Free at least `bytes_needed` on `worker`, least recently acquired
    /// first.
    ///
    /// Unreferenced copies go before redundant copies of objects that still
    /// have consumers; a redundant copy is only dropped while another worker
    /// holds the object. Pinned objects and anything in `in_use` (inputs of
    /// tasks running on `worker`) are never touched. `held` is the worker's
    /// object index from the registry. Returns the objects whose copy on
    /// `worker` was dropped.
    pub fn evict(
        &mut self,
        worker: WorkerId,
        bytes_needed: u64,
        held: &BTreeSet<ObjectId>,
        in_use: &BTreeSet<ObjectId>,
    ) -> Vec<ObjectId> {
        let mut candidates: Vec<(bool, u64, ObjectId, u64)> = held
            .iter()
            .filter(|id| !in_use.contains(id))
            .filter_map(|id| self.objects.get(id))
            .filter(|record| !record.pinned && record.is_held_by(worker))
            .filter(|record| record.holds.is_empty() || record.holders().count() > 1)
            .map(|record| {
                let referenced = !record.holds.is_empty();
                (referenced, record.last_acquired, record.id, record.size.unwrap_or(0))
            })
            .collect();
        candidates.sort_unstable();

        let mut freed = 0u64;
        let mut evicted = Vec::new();
        for (referenced, _, id, size) in candidates {
            if freed >= bytes_needed {
                break;
            }
            let last_copy = self.remove_replica(id, worker);
            if last_copy && !referenced {
                if let Some(record) = self.objects.get_mut(&id) {
                    record.location = Location::Removed;
                }
                self.gc_candidates.remove(&id);
            }
            freed = freed.saturating_add(size);
            evicted.push(id);
        }

        if freed < bytes_needed {
            warn!(
                worker = %worker,
                bytes_needed,
                freed,
                "memory pressure could not be fully relieved by eviction"
            );
        }
        evicted
    }

    /// Drop every copy held by a disconnected worker.
    ///
    /// Returns the objects whose only copy was on that worker; they are now
    /// unplaced.
    pub fn drop_worker(&mut self, worker: WorkerId, held: &BTreeSet<ObjectId>) -> Vec<ObjectId> {
        held.iter()
            .copied()
            .filter(|id| self.remove_replica(*id, worker))
            .collect()
    }

    /// Bring a collected object back so its producer can recompute it.
    pub fn revive(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(&id) {
            Some(record) if record.location == Location::Removed => {
                record.location = Location::Unplaced;
                true
            }
            _ => false,
        }
    }

    /// Forget every object of `session`.
    pub fn remove_session(&mut self, session: SessionId) -> Removals {
        let ids: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|record| record.session == session)
            .map(|record| record.id)
            .collect();

        let mut removals = Removals::new();
        for id in ids {
            self.gc_candidates.remove(&id);
            if let Some(record) = self.objects.remove(&id) {
                for worker in record.holders() {
                    removals.entry(worker).or_default().push(id);
                }
            }
        }
        removals
    }

    /// Bytes of object data the store believes `worker` holds.
    pub fn held_bytes(&self, worker: WorkerId, held: &BTreeSet<ObjectId>) -> u64 {
        held.iter()
            .filter_map(|id| self.objects.get(id))
            .filter(|record| record.is_held_by(worker))
            .map(|record| record.size.unwrap_or(0))
            .sum()
    }
}
