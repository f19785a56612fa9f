// src/store/object.rs

//! Per-object records kept by the coordinator.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ObjectId, SessionId, TaskId, WorkerId};

/// One copy of an object on a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Replica {
    /// The worker moved this copy to secondary storage.
    pub spilled: bool,
}

/// Where an object's content currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Not materialised yet, or every copy was lost.
    Unplaced,
    /// Held by at least one worker.
    Placed { replicas: BTreeMap<WorkerId, Replica> },
    /// Client-supplied data held by the coordinator itself.
    Uploaded(Vec<u8>),
    /// Collected; the content no longer exists anywhere.
    Removed,
}

impl Location {
    pub fn is_available(&self) -> bool {
        match self {
            Location::Placed { replicas } => !replicas.is_empty(),
            Location::Uploaded(_) => true,
            Location::Unplaced | Location::Removed => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub session: SessionId,
    /// `None` for client uploads.
    pub producer: Option<TaskId>,
    /// Known once the object materialises.
    pub size: Option<u64>,
    pub location: Location,
    /// Consumer tasks that still need this object.
    pub holds: BTreeSet<TaskId>,
    /// Client asked to keep the object after its consumers finish.
    pub pinned: bool,
    /// Logical time of the most recent acquire.
    pub last_acquired: u64,
}

impl ObjectRecord {
    pub fn ref_count(&self) -> usize {
        self.holds.len()
    }

    /// Still referenced by a consumer or by the client.
    pub fn is_needed(&self) -> bool {
        !self.holds.is_empty() || self.pinned
    }

    pub fn holders(&self) -> impl Iterator<Item = WorkerId> + '_ {
        let replicas = match &self.location {
            Location::Placed { replicas } => Some(replicas.keys().copied()),
            _ => None,
        };
        replicas.into_iter().flatten()
    }

    pub fn is_held_by(&self, worker: WorkerId) -> bool {
        match &self.location {
            Location::Placed { replicas } => replicas.contains_key(&worker),
            _ => false,
        }
    }
}
