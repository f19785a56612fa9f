// src/scheduler/placement.rs

use crate::types::{ObjectId, TaskId, WorkerId};

/// One scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub task: TaskId,
    pub worker: WorkerId,
    /// Inputs to copy proactively to `worker` before the dispatch.
    pub replicate: Vec<ObjectId>,
}

/// Output of one scheduler pass, consumed by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulePlan {
    pub placements: Vec<Placement>,
}

impl SchedulePlan {
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn worker_of(&self, task: TaskId) -> Option<WorkerId> {
        self.placements
            .iter()
            .find(|p| p.task == task)
            .map(|p| p.worker)
    }
}
