// src/graph/task.rs

//! Task and object records owned by the task graph.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{FailureReason, ObjectId, Resources, SessionId, TaskId, TaskPayload, WorkerId};

/// Lifecycle of a task.
///
/// `Unready -> Ready -> Running -> {Finished | Failed}`. Recovery may move a
/// Running or Finished task back to Ready or Unready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Unready,
    Ready,
    Running,
    Finished,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }

    /// Waiting to run or running.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            TaskState::Unready | TaskState::Ready | TaskState::Running
        )
    }
}

/// The worker a Running task was dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub worker: WorkerId,
    /// Dispatch number; reports carrying another attempt are stale.
    pub attempt: u32,
    pub acknowledged: bool,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub session: SessionId,
    pub inputs: Vec<ObjectId>,
    pub outputs: Vec<ObjectId>,
    pub payload: TaskPayload,
    pub resources: Resources,
    pub state: TaskState,
    pub failure: Option<FailureReason>,
    pub assignment: Option<Assignment>,
    /// Inputs that are not available yet.
    pub waiting_for: BTreeSet<ObjectId>,
    /// Dispatches made so far.
    pub attempts: u32,
    /// Workers that timed out on a dispatch of this task.
    pub avoid: BTreeSet<WorkerId>,
    pub cancel_requested: bool,
    /// A terminal event was already sent to the client.
    pub reported: bool,
}

impl TaskRecord {
    /// Inputs without duplicates, in first-use order.
    pub fn distinct_inputs(&self) -> Vec<ObjectId> {
        let mut seen = BTreeSet::new();
        self.inputs
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Dependency edges of one object.
#[derive(Debug, Clone)]
pub struct ObjectNode {
    pub id: ObjectId,
    pub session: SessionId,
    pub label: Option<String>,
    pub producer: Option<TaskId>,
    pub consumers: Vec<TaskId>,
}

/// Tasks whose state changed as the result of a graph operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphStep {
    pub newly_ready: Vec<TaskId>,
    /// Includes the task that failed and every dependent failed with it.
    pub newly_failed: Vec<TaskId>,
}

impl GraphStep {
    pub fn is_empty(&self) -> bool {
        self.newly_ready.is_empty() && self.newly_failed.is_empty()
    }

    pub fn merge(&mut self, other: GraphStep) {
        self.newly_ready.extend(other.newly_ready);
        self.newly_failed.extend(other.newly_failed);
    }
}
