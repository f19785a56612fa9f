// src/graph/mod.rs

//! Task Graph: tasks, objects and the dependency edges between them.
//!
//! - [`submission`] holds the client-side task/object descriptions.
//! - [`task`] defines the records and state machine.
//! - [`validate`] rejects malformed submissions before anything changes.
//! - [`propagation`] fails the transitive dependents of a failed task.
//!
//! Readiness is tracked per task as the set of inputs it still waits for,
//! so finishing a task only touches the direct consumers of its outputs.

pub mod propagation;
pub mod submission;
pub mod task;
pub mod validate;

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::errors::GraphError;
use crate::store::ObjectStore;
use crate::types::{FailureReason, ObjectId, SessionId, TaskId};

pub use submission::{ObjectSpec, TaskSpec};
pub use task::{Assignment, GraphStep, ObjectNode, TaskRecord, TaskState};

use propagation::FailurePropagator;

#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, TaskRecord>,
    objects: HashMap<ObjectId, ObjectNode>,
    ready: BTreeSet<TaskId>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(&id)
    }

    pub fn object(&self, id: ObjectId) -> Option<&ObjectNode> {
        self.objects.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectNode> {
        self.objects.values()
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|record| record.state)
    }

    /// Ready tasks in ascending id order.
    pub fn ready_tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ready.iter().copied()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Consumers of `object` that have not reached a terminal state.
    pub fn pending_consumers(&self, object: ObjectId) -> Vec<TaskId> {
        let Some(node) = self.objects.get(&object) else {
            return Vec::new();
        };
        node.consumers
            .iter()
            .copied()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|record| record.state.is_pending())
            })
            .collect()
    }

    /// Check a submission against the current graph. Never mutates.
    pub fn validate_submission(
        &self,
        store: &ObjectStore,
        session: SessionId,
        tasks: &[TaskSpec],
        objects: &[ObjectSpec],
    ) -> Result<(), GraphError> {
        validate::validate_submission(self, store, session, tasks, objects)
    }

    /// Add an already validated submission.
    ///
    /// The store must know every object of the submission. Returns the tasks
    /// that are immediately Ready.
    pub fn insert_submission(
        &mut self,
        session: SessionId,
        tasks: Vec<TaskSpec>,
        objects: &[ObjectSpec],
        store: &ObjectStore,
    ) -> Vec<TaskId> {
        for spec in objects {
            self.objects.insert(
                spec.id,
                ObjectNode {
                    id: spec.id,
                    session,
                    label: spec.label.clone(),
                    producer: None,
                    consumers: Vec::new(),
                },
            );
        }

        let mut newly_ready = Vec::new();
        for spec in tasks {
            for output in &spec.outputs {
                if let Some(node) = self.objects.get_mut(output) {
                    node.producer = Some(spec.id);
                }
            }

            let mut record = TaskRecord {
                id: spec.id,
                session,
                inputs: spec.inputs,
                outputs: spec.outputs,
                payload: spec.payload,
                resources: spec.resources,
                state: TaskState::Unready,
                failure: None,
                assignment: None,
                waiting_for: BTreeSet::new(),
                attempts: 0,
                avoid: BTreeSet::new(),
                cancel_requested: false,
                reported: false,
            };

            for input in record.distinct_inputs() {
                if let Some(node) = self.objects.get_mut(&input) {
                    node.consumers.push(record.id);
                }
                if !store.is_available(input) {
                    record.waiting_for.insert(input);
                }
            }

            if record.waiting_for.is_empty() {
                record.state = TaskState::Ready;
                self.ready.insert(record.id);
                newly_ready.push(record.id);
            }
            self.tasks.insert(record.id, record);
        }

        newly_ready
    }

    /// Ready -> Running.
    pub fn mark_running(&mut self, id: TaskId, assignment: Assignment) -> bool {
        let Some(record) = self.tasks.get_mut(&id) else {
            return false;
        };
        if record.state != TaskState::Ready {
            warn!(task = %id, state = ?record.state, "refusing to run a task that is not Ready");
            return false;
        }
        record.state = TaskState::Running;
        record.assignment = Some(assignment);
        self.ready.remove(&id);
        true
    }

    /// Running -> Finished, then re-evaluate the direct consumers of
    /// `produced`.
    pub fn mark_finished(&mut self, id: TaskId, produced: &[ObjectId]) -> GraphStep {
        let Some(record) = self.tasks.get_mut(&id) else {
            return GraphStep::default();
        };
        if record.state.is_terminal() {
            return GraphStep::default();
        }
        record.state = TaskState::Finished;
        record.assignment = None;
        record.failure = None;
        record.cancel_requested = false;
        self.ready.remove(&id);
        debug!(task = %id, outputs = produced.len(), "task finished");

        let mut step = GraphStep::default();
        for &object in produced {
            step.newly_ready.extend(self.object_available(object));
        }
        step
    }

    /// An object became readable; consumers waiting only for it become Ready.
    pub fn object_available(&mut self, object: ObjectId) -> Vec<TaskId> {
        let Some(node) = self.objects.get(&object) else {
            return Vec::new();
        };
        let mut newly_ready = Vec::new();
        for &consumer in &node.consumers {
            let Some(record) = self.tasks.get_mut(&consumer) else {
                continue;
            };
            if record.state != TaskState::Unready {
                continue;
            }
            if record.waiting_for.remove(&object) && record.waiting_for.is_empty() {
                record.state = TaskState::Ready;
                self.ready.insert(consumer);
                newly_ready.push(consumer);
            }
        }
        newly_ready
    }

    /// An object lost its last copy; waiting consumers go back to Unready.
    ///
    /// Running consumers are not touched. Returns the demoted Ready tasks.
    pub fn object_lost(&mut self, object: ObjectId) -> Vec<TaskId> {
        let Some(node) = self.objects.get(&object) else {
            return Vec::new();
        };
        let mut demoted = Vec::new();
        for &consumer in &node.consumers {
            let Some(record) = self.tasks.get_mut(&consumer) else {
                continue;
            };
            match record.state {
                TaskState::Ready => {
                    record.waiting_for.insert(object);
                    record.state = TaskState::Unready;
                    self.ready.remove(&consumer);
                    demoted.push(consumer);
                }
                TaskState::Unready => {
                    record.waiting_for.insert(object);
                }
                _ => {}
            }
        }
        demoted
    }

    /// Put a Running or Finished task back in the queue, recomputing what it
    /// waits for from the store.
    ///
    /// Returns the new state, or `None` if the task is unknown or Failed.
    pub fn reset_to_pending(&mut self, id: TaskId, store: &ObjectStore) -> Option<TaskState> {
        let record = self.tasks.get_mut(&id)?;
        if record.state == TaskState::Failed {
            return None;
        }
        record.assignment = None;
        record.cancel_requested = false;
        record.waiting_for = record
            .distinct_inputs()
            .into_iter()
            .filter(|input| !store.is_available(*input))
            .collect();

        if record.waiting_for.is_empty() {
            record.state = TaskState::Ready;
            self.ready.insert(id);
        } else {
            record.state = TaskState::Unready;
            self.ready.remove(&id);
        }
        debug!(task = %id, state = ?record.state, "task re-queued");
        Some(record.state)
    }

    /// Fail `id` with `reason` and propagate `DependencyFailed` to all
    /// transitive dependents that have not started.
    pub fn mark_failed(&mut self, id: TaskId, reason: FailureReason) -> GraphStep {
        let newly_failed =
            FailurePropagator::new(&mut self.tasks, &self.objects, &mut self.ready).fail(id, reason);
        GraphStep {
            newly_ready: Vec::new(),
            newly_failed,
        }
    }

    /// Drop every task and object of `session`.
    pub fn remove_session(&mut self, session: SessionId) -> (Vec<TaskId>, Vec<ObjectId>) {
        let tasks: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|record| record.session == session)
            .map(|record| record.id)
            .collect();
        let objects: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|node| node.session == session)
            .map(|node| node.id)
            .collect();

        for id in &tasks {
            self.tasks.remove(id);
            self.ready.remove(id);
        }
        for id in &objects {
            self.objects.remove(id);
        }
        (tasks, objects)
    }
}
