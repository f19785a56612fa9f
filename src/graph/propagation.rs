// src/graph/propagation.rs

//! Failure propagation through the dependency edges.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::graph::task::{ObjectNode, TaskRecord, TaskState};
use crate::types::{FailureReason, ObjectId, TaskId};

/// Marks a task failed together with everything downstream of it.
pub(crate) struct FailurePropagator<'a> {
    tasks: &'a mut HashMap<TaskId, TaskRecord>,
    objects: &'a HashMap<ObjectId, ObjectNode>,
    ready: &'a mut BTreeSet<TaskId>,
}

impl<'a> FailurePropagator<'a> {
    pub(crate) fn new(
        tasks: &'a mut HashMap<TaskId, TaskRecord>,
        objects: &'a HashMap<ObjectId, ObjectNode>,
        ready: &'a mut BTreeSet<TaskId>,
    ) -> Self {
        Self {
            tasks,
            objects,
            ready,
        }
    }

    /// Fail `root` with `reason` and every transitive dependent that has not
    /// started yet with `DependencyFailed`.
    ///
    /// Running dependents already hold their inputs and are left alone.
    /// Returns the failed tasks, root first.
    pub(crate) fn fail(&mut self, root: TaskId, reason: FailureReason) -> Vec<TaskId> {
        let Some(record) = self.tasks.get_mut(&root) else {
            return Vec::new();
        };
        if record.state.is_terminal() {
            return Vec::new();
        }

        record.state = TaskState::Failed;
        record.failure = Some(reason);
        record.assignment = None;
        self.ready.remove(&root);

        let mut newly_failed = vec![root];
        let mut stack = self.dependents_of(root);

        while let Some(id) = stack.pop() {
            let Some(info) = self.tasks.get_mut(&id) else {
                continue;
            };
            match info.state {
                TaskState::Unready | TaskState::Ready => {
                    info.state = TaskState::Failed;
                    info.failure = Some(FailureReason::DependencyFailed { task: root });
                    self.ready.remove(&id);
                    debug!(task = %id, upstream = %root, "dependent failed due to upstream failure");
                    newly_failed.push(id);
                    stack.extend(self.dependents_of(id));
                }
                TaskState::Running | TaskState::Finished | TaskState::Failed => {}
            }
        }

        newly_failed
    }

    fn dependents_of(&self, task: TaskId) -> Vec<TaskId> {
        let Some(record) = self.tasks.get(&task) else {
            return Vec::new();
        };
        record
            .outputs
            .iter()
            .filter_map(|object| self.objects.get(object))
            .flat_map(|node| node.consumers.iter().copied())
            .collect()
    }
}
