// src/engine/consistency.rs

//! Cross-checks between the graph, the store and the registry.
//!
//! Only run when `coordinator.debug_consistency_checks` is enabled, and by
//! the tests after every step.

use std::collections::BTreeMap;

use crate::engine::core::Governor;
use crate::graph::TaskState;
use crate::store::Location;
use crate::types::{Resources, WorkerId};

impl Governor {
    /// Returns every violated invariant as a human readable line.
    pub fn check_consistency(&self) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        for object in self.store.objects() {
            if self.graph.object(object.id).is_none() {
                violations.push(format!("{} is in the store but not in the graph", object.id));
            }
            for task in &object.holds {
                match self.graph.task(*task) {
                    Some(record) if record.state.is_pending() && record.inputs.contains(&object.id) => {}
                    Some(record) => violations.push(format!(
                        "{} held by {} in state {:?}",
                        object.id, task, record.state
                    )),
                    None => violations.push(format!("{} held by unknown task {}", object.id, task)),
                }
            }
            if let Location::Placed { replicas } = &object.location {
                for worker in replicas.keys() {
                    let indexed = self
                        .registry
                        .get(*worker)
                        .is_some_and(|w| w.objects.contains(&object.id));
                    if !indexed {
                        violations.push(format!(
                            "{} placed on {} but missing from its registry index",
                            object.id, worker
                        ));
                    }
                }
            }
        }

        for node in self.graph.objects() {
            if !self.store.contains(node.id) {
                violations.push(format!("{} is in the graph but not in the store", node.id));
            }
        }

        let mut committed: BTreeMap<WorkerId, Resources> = BTreeMap::new();
        for task in self.graph.tasks() {
            if task.state.is_pending() {
                for input in task.distinct_inputs() {
                    let held = self
                        .store
                        .get(input)
                        .is_some_and(|record| record.holds.contains(&task.id));
                    if !held {
                        violations.push(format!("{} does not hold its input {}", task.id, input));
                    }
                }
            }
            match task.state {
                TaskState::Ready => {
                    for input in task.distinct_inputs() {
                        if !self.store.is_available(input) {
                            violations.push(format!(
                                "{} is Ready but input {} is unavailable",
                                task.id, input
                            ));
                        }
                    }
                }
                TaskState::Running => match task.assignment {
                    Some(assignment) => {
                        let listed = self
                            .registry
                            .get(assignment.worker)
                            .is_some_and(|w| w.running.contains(&task.id));
                        if !listed {
                            violations.push(format!(
                                "{} runs on {} but is not in its running set",
                                task.id, assignment.worker
                            ));
                        }
                        let total = committed.entry(assignment.worker).or_default();
                        *total = total.add(&task.resources);
                    }
                    None => violations.push(format!("{} is Running without an assignment", task.id)),
                },
                _ => {}
            }
        }

        for worker in self.registry.workers() {
            for object in &worker.objects {
                let placed = self
                    .store
                    .get(*object)
                    .is_some_and(|record| record.is_held_by(worker.id));
                if !placed {
                    violations.push(format!(
                        "{} indexes {} but the store has no copy there",
                        worker.id, object
                    ));
                }
            }
            let expected = committed.remove(&worker.id).unwrap_or_default();
            if worker.committed != expected {
                violations.push(format!(
                    "{} has committed {:?}, running tasks need {:?}",
                    worker.id, worker.committed, expected
                ));
            }
        }
        for worker in committed.keys() {
            violations.push(format!("tasks are assigned to unregistered {worker}"));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
