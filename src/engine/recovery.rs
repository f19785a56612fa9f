// src/engine/recovery.rs

//! Worker loss and lineage-based recomputation of lost objects.
//!
//! When a worker goes away, its running tasks are re-queued and every object
//! whose only copy it held becomes unplaced. Objects somebody still needs are
//! recomputed by re-running their (finished) producers, recursively through
//! any inputs that are gone as well. Objects that cannot be rebuilt fail
//! their pending consumers, with `DependencyFailed` when the producer
//! itself failed on its re-run.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::engine::core::Governor;
use crate::graph::TaskState;
use crate::protocol::ClientEvent;
use crate::types::{FailureReason, ObjectId, TaskId, WorkerId};

/// Work needed to bring a set of lost objects back.
#[derive(Debug, Default, Clone)]
struct RecoveryPlan {
    /// Finished producers to run again.
    requeue: BTreeSet<TaskId>,
    /// Collected objects that have to exist again before re-running.
    revive: BTreeSet<ObjectId>,
}

impl Governor {
    pub(crate) fn handle_worker_lost(&mut self, worker: WorkerId) {
        let Some(record) = self.registry.on_disconnect(worker) else {
            debug!(worker = %worker, "loss of unknown worker ignored");
            return;
        };
        warn!(
            worker = %worker,
            running = record.running.len(),
            objects = record.objects.len(),
            "worker lost"
        );
        self.pending_transfers.retain(|(_, target)| *target != worker);

        let lost = self.store.drop_worker(worker, &record.objects);
        for &object in &lost {
            self.graph.object_lost(object);
        }

        let mut needed: BTreeSet<ObjectId> = BTreeSet::new();
        for &task in &record.running {
            let assigned_here = self.graph.task(task).is_some_and(|t| {
                t.state == TaskState::Running && t.assignment.is_some_and(|a| a.worker == worker)
            });
            if assigned_here {
                info!(task = %task, worker = %worker, "re-queueing task of lost worker");
                needed.extend(self.requeue(task));
            }
        }

        needed.extend(
            lost.into_iter()
                .filter(|object| self.store.get(*object).is_some_and(|r| r.is_needed())),
        );
        let needed: Vec<ObjectId> = needed.into_iter().collect();
        self.recover_objects(&needed, Some(worker));
        self.needs_scheduling = true;
    }

    /// Schedule recomputation of `objects`. Pending consumers of those that
    /// cannot be rebuilt fail.
    pub(crate) fn recover_objects(&mut self, objects: &[ObjectId], lost_on: Option<WorkerId>) {
        if objects.is_empty() {
            return;
        }

        let mut plan = RecoveryPlan::default();
        let mut memo = BTreeMap::new();
        let mut unrecoverable = Vec::new();
        for &object in objects {
            let mut scratch = plan.clone();
            let mut scratch_memo = memo.clone();
            if self.recover(object, &mut scratch, &mut scratch_memo) {
                plan = scratch;
                memo = scratch_memo;
            } else {
                memo.insert(object, false);
                unrecoverable.push(object);
            }
        }

        for &object in &plan.revive {
            self.store.revive(object);
        }
        for &task in &plan.requeue {
            info!(task = %task, "re-running finished task to recompute lost output");
            self.acquire_inputs(task);
            self.graph.reset_to_pending(task, &self.store);
        }

        for object in unrecoverable {
            warn!(object = %object, "lost object cannot be recomputed");
            let failed_producer = self
                .store
                .get(object)
                .and_then(|record| record.producer)
                .filter(|producer| self.graph.state_of(*producer) == Some(TaskState::Failed));
            let reason = match (failed_producer, lost_on) {
                (Some(task), _) => FailureReason::DependencyFailed { task },
                (None, Some(worker)) => FailureReason::WorkerLost { worker },
                (None, None) => FailureReason::InputUnavailable { object },
            };
            for consumer in self.graph.pending_consumers(object) {
                let waiting = matches!(
                    self.graph.state_of(consumer),
                    Some(TaskState::Unready | TaskState::Ready)
                );
                if waiting {
                    self.fail_task(consumer, reason.clone());
                }
            }
            let pinned = self.store.get(object).is_some_and(|r| r.pinned);
            let session = self.graph.object(object).map(|node| node.session);
            if let (true, Some(session)) = (pinned, session) {
                self.notify_session(session, ClientEvent::ObjectLost { object });
            }
        }
    }

    /// Whether `object` is or will become available, extending `plan` with
    /// the producers that must run again.
    fn recover(
        &self,
        object: ObjectId,
        plan: &mut RecoveryPlan,
        memo: &mut BTreeMap<ObjectId, bool>,
    ) -> bool {
        if let Some(&known) = memo.get(&object) {
            return known;
        }
        let outcome = self.recover_uncached(object, plan, memo);
        memo.insert(object, outcome);
        outcome
    }

    fn recover_uncached(
        &self,
        object: ObjectId,
        plan: &mut RecoveryPlan,
        memo: &mut BTreeMap<ObjectId, bool>,
    ) -> bool {
        if self.store.is_available(object) {
            return true;
        }
        let Some(producer) = self.store.get(object).and_then(|r| r.producer) else {
            return false;
        };
        let Some(task) = self.graph.task(producer) else {
            return false;
        };
        if plan.requeue.contains(&producer) {
            if self.store.is_removed(object) {
                plan.revive.insert(object);
            }
            return true;
        }
        match task.state {
            TaskState::Unready | TaskState::Ready | TaskState::Running => true,
            TaskState::Failed => false,
            TaskState::Finished => {
                for input in task.distinct_inputs() {
                    if !self.recover(input, plan, memo) {
                        return false;
                    }
                    if self.store.is_removed(input) {
                        plan.revive.insert(input);
                    }
                }
                plan.requeue.insert(producer);
                if self.store.is_removed(object) {
                    plan.revive.insert(object);
                }
                true
            }
        }
    }
}
