// src/engine/event_handlers.rs

//! Worker-facing event handling for the coordinator core.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::engine::core::Governor;
use crate::errors::StoreError;
use crate::graph::TaskState;
use crate::protocol::{DispatchResult, FromWorker, ObjectMetadata, TaskOutcome, ToClient, ToWorker};
use crate::registry::WorkerInfo;
use crate::store::Location;
use crate::types::{
    ClientId, DispatchRejection, FailureReason, LoadSnapshot, ObjectId, TaskId, WorkerId,
};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    SendToWorker { worker: WorkerId, message: ToWorker },
    SendToClient { client: ClientId, message: ToClient },
    /// Deliver `DispatchTimedOut` after the dispatch timeout.
    ArmDispatchTimer {
        task: TaskId,
        worker: WorkerId,
        attempt: u32,
    },
    /// Close the connection of a worker declared dead by missed heartbeats.
    DisconnectWorker { worker: WorkerId },
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl Governor {
    pub(super) fn handle_worker_registered(
        &mut self,
        worker: WorkerId,
        info: WorkerInfo,
        at: Instant,
    ) {
        if let Err(err) = self.registry.register(worker, info, at) {
            warn!(worker = %worker, error = %err, "ignoring registration");
            return;
        }
        self.needs_scheduling = true;
    }

    pub(super) fn handle_worker_message(
        &mut self,
        worker: WorkerId,
        message: FromWorker,
        at: Instant,
    ) {
        let Some(was_schedulable) = self.registry.get(worker).map(|w| w.is_schedulable()) else {
            warn!(worker = %worker, ?message, "message from unknown worker ignored");
            return;
        };
        self.registry.touch(worker, at);

        match message {
            FromWorker::DispatchAck {
                task,
                attempt,
                result,
            } => self.on_dispatch_ack(worker, task, attempt, result),
            FromWorker::TaskReport {
                task,
                attempt,
                outcome,
                outputs,
            } => self.on_task_report(worker, task, attempt, outcome, outputs),
            FromWorker::ObjectTransferComplete { object, size } => {
                self.on_transfer_complete(worker, object, size)
            }
            FromWorker::ObjectTransferFailed { object, reason } => {
                self.pending_transfers.remove(&(object, worker));
                debug!(object = %object, worker = %worker, %reason, "replication failed; consumers will pull on demand");
            }
            FromWorker::Heartbeat {
                worker: reported,
                load,
            } => {
                if reported != worker {
                    warn!(worker = %worker, reported = %reported, "heartbeat carries another worker id");
                }
                self.on_heartbeat(worker, load, at);
            }
            FromWorker::ObjectsSpilled { objects } => {
                for object in objects {
                    self.store.mark_spilled(object, worker);
                }
            }
        }

        if !was_schedulable
            && self
                .registry
                .get(worker)
                .is_some_and(|w| w.is_schedulable())
        {
            self.needs_scheduling = true;
        }
    }

    /// Whether `(worker, attempt)` is the live assignment of a Running task.
    fn is_current(&self, task: TaskId, worker: WorkerId, attempt: u32) -> bool {
        self.graph.task(task).is_some_and(|record| {
            record.state == TaskState::Running
                && record
                    .assignment
                    .is_some_and(|a| a.worker == worker && a.attempt == attempt)
        })
    }

    fn on_dispatch_ack(
        &mut self,
        worker: WorkerId,
        task: TaskId,
        attempt: u32,
        result: DispatchResult,
    ) {
        if !self.is_current(task, worker, attempt) {
            warn!(task = %task, worker = %worker, attempt, "stale dispatch acknowledgement ignored");
            return;
        }

        match result {
            DispatchResult::Accepted | DispatchResult::Rejected(DispatchRejection::AlreadyRunning) => {
                if let Some(assignment) = self
                    .graph
                    .task_mut(task)
                    .and_then(|record| record.assignment.as_mut())
                {
                    assignment.acknowledged = true;
                }
                debug!(task = %task, worker = %worker, ?result, "dispatch acknowledged");
            }
            DispatchResult::Rejected(DispatchRejection::ResourceUnavailable) => {
                debug!(task = %task, worker = %worker, "worker has no room; rescheduling");
                self.unassign(task, worker);
                self.registry.mark_saturated(worker);
                self.requeue_or_cancel(task);
            }
        }
    }

    fn unassign(&mut self, task: TaskId, worker: WorkerId) {
        if let Some(record) = self.graph.task(task) {
            let resources = record.resources;
            self.registry.uncommit(worker, task, resources);
        }
    }

    fn on_task_report(
        &mut self,
        worker: WorkerId,
        task: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
        outputs: Vec<ObjectMetadata>,
    ) {
        if !self.is_current(task, worker, attempt) {
            self.discard_report(worker, task, &outcome, &outputs);
            return;
        }

        self.unassign(task, worker);
        match outcome {
            TaskOutcome::Finished => self.on_task_finished(worker, task, outputs),
            TaskOutcome::Failed(reason) => self.on_task_failed(task, reason),
        }
    }

    /// Duplicate or stale report: no state change. Outputs the coordinator
    /// does not track on this worker are deleted there.
    fn discard_report(
        &mut self,
        worker: WorkerId,
        task: TaskId,
        outcome: &TaskOutcome,
        outputs: &[ObjectMetadata],
    ) {
        debug!(task = %task, worker = %worker, ?outcome, "stale or duplicate task report ignored");
        if *outcome != TaskOutcome::Finished {
            return;
        }
        let untracked: Vec<ObjectId> = outputs
            .iter()
            .map(|meta| meta.object)
            .filter(|object| {
                !self
                    .store
                    .get(*object)
                    .is_some_and(|record| record.is_held_by(worker))
            })
            .collect();
        if !untracked.is_empty() {
            self.send_worker(worker, ToWorker::RemoveObjects { objects: untracked });
        }
    }

    fn on_task_finished(&mut self, worker: WorkerId, task: TaskId, outputs: Vec<ObjectMetadata>) {
        let Some(declared) = self.graph.task(task).map(|record| record.outputs.clone()) else {
            return;
        };

        let reported: BTreeSet<ObjectId> = outputs.iter().map(|meta| meta.object).collect();
        let expected: BTreeSet<ObjectId> = declared.iter().copied().collect();
        if outputs.len() != declared.len() || reported != expected {
            warn!(
                task = %task,
                worker = %worker,
                reported = outputs.len(),
                expected = declared.len(),
                "task reported outputs that do not match its declaration"
            );
            let objects = reported.into_iter().collect();
            self.send_worker(worker, ToWorker::RemoveObjects { objects });
            self.fail_task(
                task,
                FailureReason::Application(format!(
                    "task produced {} outputs, expected {}",
                    outputs.len(),
                    declared.len()
                )),
            );
            return;
        }

        for meta in &outputs {
            // A recomputed output may have been collected earlier.
            self.store.revive(meta.object);
            match self.record_replica(meta.object, worker, meta.size, meta.spilled) {
                Ok(_) => {}
                Err(StoreError::UnknownObject(object)) => {
                    warn!(task = %task, object = %object, "finished task produced unknown object");
                }
                Err(err) => warn!(task = %task, error = %err, "could not record output"),
            }
        }

        self.release_inputs(task);
        let step = self.graph.mark_finished(task, &declared);
        info!(task = %task, worker = %worker, newly_ready = step.newly_ready.len(), "task finished");
        self.report_terminal(task);
        // Consumers may be Ready and the worker's slot is free again.
        self.needs_scheduling = true;
    }

    fn on_task_failed(&mut self, task: TaskId, reason: FailureReason) {
        if reason.is_transient() {
            let attempts = self.graph.task(task).map_or(0, |record| record.attempts);
            if attempts < self.options.max_task_attempts {
                info!(task = %task, attempts, %reason, "transient failure; re-queueing task");
                self.requeue_or_cancel(task);
                return;
            }
            warn!(task = %task, attempts, %reason, "giving up after repeated transient failures");
        }

        info!(task = %task, %reason, "task failed");
        self.fail_task(task, reason);
        self.needs_scheduling = true;
    }

    fn on_transfer_complete(&mut self, worker: WorkerId, object: ObjectId, size: u64) {
        self.pending_transfers.remove(&(object, worker));

        let collected = self
            .store
            .get(object)
            .is_none_or(|record| record.location == Location::Removed);
        if collected {
            debug!(object = %object, worker = %worker, "transferred object no longer needed");
            self.send_worker(
                worker,
                ToWorker::RemoveObjects {
                    objects: vec![object],
                },
            );
            return;
        }

        let was_available = self.store.is_available(object);
        match self.record_replica(object, worker, size, false) {
            Ok(true) => debug!(object = %object, worker = %worker, "replica recorded"),
            Ok(false) => {}
            Err(err) => warn!(object = %object, worker = %worker, error = %err, "could not record replica"),
        }
        if !was_available && !self.graph.object_available(object).is_empty() {
            self.needs_scheduling = true;
        }
    }

    fn on_heartbeat(&mut self, worker: WorkerId, load: LoadSnapshot, at: Instant) {
        match self.registry.heartbeat(worker, load, at) {
            Ok(true) => self.needs_scheduling = true,
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "heartbeat from unknown worker");
                return;
            }
        }

        let Some(record) = self.registry.get(worker) else {
            return;
        };
        let capacity = record.info.capacity.memory_bytes;
        if capacity == 0 || load.memory_used_bytes <= capacity {
            return;
        }

        let excess = load.memory_used_bytes - capacity;
        let held = record.objects.clone();
        let in_use: BTreeSet<ObjectId> = record
            .running
            .iter()
            .filter_map(|task| self.graph.task(*task))
            .flat_map(|task| task.inputs.iter().copied())
            .collect();
        let evicted = self.store.evict(worker, excess, &held, &in_use);
        if evicted.is_empty() {
            return;
        }
        info!(worker = %worker, excess, evicted = evicted.len(), "evicting objects under memory pressure");
        for &object in &evicted {
            self.registry.remove_object(worker, object);
        }
        self.send_worker(worker, ToWorker::RemoveObjects { objects: evicted });
    }

    pub(super) fn handle_dispatch_timeout(&mut self, task: TaskId, worker: WorkerId, attempt: u32) {
        let unacknowledged = self.is_current(task, worker, attempt)
            && self
                .graph
                .task(task)
                .and_then(|record| record.assignment)
                .is_some_and(|a| !a.acknowledged);
        if !unacknowledged {
            return;
        }

        warn!(task = %task, worker = %worker, attempt, "dispatch not acknowledged in time; moving task");
        self.unassign(task, worker);
        if let Some(record) = self.graph.task_mut(task) {
            record.avoid.insert(worker);
        }
        if self.registry.contains(worker) {
            self.send_worker(worker, ToWorker::Cancel { task });
        }
        self.requeue_or_cancel(task);
    }

    pub(super) fn handle_tick(&mut self, now: Instant) {
        let report = self.registry.check_liveness(now);
        for worker in report.disconnected {
            self.outbox.push(CoreCommand::DisconnectWorker { worker });
            self.handle_worker_lost(worker);
        }

        self.run_gc();

        if self.graph.ready_len() > 0 {
            self.needs_scheduling = true;
        }
    }

    pub(super) fn handle_shutdown(&mut self) {
        info!(workers = self.registry.len(), "shutting down");
        let workers: Vec<WorkerId> = self.registry.workers().map(|w| w.id).collect();
        for worker in workers {
            self.send_worker(worker, ToWorker::Shutdown);
        }
    }
}
