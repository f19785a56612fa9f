// src/engine/core.rs

//! Pure coordinator state machine.
//!
//! [`Governor`] consumes [`GovernorEvent`]s and produces an updated state
//! plus a list of [`CoreCommand`]s for the IO shell. It has no channels, no
//! Tokio types and performs no IO, so it can be driven step by step in
//! tests.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, trace, warn};

use crate::engine::event_handlers::{CoreCommand, CoreStep};
use crate::engine::{GovernorEvent, GovernorOptions};
use crate::errors::StoreError;
use crate::graph::{Assignment, GraphStep, TaskGraph, TaskState};
use crate::protocol::{ClientEvent, DataSource, DispatchRequest, InputLocation, ToClient, ToWorker};
use crate::registry::{Liveness, WorkerRegistry};
use crate::scheduler::{Placement, Scheduler};
use crate::store::{Location, ObjectStore};
use crate::types::{ClientId, FailureReason, ObjectId, SessionId, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRecord {
    pub client: ClientId,
}

/// Authoritative coordinator state: task graph, object store and worker
/// registry behind one `step` function.
#[derive(Debug)]
pub struct Governor {
    pub(super) graph: TaskGraph,
    pub(super) store: ObjectStore,
    pub(super) registry: WorkerRegistry,
    pub(super) scheduler: Scheduler,
    pub(super) sessions: BTreeMap<SessionId, SessionRecord>,
    pub(super) clients: BTreeMap<ClientId, BTreeSet<SessionId>>,
    pub(super) options: GovernorOptions,
    /// Replication requests in flight, as `(object, target)`.
    pub(super) pending_transfers: BTreeSet<(ObjectId, WorkerId)>,
    pub(super) outbox: Vec<CoreCommand>,
    pub(super) needs_scheduling: bool,
    pub(super) next_session: u64,
    pub(super) next_submission: u64,
}

impl Governor {
    pub fn new(options: GovernorOptions) -> Self {
        Self {
            graph: TaskGraph::new(),
            store: ObjectStore::new(),
            registry: WorkerRegistry::new(options.liveness),
            scheduler: Scheduler::new(options.weights),
            sessions: BTreeMap::new(),
            clients: BTreeMap::new(),
            options,
            pending_transfers: BTreeSet::new(),
            outbox: Vec::new(),
            needs_scheduling: false,
            next_session: 1,
            next_submission: 1,
        }
    }

    pub fn options(&self) -> &GovernorOptions {
        &self.options
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.graph.state_of(task)
    }

    /// Handle a single event and return the commands for the IO shell.
    pub fn step(&mut self, event: GovernorEvent) -> CoreStep {
        let keep_running = match event {
            GovernorEvent::WorkerRegistered { worker, info, at } => {
                self.handle_worker_registered(worker, info, at);
                true
            }
            GovernorEvent::WorkerMessage {
                worker,
                message,
                at,
            } => {
                self.handle_worker_message(worker, message, at);
                true
            }
            GovernorEvent::WorkerConnectionLost { worker } => {
                self.handle_worker_lost(worker);
                true
            }
            GovernorEvent::ClientConnected { client } => {
                self.handle_client_connected(client);
                true
            }
            GovernorEvent::ClientRequest { client, request } => {
                self.handle_client_request(client, request);
                true
            }
            GovernorEvent::ClientDisconnected { client } => {
                self.handle_client_disconnected(client);
                true
            }
            GovernorEvent::DispatchTimedOut {
                task,
                worker,
                attempt,
            } => {
                self.handle_dispatch_timeout(task, worker, attempt);
                true
            }
            GovernorEvent::Tick { now } => {
                self.handle_tick(now);
                true
            }
            GovernorEvent::ShutdownRequested => {
                self.handle_shutdown();
                false
            }
        };

        if keep_running && self.needs_scheduling {
            self.run_scheduler();
        }

        if self.options.debug_consistency_checks {
            if let Err(violations) = self.check_consistency() {
                for violation in violations {
                    error!(%violation, "coordinator state is inconsistent");
                }
            }
        }

        CoreStep {
            commands: std::mem::take(&mut self.outbox),
            keep_running,
        }
    }

    pub(super) fn send_worker(&mut self, worker: WorkerId, message: ToWorker) {
        self.outbox.push(CoreCommand::SendToWorker { worker, message });
    }

    pub(super) fn send_client(&mut self, client: ClientId, message: ToClient) {
        self.outbox.push(CoreCommand::SendToClient { client, message });
    }

    /// Push an event to the client that owns `session`.
    pub(super) fn notify_session(&mut self, session: SessionId, event: ClientEvent) {
        match self.sessions.get(&session) {
            Some(record) => {
                let client = record.client;
                self.send_client(client, ToClient::Event(event));
            }
            None => trace!(session = %session, ?event, "no client for session event"),
        }
    }

    /// Store placement plus the registry's per-worker index, kept in step.
    pub(super) fn record_replica(
        &mut self,
        object: ObjectId,
        worker: WorkerId,
        size: u64,
        spilled: bool,
    ) -> Result<bool, StoreError> {
        let inserted = self.store.place(object, worker, size, spilled)?;
        self.registry.add_object(worker, object);
        Ok(inserted)
    }

    /// Tell `worker` to delete `objects`, forgetting its copies.
    pub(super) fn remove_from_worker(&mut self, worker: WorkerId, objects: Vec<ObjectId>) {
        if objects.is_empty() {
            return;
        }
        for &object in &objects {
            self.store.remove_replica(object, worker);
            self.registry.remove_object(worker, object);
        }
        if self.registry.contains(worker) {
            self.send_worker(worker, ToWorker::RemoveObjects { objects });
        }
    }

    pub(super) fn acquire_inputs(&mut self, task: TaskId) {
        let Some(record) = self.graph.task(task) else {
            return;
        };
        for input in record.distinct_inputs() {
            if let Err(err) = self.store.acquire(input, task) {
                warn!(task = %task, object = %input, error = %err, "could not acquire input");
            }
        }
    }

    pub(super) fn release_inputs(&mut self, task: TaskId) {
        let Some(record) = self.graph.task(task) else {
            return;
        };
        for input in record.distinct_inputs() {
            if let Err(err) = self.store.release(input, task) {
                debug!(task = %task, object = %input, error = %err, "input not held at release");
            }
        }
    }

    /// Send the terminal event of `task` to its client, at most once.
    pub(super) fn report_terminal(&mut self, task: TaskId) {
        let Some(record) = self.graph.task_mut(task) else {
            return;
        };
        if record.reported {
            return;
        }
        let event = match (record.state, &record.failure) {
            (TaskState::Finished, _) => ClientEvent::TaskFinished { task },
            (TaskState::Failed, Some(reason)) => ClientEvent::TaskFailed {
                task,
                reason: reason.clone(),
            },
            _ => return,
        };
        record.reported = true;
        let session = record.session;
        self.notify_session(session, event);
    }

    pub(super) fn fail_task(&mut self, task: TaskId, reason: FailureReason) {
        let step = self.graph.mark_failed(task, reason);
        self.apply_failures(step);
    }

    pub(super) fn apply_failures(&mut self, step: GraphStep) {
        for task in step.newly_failed {
            self.release_inputs(task);
            self.report_terminal(task);
        }
    }

    /// Put a task whose dispatch did not work out back in the queue, unless
    /// the client already asked to cancel it.
    ///
    /// Missing inputs of a task that goes back to Unready are recovered. If
    /// one of them can never come back the task fails right away.
    pub(super) fn requeue_or_cancel(&mut self, task: TaskId) {
        let waiting = self.requeue(task);
        self.recover_objects(&waiting, None);
    }

    /// Requeue without recovery. Returns the inputs the task now waits for.
    pub(super) fn requeue(&mut self, task: TaskId) -> Vec<ObjectId> {
        let cancel = self
            .graph
            .task(task)
            .is_some_and(|record| record.cancel_requested);
        if cancel {
            self.fail_task(task, FailureReason::Cancelled);
            return Vec::new();
        }
        self.graph.reset_to_pending(task, &self.store);
        self.needs_scheduling = true;
        self.graph
            .task(task)
            .map(|record| record.waiting_for.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(super) fn run_scheduler(&mut self) {
        self.needs_scheduling = false;
        let plan = self
            .scheduler
            .schedule(&self.graph, &self.store, &self.registry);
        for placement in plan.placements {
            self.dispatch(placement);
        }
    }

    fn dispatch(&mut self, placement: Placement) {
        let Placement {
            task,
            worker,
            replicate,
        } = placement;

        for object in replicate {
            self.request_replica(object, worker);
        }

        let Some(inputs) = self.input_locations(task, worker) else {
            warn!(task = %task, worker = %worker, "input has no readable copy; task stays Ready");
            return;
        };
        let Some(record) = self.graph.task_mut(task) else {
            return;
        };
        record.attempts += 1;
        let attempt = record.attempts;
        let request = DispatchRequest {
            task,
            attempt,
            payload: record.payload.clone(),
            inputs,
            outputs: record.outputs.clone(),
            resources: record.resources,
        };

        let assignment = Assignment {
            worker,
            attempt,
            acknowledged: false,
        };
        if !self.graph.mark_running(task, assignment) {
            return;
        }
        self.registry.commit(worker, task, request.resources);
        debug!(task = %task, worker = %worker, attempt, "dispatching task");
        self.send_worker(worker, ToWorker::Dispatch(request));
        self.outbox.push(CoreCommand::ArmDispatchTimer {
            task,
            worker,
            attempt,
        });
    }

    fn input_locations(&self, task: TaskId, target: WorkerId) -> Option<Vec<InputLocation>> {
        let record = self.graph.task(task)?;
        record
            .inputs
            .iter()
            .map(|&object| {
                self.source_for(object, target)
                    .map(|source| InputLocation { object, source })
            })
            .collect()
    }

    /// Where `target` should read `object` from.
    pub(super) fn source_for(&self, object: ObjectId, target: WorkerId) -> Option<DataSource> {
        let record = self.store.get(object)?;
        match &record.location {
            Location::Uploaded(bytes) => Some(DataSource::Inline(bytes.clone())),
            Location::Placed { replicas } => {
                if replicas.contains_key(&target) {
                    return Some(DataSource::Local);
                }
                let holder = self.preferred_holder(replicas.keys().copied())?;
                Some(DataSource::Worker {
                    worker: holder,
                    address: self.registry.get(holder)?.info.data_address.clone(),
                })
            }
            Location::Unplaced | Location::Removed => None,
        }
    }

    /// First connected holder, falling back to any registered one.
    pub(super) fn preferred_holder(
        &self,
        holders: impl Iterator<Item = WorkerId> + Clone,
    ) -> Option<WorkerId> {
        holders
            .clone()
            .find(|w| {
                self.registry
                    .get(*w)
                    .is_some_and(|r| r.liveness == Liveness::Connected)
            })
            .or_else(|| holders.into_iter().find(|w| self.registry.contains(*w)))
    }

    /// Ask `target` to copy `object` ahead of a dispatch.
    fn request_replica(&mut self, object: ObjectId, target: WorkerId) {
        if self.pending_transfers.contains(&(object, target)) {
            return;
        }
        let source = match self.source_for(object, target) {
            Some(source @ DataSource::Worker { .. }) => source,
            _ => return,
        };
        self.pending_transfers.insert((object, target));
        debug!(object = %object, worker = %target, "requesting replica");
        self.send_worker(target, ToWorker::ObjectTransferRequest { object, source });
    }

    /// Collect unreferenced objects and tell their holders.
    pub(super) fn run_gc(&mut self) {
        let removals = self.store.gc_sweep();
        for (worker, objects) in removals {
            for &object in &objects {
                self.registry.remove_object(worker, object);
            }
            if self.registry.contains(worker) {
                self.send_worker(worker, ToWorker::RemoveObjects { objects });
            }
        }
    }
}
