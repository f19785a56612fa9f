// src/engine/sessions.rs

//! Client connections, sessions and submissions.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::engine::core::{Governor, SessionRecord};
use crate::errors::GraphError;
use crate::graph::{ObjectSpec, TaskSpec, TaskState};
use crate::protocol::{FetchResult, FromClient, ServerInfo, ToClient, ToWorker, WorkerSummary};
use crate::store::Location;
use crate::types::{ClientId, FailureReason, ObjectId, SessionId, SubmissionId, TaskId};

impl Governor {
    pub(super) fn handle_client_connected(&mut self, client: ClientId) {
        info!(client = %client, "client connected");
        self.clients.entry(client).or_default();
    }

    pub(super) fn handle_client_disconnected(&mut self, client: ClientId) {
        let sessions = self.clients.remove(&client).unwrap_or_default();
        info!(client = %client, sessions = sessions.len(), "client disconnected");
        for session in sessions {
            self.close_session(session);
        }
    }

    pub(super) fn handle_client_request(&mut self, client: ClientId, request: FromClient) {
        match request {
            FromClient::OpenSession => {
                let session = SessionId(self.next_session);
                self.next_session += 1;
                self.sessions.insert(session, SessionRecord { client });
                self.clients.entry(client).or_default().insert(session);
                info!(client = %client, session = %session, "session opened");
                self.send_client(client, ToClient::SessionOpened { session });
            }
            FromClient::Submit {
                session,
                tasks,
                objects,
            } => {
                let reply = match self.submit(client, session, tasks, objects) {
                    Ok(submission) => ToClient::Submitted { submission },
                    Err(err) => {
                        warn!(client = %client, session = %session, error = %err, "submission rejected");
                        ToClient::SubmitRejected(err)
                    }
                };
                self.send_client(client, reply);
            }
            FromClient::Unkeep { session, objects } => {
                if self.owns(client, session) {
                    self.unkeep(session, &objects);
                }
            }
            FromClient::Cancel { session, tasks } => {
                if self.owns(client, session) {
                    self.cancel(session, &tasks);
                }
            }
            FromClient::Fetch { session, object } => {
                let result = if self.owns(client, session) {
                    self.fetch(session, object)
                } else {
                    FetchResult::NotAvailable
                };
                self.send_client(client, ToClient::FetchReply { object, result });
            }
            FromClient::CloseSession { session } => {
                if self.owns(client, session) {
                    self.close_session(session);
                }
                self.send_client(client, ToClient::SessionClosed { session });
            }
            FromClient::ServerInfo => {
                let info = self.server_info();
                self.send_client(client, ToClient::ServerInfo(info));
            }
        }
    }

    fn owns(&self, client: ClientId, session: SessionId) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|record| record.client == client)
    }

    /// Validate and ingest a submission. Nothing changes on rejection.
    fn submit(
        &mut self,
        client: ClientId,
        session: SessionId,
        tasks: Vec<TaskSpec>,
        mut objects: Vec<ObjectSpec>,
    ) -> Result<SubmissionId, GraphError> {
        if !self.owns(client, session) {
            return Err(GraphError::UnknownSession { session, client });
        }
        self.graph
            .validate_submission(&self.store, session, &tasks, &objects)?;

        let producers: BTreeMap<ObjectId, TaskId> = tasks
            .iter()
            .flat_map(|task| task.outputs.iter().map(move |object| (*object, task.id)))
            .collect();
        for spec in objects.iter_mut() {
            self.store.register(
                spec.id,
                session,
                producers.get(&spec.id).copied(),
                spec.keep,
                spec.data.take(),
            );
        }

        let task_ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
        let task_count = tasks.len();
        let ready = self
            .graph
            .insert_submission(session, tasks, &objects, &self.store);
        let mut stale_inputs = BTreeSet::new();
        for task in task_ids {
            self.acquire_inputs(task);
            if let Some(record) = self.graph.task(task) {
                stale_inputs.extend(
                    record
                        .distinct_inputs()
                        .into_iter()
                        .filter(|input| self.needs_recompute(*input)),
                );
            }
        }
        // Inputs from earlier submissions whose only copy was lost meanwhile.
        let stale_inputs: Vec<ObjectId> = stale_inputs.into_iter().collect();
        self.recover_objects(&stale_inputs, None);

        let submission = SubmissionId(self.next_submission);
        self.next_submission += 1;
        info!(
            session = %session,
            submission = %submission,
            tasks = task_count,
            objects = objects.len(),
            ready = ready.len(),
            "submission accepted"
        );
        self.needs_scheduling = true;
        Ok(submission)
    }

    fn needs_recompute(&self, object: ObjectId) -> bool {
        !self.store.is_available(object)
            && self
                .store
                .get(object)
                .and_then(|record| record.producer)
                .and_then(|producer| self.graph.state_of(producer))
                == Some(TaskState::Finished)
    }

    fn unkeep(&mut self, session: SessionId, objects: &[ObjectId]) {
        for &object in objects {
            let in_session = self
                .store
                .get(object)
                .is_some_and(|record| record.session == session);
            if in_session {
                self.store.unpin(object);
                debug!(object = %object, "object unpinned");
            }
        }
    }

    fn cancel(&mut self, session: SessionId, tasks: &[TaskId]) {
        for &task in tasks {
            let Some(record) = self.graph.task(task) else {
                continue;
            };
            if record.session != session {
                continue;
            }
            match record.state {
                TaskState::Unready | TaskState::Ready => {
                    info!(task = %task, "task cancelled before dispatch");
                    self.fail_task(task, FailureReason::Cancelled);
                }
                TaskState::Running => {
                    if record.cancel_requested {
                        continue;
                    }
                    let worker = record.assignment.map(|a| a.worker);
                    if let Some(record) = self.graph.task_mut(task) {
                        record.cancel_requested = true;
                    }
                    if let Some(worker) = worker {
                        info!(task = %task, worker = %worker, "cancelling running task");
                        self.send_worker(worker, ToWorker::Cancel { task });
                    }
                }
                TaskState::Finished | TaskState::Failed => {}
            }
        }
    }

    fn fetch(&self, session: SessionId, object: ObjectId) -> FetchResult {
        let Some(record) = self.store.get(object) else {
            return FetchResult::NotAvailable;
        };
        if record.session != session {
            return FetchResult::NotAvailable;
        }
        match &record.location {
            Location::Uploaded(bytes) => FetchResult::Inline(bytes.clone()),
            Location::Placed { replicas } => self
                .preferred_holder(replicas.keys().copied())
                .and_then(|worker| {
                    self.registry.get(worker).map(|w| FetchResult::Worker {
                        worker,
                        address: w.info.data_address.clone(),
                    })
                })
                .unwrap_or(FetchResult::NotAvailable),
            Location::Unplaced | Location::Removed => FetchResult::NotAvailable,
        }
    }

    /// Cancel running tasks of `session`, delete its objects everywhere and
    /// forget its records.
    pub(super) fn close_session(&mut self, session: SessionId) {
        let Some(record) = self.sessions.remove(&session) else {
            return;
        };
        if let Some(sessions) = self.clients.get_mut(&record.client) {
            sessions.remove(&session);
        }

        let running: Vec<_> = self
            .graph
            .tasks()
            .filter(|task| task.session == session && task.state == TaskState::Running)
            .filter_map(|task| task.assignment.map(|a| (task.id, a.worker, task.resources)))
            .collect();
        for (task, worker, resources) in running {
            self.registry.uncommit(worker, task, resources);
            self.send_worker(worker, ToWorker::Cancel { task });
        }

        let (tasks, objects) = self.graph.remove_session(session);
        let removals = self.store.remove_session(session);
        for (worker, removed) in removals {
            for &object in &removed {
                self.registry.remove_object(worker, object);
            }
            if self.registry.contains(worker) {
                self.send_worker(worker, ToWorker::RemoveObjects { objects: removed });
            }
        }

        let objects: BTreeSet<ObjectId> = objects.into_iter().collect();
        self.pending_transfers
            .retain(|(object, _)| !objects.contains(object));
        info!(
            session = %session,
            tasks = tasks.len(),
            objects = objects.len(),
            "session closed"
        );
        self.needs_scheduling = true;
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            workers: self
                .registry
                .workers()
                .map(|w| WorkerSummary {
                    id: w.id,
                    address: w.info.address.clone(),
                    data_address: w.info.data_address.clone(),
                    liveness: w.liveness,
                    capacity: w.info.capacity,
                    committed: w.committed,
                    running: w.running.iter().copied().collect(),
                    objects: w.objects.iter().copied().collect(),
                })
                .collect(),
        }
    }
}
