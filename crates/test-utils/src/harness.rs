#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use taskgov::engine::{CoreCommand, CoreStep, Governor, GovernorEvent, GovernorOptions};
use taskgov::errors::GraphError;
use taskgov::graph::TaskState;
use taskgov::protocol::{
    ClientEvent, DispatchRequest, DispatchResult, FromClient, FromWorker, ObjectMetadata,
    TaskOutcome, ToClient, ToWorker,
};
use taskgov::registry::WorkerInfo;
use taskgov::types::{
    ClientId, FailureReason, LoadSnapshot, Resources, SessionId, SubmissionId, TaskId, WorkerId,
};

use crate::builders::SubmissionBuilder;

/// Size reported for every output finished through the harness.
pub const OUTPUT_SIZE: u64 = 8;

/// Drives a [`Governor`] step by step with a simulated clock, collecting
/// the messages it sends and checking its invariants after every step.
#[derive(Debug)]
pub struct ClusterHarness {
    pub governor: Governor,
    pub now: Instant,
    /// Dispatches not yet acknowledged or finished by the harness.
    pub dispatches: VecDeque<(WorkerId, DispatchRequest)>,
    /// Every non-dispatch message sent to each worker.
    pub worker_inbox: BTreeMap<WorkerId, Vec<ToWorker>>,
    pub client_inbox: BTreeMap<ClientId, VecDeque<ToClient>>,
    pub disconnected: Vec<WorkerId>,
    pub timers: Vec<(TaskId, WorkerId, u32)>,
    next_worker: u64,
    next_client: u64,
}

impl Default for ClusterHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterHarness {
    pub fn new() -> Self {
        let options = GovernorOptions {
            debug_consistency_checks: true,
            ..GovernorOptions::default()
        };
        Self::with_options(options)
    }

    pub fn with_options(options: GovernorOptions) -> Self {
        Self {
            governor: Governor::new(options),
            now: Instant::now(),
            dispatches: VecDeque::new(),
            worker_inbox: BTreeMap::new(),
            client_inbox: BTreeMap::new(),
            disconnected: Vec::new(),
            timers: Vec::new(),
            next_worker: 1,
            next_client: 1,
        }
    }

    pub fn step(&mut self, event: GovernorEvent) -> CoreStep {
        let step = self.governor.step(event);
        for command in &step.commands {
            match command.clone() {
                CoreCommand::SendToWorker {
                    worker,
                    message: ToWorker::Dispatch(request),
                } => self.dispatches.push_back((worker, request)),
                CoreCommand::SendToWorker { worker, message } => {
                    self.worker_inbox.entry(worker).or_default().push(message)
                }
                CoreCommand::SendToClient { client, message } => {
                    self.client_inbox.entry(client).or_default().push_back(message)
                }
                CoreCommand::ArmDispatchTimer {
                    task,
                    worker,
                    attempt,
                } => self.timers.push((task, worker, attempt)),
                CoreCommand::DisconnectWorker { worker } => self.disconnected.push(worker),
            }
        }
        self.assert_consistent();
        step
    }

    pub fn assert_consistent(&self) {
        if let Err(violations) = self.governor.check_consistency() {
            panic!("inconsistent coordinator state:\n{}", violations.join("\n"));
        }
    }

    // ---- workers ----

    pub fn add_worker(&mut self, cpus: u32) -> WorkerId {
        self.add_worker_with(Resources::cpus(cpus))
    }

    pub fn add_worker_with(&mut self, capacity: Resources) -> WorkerId {
        let worker = WorkerId(self.next_worker);
        self.next_worker += 1;
        let info = WorkerInfo {
            address: format!("10.0.0.{}:7000", worker.0),
            data_address: format!("10.0.0.{}:7001", worker.0),
            capacity,
        };
        let at = self.now;
        self.step(GovernorEvent::WorkerRegistered { worker, info, at });
        worker
    }

    pub fn worker_message(&mut self, worker: WorkerId, message: FromWorker) -> CoreStep {
        let at = self.now;
        self.step(GovernorEvent::WorkerMessage {
            worker,
            message,
            at,
        })
    }

    pub fn heartbeat(&mut self, worker: WorkerId, load: LoadSnapshot) -> CoreStep {
        self.worker_message(worker, FromWorker::Heartbeat { worker, load })
    }

    pub fn lose_worker(&mut self, worker: WorkerId) -> CoreStep {
        self.step(GovernorEvent::WorkerConnectionLost { worker })
    }

    /// Move the clock forward and deliver a tick.
    pub fn advance(&mut self, by: Duration) -> CoreStep {
        self.now += by;
        let now = self.now;
        self.step(GovernorEvent::Tick { now })
    }

    pub fn ack(&mut self, worker: WorkerId, task: TaskId, attempt: u32) -> CoreStep {
        self.worker_message(
            worker,
            FromWorker::DispatchAck {
                task,
                attempt,
                result: DispatchResult::Accepted,
            },
        )
    }

    pub fn finish(&mut self, worker: WorkerId, request: &DispatchRequest) -> CoreStep {
        let outputs = request
            .outputs
            .iter()
            .map(|&object| ObjectMetadata {
                object,
                size: OUTPUT_SIZE,
                spilled: false,
            })
            .collect();
        self.worker_message(
            worker,
            FromWorker::TaskReport {
                task: request.task,
                attempt: request.attempt,
                outcome: TaskOutcome::Finished,
                outputs,
            },
        )
    }

    pub fn fail(&mut self, worker: WorkerId, request: &DispatchRequest, reason: FailureReason) -> CoreStep {
        self.worker_message(
            worker,
            FromWorker::TaskReport {
                task: request.task,
                attempt: request.attempt,
                outcome: TaskOutcome::Failed(reason),
                outputs: Vec::new(),
            },
        )
    }

    /// Remove and return the outstanding dispatch of `task`.
    pub fn take_dispatch(&mut self, task: TaskId) -> Option<(WorkerId, DispatchRequest)> {
        let index = self.dispatches.iter().position(|(_, r)| r.task == task)?;
        self.dispatches.remove(index)
    }

    /// Acknowledge and finish dispatches in order until nothing is left.
    ///
    /// Returns the `(task, worker)` pairs that ran.
    pub fn run_to_completion(&mut self) -> Vec<(TaskId, WorkerId)> {
        let mut ran = Vec::new();
        while let Some((worker, request)) = self.dispatches.pop_front() {
            if !self.governor.registry().contains(worker) {
                continue;
            }
            self.ack(worker, request.task, request.attempt);
            self.finish(worker, &request);
            ran.push((request.task, worker));
        }
        ran
    }

    pub fn state(&self, task: TaskId) -> Option<TaskState> {
        self.governor.task_state(task)
    }

    pub fn worker_messages(&self, worker: WorkerId) -> &[ToWorker] {
        self.worker_inbox.get(&worker).map_or(&[], Vec::as_slice)
    }

    // ---- clients ----

    pub fn connect_client(&mut self) -> ClientId {
        let client = ClientId(self.next_client);
        self.next_client += 1;
        self.step(GovernorEvent::ClientConnected { client });
        client
    }

    pub fn request(&mut self, client: ClientId, request: FromClient) -> CoreStep {
        self.step(GovernorEvent::ClientRequest { client, request })
    }

    /// Next queued message for `client` that is not an event.
    pub fn reply(&mut self, client: ClientId) -> Option<ToClient> {
        let inbox = self.client_inbox.get_mut(&client)?;
        let index = inbox
            .iter()
            .position(|message| !matches!(message, ToClient::Event(_)))?;
        inbox.remove(index)
    }

    /// Drain the events queued for `client`.
    pub fn events(&mut self, client: ClientId) -> Vec<ClientEvent> {
        let Some(inbox) = self.client_inbox.get_mut(&client) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        inbox.retain(|message| match message {
            ToClient::Event(event) => {
                events.push(event.clone());
                false
            }
            _ => true,
        });
        events
    }

    pub fn open_session(&mut self, client: ClientId) -> SessionId {
        self.request(client, FromClient::OpenSession);
        match self.reply(client) {
            Some(ToClient::SessionOpened { session }) => session,
            other => panic!("expected SessionOpened, got {other:?}"),
        }
    }

    pub fn submit(
        &mut self,
        client: ClientId,
        session: SessionId,
        submission: SubmissionBuilder,
    ) -> Result<SubmissionId, GraphError> {
        let (tasks, objects) = submission.build();
        self.request(
            client,
            FromClient::Submit {
                session,
                tasks,
                objects,
            },
        );
        match self.reply(client) {
            Some(ToClient::Submitted { submission }) => Ok(submission),
            Some(ToClient::SubmitRejected(err)) => Err(err),
            other => panic!("expected a submission reply, got {other:?}"),
        }
    }

    /// Client, session and accepted submission in one go.
    pub fn submit_new(&mut self, submission: SubmissionBuilder) -> (ClientId, SessionId) {
        let client = self.connect_client();
        let session = self.open_session(client);
        self.submit(client, session, submission)
            .expect("submission should be accepted");
        (client, session)
    }
}
