// src/protocol/messages.rs

//! Messages exchanged between the coordinator, workers and clients.

use serde::{Deserialize, Serialize};

use crate::errors::GraphError;
use crate::graph::{ObjectSpec, TaskSpec};
use crate::registry::Liveness;
use crate::types::{
    ClientId, DispatchRejection, FailureReason, LoadSnapshot, ObjectId, Resources, SessionId,
    SubmissionId, TaskId, TaskPayload, WorkerId,
};

/// Bumped on every incompatible change of the messages in this module.
pub const PROTOCOL_VERSION: u32 = 1;

/// First message on every connection to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Hello {
    Worker {
        version: u32,
        /// Address of the worker's data server. An unspecified IP is replaced
        /// by the peer IP of the connection.
        data_address: String,
        capacity: Resources,
    },
    Client {
        version: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HelloReply {
    WorkerAccepted {
        worker: WorkerId,
        heartbeat_interval_ms: u64,
    },
    ClientAccepted {
        client: ClientId,
    },
    Rejected(String),
}

/// Where a worker finds the content of an input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// Already in the worker's local store.
    Local,
    /// Carried inside the message.
    Inline(Vec<u8>),
    /// Pull from another worker's data server.
    Worker { worker: WorkerId, address: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLocation {
    pub object: ObjectId,
    pub source: DataSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task: TaskId,
    pub attempt: u32,
    pub payload: TaskPayload,
    /// One entry per declared input, in declaration order.
    pub inputs: Vec<InputLocation>,
    pub outputs: Vec<ObjectId>,
    pub resources: Resources,
}

/// Coordinator -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToWorker {
    Dispatch(DispatchRequest),
    /// Best-effort abort; the worker answers with `Failed(Cancelled)`.
    Cancel { task: TaskId },
    /// Copy `object` from `source` into the local store.
    ObjectTransferRequest { object: ObjectId, source: DataSource },
    RemoveObjects { objects: Vec<ObjectId> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchResult {
    Accepted,
    Rejected(DispatchRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub object: ObjectId,
    pub size: u64,
    pub spilled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Finished,
    Failed(FailureReason),
}

/// Worker -> coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromWorker {
    DispatchAck {
        task: TaskId,
        attempt: u32,
        result: DispatchResult,
    },
    TaskReport {
        task: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
        outputs: Vec<ObjectMetadata>,
    },
    ObjectTransferComplete {
        object: ObjectId,
        size: u64,
    },
    ObjectTransferFailed {
        object: ObjectId,
        reason: String,
    },
    Heartbeat {
        worker: WorkerId,
        load: LoadSnapshot,
    },
    ObjectsSpilled {
        objects: Vec<ObjectId>,
    },
}

/// Client -> coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FromClient {
    OpenSession,
    Submit {
        session: SessionId,
        tasks: Vec<TaskSpec>,
        objects: Vec<ObjectSpec>,
    },
    Unkeep {
        session: SessionId,
        objects: Vec<ObjectId>,
    },
    Cancel {
        session: SessionId,
        tasks: Vec<TaskId>,
    },
    Fetch {
        session: SessionId,
        object: ObjectId,
    },
    CloseSession {
        session: SessionId,
    },
    ServerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    TaskFinished { task: TaskId },
    TaskFailed { task: TaskId, reason: FailureReason },
    /// A kept object lost its last copy and cannot be recomputed.
    ObjectLost { object: ObjectId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchResult {
    Inline(Vec<u8>),
    Worker { worker: WorkerId, address: String },
    NotAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub address: String,
    pub data_address: String,
    pub liveness: Liveness,
    pub capacity: Resources,
    pub committed: Resources,
    pub running: Vec<TaskId>,
    pub objects: Vec<ObjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub workers: Vec<WorkerSummary>,
}

/// Coordinator -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToClient {
    SessionOpened { session: SessionId },
    Submitted { submission: SubmissionId },
    SubmitRejected(GraphError),
    Event(ClientEvent),
    FetchReply { object: ObjectId, result: FetchResult },
    SessionClosed { session: SessionId },
    ServerInfo(ServerInfo),
    Error(String),
}

/// Request to a worker's data server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRequest {
    Fetch { object: ObjectId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataReply {
    Data(Vec<u8>),
    NotFound,
}
