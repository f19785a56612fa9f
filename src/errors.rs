// src/errors.rs

//! Crate-wide error aliases and helpers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ClientId, DispatchRejection, ObjectId, SessionId, TaskId, WorkerId};

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Submission rejected: {0}")]
    Graph(#[from] GraphError),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reasons a submission is rejected. Rejection happens before any state is
/// touched.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphError {
    #[error("cycle detected in task graph involving task {task}")]
    Cycle { task: TaskId },

    #[error("task {task} reads unknown object {object}")]
    DanglingInput { task: TaskId, object: ObjectId },

    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("object {0} already exists")]
    DuplicateObject(ObjectId),

    #[error("object {object} is produced by both {first} and {second}")]
    MultipleProducers {
        object: ObjectId,
        first: TaskId,
        second: TaskId,
    },

    #[error("task {task} declares output {object} which is not part of the submission")]
    UndeclaredOutput { task: TaskId, object: ObjectId },

    #[error("object {0} has both uploaded data and a producer")]
    DataAndProducer(ObjectId),

    #[error("object {0} has neither uploaded data nor a producer")]
    NoSource(ObjectId),

    #[error("task {task} reads object {object} of another session")]
    ForeignObject { task: TaskId, object: ObjectId },

    #[error("task {task} reads object {object} which was already removed")]
    RemovedInput { task: TaskId, object: ObjectId },

    #[error("session {session} is not open for client {client}")]
    UnknownSession { session: SessionId, client: ClientId },
}

/// Misuse of the object reference-count API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("object {object} is not held by task {task}")]
    NotHeld { object: ObjectId, task: TaskId },

    #[error("object {0} was already removed")]
    Removed(ObjectId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {0} is already registered")]
    AlreadyRegistered(WorkerId),
}

/// Reasons a worker refuses a dispatch.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("task {0} is already running")]
    AlreadyRunning(TaskId),

    #[error("not enough free slots for task {0}")]
    ResourceUnavailable(TaskId),
}

impl From<DispatchError> for DispatchRejection {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::AlreadyRunning(_) => DispatchRejection::AlreadyRunning,
            DispatchError::ResourceUnavailable(_) => DispatchRejection::ResourceUnavailable,
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, GovernorError>;
