// src/types.rs

//! Identifiers and small value types shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Client-chosen task identifier, unique across the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// Client-chosen object identifier, unique across the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Coordinator-assigned worker identity.
///
/// A worker process that reconnects is always given a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Identifier returned to a client for an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubmissionId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

/// Resource amounts: worker capacity, committed load or a task requirement.
///
/// `memory_bytes == 0` means "unlimited" for a capacity and "no requirement"
/// for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u32,
    pub memory_bytes: u64,
}

impl Resources {
    pub fn new(cpus: u32, memory_bytes: u64) -> Self {
        Self { cpus, memory_bytes }
    }

    pub fn cpus(cpus: u32) -> Self {
        Self {
            cpus,
            memory_bytes: 0,
        }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus.saturating_add(other.cpus),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus.saturating_sub(other.cpus),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// Whether `request` fits on top of `self` (the committed load) within `capacity`.
    pub fn fits(&self, request: &Resources, capacity: &Resources) -> bool {
        let cpus_ok = self.cpus.saturating_add(request.cpus) <= capacity.cpus;
        let memory_ok = capacity.memory_bytes == 0
            || self.memory_bytes.saturating_add(request.memory_bytes) <= capacity.memory_bytes;
        cpus_ok && memory_ok
    }

    /// Committed fraction of `capacity` in `[0, 1]`, taking the busier dimension.
    pub fn fraction_of(&self, capacity: &Resources) -> f64 {
        let cpu = if capacity.cpus == 0 {
            1.0
        } else {
            f64::from(self.cpus) / f64::from(capacity.cpus)
        };
        let memory = if capacity.memory_bytes == 0 {
            0.0
        } else {
            self.memory_bytes as f64 / capacity.memory_bytes as f64
        };
        cpu.max(memory).min(1.0)
    }
}

/// Opaque executable payload of a task.
///
/// The coordinator never inspects `config`; `task_type` selects the function a
/// worker runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_type: String,
    pub config: Vec<u8>,
}

impl TaskPayload {
    pub fn new(task_type: impl Into<String>, config: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            config: config.into(),
        }
    }
}

/// Why a task did not finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// An upstream task failed; this task never ran.
    DependencyFailed { task: TaskId },
    /// A worker disconnected holding the only copy of a needed object that
    /// cannot be recomputed.
    WorkerLost { worker: WorkerId },
    /// Client- or system-initiated abort.
    Cancelled,
    /// Worker could not obtain an input; transient, the task is re-queued.
    InputUnavailable { object: ObjectId },
    /// Application-level failure, passed through verbatim.
    Application(String),
}

impl FailureReason {
    /// Whether the coordinator should retry instead of failing the task.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureReason::InputUnavailable { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::DependencyFailed { task } => write!(f, "dependency {task} failed"),
            FailureReason::WorkerLost { worker } => write!(f, "worker {worker} lost"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::InputUnavailable { object } => {
                write!(f, "input {object} unavailable")
            }
            FailureReason::Application(msg) => write!(f, "{msg}"),
        }
    }
}

/// Why a worker refused a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchRejection {
    ResourceUnavailable,
    AlreadyRunning,
}

/// Load figures a worker reports with every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub running_tasks: u32,
    pub memory_used_bytes: u64,
    pub stored_objects: u32,
}
