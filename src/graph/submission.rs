// src/graph/submission.rs

//! Client-side description of tasks and objects in a submission.

use serde::{Deserialize, Serialize};

use crate::types::{ObjectId, Resources, TaskId, TaskPayload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Ordered input objects; the worker passes them to the task function in
    /// this order.
    pub inputs: Vec<ObjectId>,
    /// Objects this task produces, fixed in count at submission time.
    pub outputs: Vec<ObjectId>,
    pub payload: TaskPayload,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub id: ObjectId,
    #[serde(default)]
    pub label: Option<String>,
    /// Pin the object so it survives its consumers.
    #[serde(default)]
    pub keep: bool,
    /// Client-uploaded content. Mutually exclusive with a producer task.
    #[serde(default)]
    pub data: Option<Vec<u8>>,
}

impl ObjectSpec {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            label: None,
            keep: false,
            data: None,
        }
    }
}
