#![allow(dead_code)]

use taskgov::config::{ConfigFile, RawConfigFile};
use taskgov::graph::{ObjectSpec, TaskSpec};
use taskgov::types::{ObjectId, Resources, TaskId, TaskPayload};

pub fn t(id: u64) -> TaskId {
    TaskId(id)
}

pub fn o(id: u64) -> ObjectId {
    ObjectId(id)
}

/// Builder for `TaskSpec`. Defaults: `concat` payload, one CPU.
#[derive(Debug, Clone)]
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new(id: u64) -> Self {
        Self {
            spec: TaskSpec {
                id: TaskId(id),
                inputs: Vec::new(),
                outputs: Vec::new(),
                payload: TaskPayload::new("concat", Vec::new()),
                resources: Resources::cpus(1),
            },
        }
    }

    pub fn input(mut self, object: u64) -> Self {
        self.spec.inputs.push(ObjectId(object));
        self
    }

    pub fn inputs(mut self, objects: &[u64]) -> Self {
        self.spec.inputs.extend(objects.iter().copied().map(ObjectId));
        self
    }

    pub fn output(mut self, object: u64) -> Self {
        self.spec.outputs.push(ObjectId(object));
        self
    }

    pub fn outputs(mut self, objects: &[u64]) -> Self {
        self.spec.outputs.extend(objects.iter().copied().map(ObjectId));
        self
    }

    pub fn payload(mut self, task_type: &str, config: impl Into<Vec<u8>>) -> Self {
        self.spec.payload = TaskPayload::new(task_type, config);
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.spec.resources.cpus = cpus;
        self
    }

    pub fn memory(mut self, bytes: u64) -> Self {
        self.spec.resources.memory_bytes = bytes;
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

/// Builder for one submission: tasks plus the objects they declare.
#[derive(Debug, Clone, Default)]
pub struct SubmissionBuilder {
    tasks: Vec<TaskSpec>,
    objects: Vec<ObjectSpec>,
}

impl SubmissionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// An object produced by a task of this submission.
    pub fn object(mut self, id: u64) -> Self {
        self.objects.push(ObjectSpec::new(ObjectId(id)));
        self
    }

    pub fn objects(mut self, ids: &[u64]) -> Self {
        for &id in ids {
            self = self.object(id);
        }
        self
    }

    /// A produced object the client keeps.
    pub fn kept(mut self, id: u64) -> Self {
        let mut spec = ObjectSpec::new(ObjectId(id));
        spec.keep = true;
        self.objects.push(spec);
        self
    }

    /// A client-uploaded object.
    pub fn upload(mut self, id: u64, data: impl Into<Vec<u8>>) -> Self {
        let mut spec = ObjectSpec::new(ObjectId(id));
        spec.data = Some(data.into());
        self.objects.push(spec);
        self
    }

    pub fn label(mut self, id: u64, label: &str) -> Self {
        if let Some(spec) = self.objects.iter_mut().find(|s| s.id == ObjectId(id)) {
            spec.label = Some(label.to_string());
        }
        self
    }

    /// Task reading `inputs` and producing `outputs`, with default payload.
    pub fn task(self, id: u64, inputs: &[u64], outputs: &[u64]) -> Self {
        self.task_with(TaskSpecBuilder::new(id).inputs(inputs).outputs(outputs))
    }

    pub fn task_with(mut self, task: TaskSpecBuilder) -> Self {
        self.tasks.push(task.build());
        self
    }

    pub fn build(self) -> (Vec<TaskSpec>, Vec<ObjectSpec>) {
        (self.tasks, self.objects)
    }
}

/// Builder for `ConfigFile` to simplify test setup.
#[derive(Debug, Clone, Default)]
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator on an ephemeral localhost port with fast heartbeats.
    pub fn local_cluster() -> Self {
        let mut builder = Self::new();
        builder.config.coordinator.listen = "127.0.0.1:0".to_string();
        builder.config.coordinator.heartbeat_interval_ms = 100;
        builder.config.coordinator.dispatch_timeout_ms = 2000;
        builder.config.coordinator.debug_consistency_checks = true;
        builder.config.worker.listen = "127.0.0.1:0".to_string();
        builder
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.coordinator.heartbeat_interval_ms = ms;
        self
    }

    pub fn worker_cpus(mut self, cpus: u32) -> Self {
        self.config.worker.cpus = Some(cpus);
        self
    }

    pub fn spill_threshold(mut self, bytes: u64) -> Self {
        self.config.worker.object_spill_threshold_bytes = bytes;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}
