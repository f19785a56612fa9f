// src/worker/executor.rs

//! Runs dispatched tasks on the worker.
//!
//! CPU slots are a semaphore; a dispatch that cannot get its slots right
//! away is rejected so the coordinator can place it elsewhere. Each running
//! task can be aborted through a oneshot channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::DispatchError;
use crate::protocol::{DispatchRequest, FromWorker, ObjectMetadata, TaskOutcome};
use crate::types::{FailureReason, ObjectId, TaskId};
use crate::worker::functions::{FunctionRegistry, TaskInput};
use crate::worker::store::LocalStore;

#[derive(Debug)]
struct ActiveTask {
    attempt: u32,
    cancel: Option<oneshot::Sender<()>>,
}

type ActiveTable = Arc<Mutex<HashMap<TaskId, ActiveTask>>>;

#[derive(Debug, Clone)]
pub struct Executor {
    slots: Arc<Semaphore>,
    active: ActiveTable,
    functions: Arc<FunctionRegistry>,
    store: Arc<LocalStore>,
    reports: mpsc::UnboundedSender<FromWorker>,
}

impl Executor {
    pub fn new(
        cpus: u32,
        functions: FunctionRegistry,
        store: Arc<LocalStore>,
        reports: mpsc::UnboundedSender<FromWorker>,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(cpus as usize)),
            active: Arc::new(Mutex::new(HashMap::new())),
            functions: Arc::new(functions),
            store,
            reports,
        }
    }

    /// Accept and start `request`, or say why not.
    pub fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        let task = request.task;
        let mut active = self
            .active
            .lock()
            .map_err(|_| DispatchError::ResourceUnavailable(task))?;
        match active.get(&task) {
            Some(running) if running.attempt == request.attempt => {
                return Err(DispatchError::AlreadyRunning(task));
            }
            // An older attempt is still winding down; its slots are taken.
            Some(_) => return Err(DispatchError::ResourceUnavailable(task)),
            None => {}
        }
        let permit = Arc::clone(&self.slots)
            .try_acquire_many_owned(request.resources.cpus)
            .map_err(|_| DispatchError::ResourceUnavailable(task))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        active.insert(
            task,
            ActiveTask {
                attempt: request.attempt,
                cancel: Some(cancel_tx),
            },
        );
        drop(active);

        let this = self.clone();
        tokio::spawn(async move {
            let attempt = request.attempt;
            let (outcome, outputs) = tokio::select! {
                result = this.execute(&request) => result,
                _ = cancel_rx => {
                    info!(task = %task, "task cancelled");
                    (TaskOutcome::Failed(FailureReason::Cancelled), Vec::new())
                }
            };
            drop(permit);

            if let Ok(mut active) = this.active.lock() {
                if active.get(&task).is_some_and(|a| a.attempt == attempt) {
                    active.remove(&task);
                }
            }
            let report = FromWorker::TaskReport {
                task,
                attempt,
                outcome,
                outputs,
            };
            if this.reports.send(report).is_err() {
                debug!(task = %task, "coordinator connection gone; report dropped");
            }
        });
        Ok(())
    }

    /// Abort `task` if it is running here.
    pub fn cancel(&self, task: TaskId) -> bool {
        let Ok(mut active) = self.active.lock() else {
            return false;
        };
        match active.get_mut(&task).and_then(|a| a.cancel.take()) {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    pub fn running(&self) -> u32 {
        self.active
            .lock()
            .map_or(0, |active| u32::try_from(active.len()).unwrap_or(u32::MAX))
    }

    async fn execute(&self, request: &DispatchRequest) -> (TaskOutcome, Vec<ObjectMetadata>) {
        let task = request.task;

        let mut inputs = Vec::with_capacity(request.inputs.len());
        for location in &request.inputs {
            match self.store.fetch(location.object, &location.source).await {
                Ok((bytes, stored)) => {
                    self.announce_spilled(stored.spilled);
                    inputs.push(bytes);
                }
                Err(err) => {
                    warn!(task = %task, object = %location.object, error = %err, "input unavailable");
                    let reason = FailureReason::InputUnavailable {
                        object: location.object,
                    };
                    return (TaskOutcome::Failed(reason), Vec::new());
                }
            }
        }

        let task_type = &request.payload.task_type;
        let Some(function) = self.functions.get(task_type) else {
            let reason = FailureReason::Application(format!("unknown task type {task_type:?}"));
            return (TaskOutcome::Failed(reason), Vec::new());
        };

        debug!(task = %task, %task_type, inputs = inputs.len(), "running task");
        let input = TaskInput {
            config: request.payload.config.clone(),
            inputs,
            outputs: request.outputs.len(),
        };
        let produced = match function(input).await {
            Ok(produced) => produced,
            Err(message) => {
                return (
                    TaskOutcome::Failed(FailureReason::Application(message)),
                    Vec::new(),
                );
            }
        };
        if produced.len() != request.outputs.len() {
            let reason = FailureReason::Application(format!(
                "task produced {} outputs, expected {}",
                produced.len(),
                request.outputs.len()
            ));
            return (TaskOutcome::Failed(reason), Vec::new());
        }

        match self.store_outputs(&request.outputs, produced).await {
            Ok(outputs) => (TaskOutcome::Finished, outputs),
            Err(reason) => (TaskOutcome::Failed(reason), Vec::new()),
        }
    }

    async fn store_outputs(
        &self,
        ids: &[ObjectId],
        produced: Vec<Bytes>,
    ) -> Result<Vec<ObjectMetadata>, FailureReason> {
        let mut outputs = Vec::with_capacity(ids.len());
        let mut spilled_elsewhere = Vec::new();
        for (&object, data) in ids.iter().zip(produced) {
            let stored = self
                .store
                .put(object, data)
                .await
                .map_err(|err| FailureReason::Application(format!("storing {object}: {err}")))?;
            let spilled = stored.spilled.contains(&object);
            spilled_elsewhere.extend(stored.spilled.into_iter().filter(|id| *id != object));
            outputs.push(ObjectMetadata {
                object,
                size: stored.size,
                spilled,
            });
        }
        // Outputs spilled while storing a later output of the same task.
        let (own, others): (Vec<ObjectId>, Vec<ObjectId>) =
            spilled_elsewhere.into_iter().partition(|id| ids.contains(id));
        for meta in outputs.iter_mut() {
            if own.contains(&meta.object) {
                meta.spilled = true;
            }
        }
        self.announce_spilled(others);
        Ok(outputs)
    }

    fn announce_spilled(&self, objects: Vec<ObjectId>) {
        if objects.is_empty() {
            return;
        }
        let _ = self.reports.send(FromWorker::ObjectsSpilled { objects });
    }
}
