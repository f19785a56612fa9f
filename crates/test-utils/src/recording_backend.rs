use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use taskgov::engine::GovernorEvent;
use taskgov::protocol::{
    DispatchResult, FromWorker, ObjectMetadata, TaskOutcome, ToClient, ToWorker,
};
use taskgov::server::{BackendFuture, MessageBackend};
use taskgov::types::{ClientId, WorkerId};

/// Everything a [`RecordingBackend`] was asked to deliver.
#[derive(Debug, Default)]
pub struct Recorded {
    pub to_workers: Vec<(WorkerId, ToWorker)>,
    pub to_clients: Vec<(ClientId, ToClient)>,
    pub disconnected: Vec<WorkerId>,
}

/// A fake backend that:
/// - records every message
/// - acts as a perfectly obedient worker: each dispatch is acknowledged and
///   finished right away, reporting one byte per output.
pub struct RecordingBackend {
    runtime_tx: mpsc::Sender<GovernorEvent>,
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingBackend {
    pub fn new(runtime_tx: mpsc::Sender<GovernorEvent>, recorded: Arc<Mutex<Recorded>>) -> Self {
        Self {
            runtime_tx,
            recorded,
        }
    }
}

impl MessageBackend for RecordingBackend {
    fn send_to_worker(&mut self, worker: WorkerId, message: ToWorker) -> BackendFuture<'_> {
        let tx = self.runtime_tx.clone();
        let recorded = Arc::clone(&self.recorded);

        Box::pin(async move {
            recorded
                .lock()
                .unwrap()
                .to_workers
                .push((worker, message.clone()));

            if let ToWorker::Dispatch(request) = message {
                let at = Instant::now();
                let ack = FromWorker::DispatchAck {
                    task: request.task,
                    attempt: request.attempt,
                    result: DispatchResult::Accepted,
                };
                let outputs = request
                    .outputs
                    .iter()
                    .map(|&object| ObjectMetadata {
                        object,
                        size: 1,
                        spilled: false,
                    })
                    .collect();
                let report = FromWorker::TaskReport {
                    task: request.task,
                    attempt: request.attempt,
                    outcome: TaskOutcome::Finished,
                    outputs,
                };
                for message in [ack, report] {
                    tx.send(GovernorEvent::WorkerMessage {
                        worker,
                        message,
                        at,
                    })
                    .await
                    .map_err(anyhow::Error::from)?;
                }
            }
            Ok(())
        })
    }

    fn send_to_client(&mut self, client: ClientId, message: ToClient) -> BackendFuture<'_> {
        let recorded = Arc::clone(&self.recorded);
        Box::pin(async move {
            recorded.lock().unwrap().to_clients.push((client, message));
            Ok(())
        })
    }

    fn disconnect_worker(&mut self, worker: WorkerId) -> BackendFuture<'_> {
        let recorded = Arc::clone(&self.recorded);
        Box::pin(async move {
            recorded.lock().unwrap().disconnected.push(worker);
            Ok(())
        })
    }
}
