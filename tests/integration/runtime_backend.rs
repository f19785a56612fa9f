// tests/integration/runtime_backend.rs

use crate::common::{
    Recorded, RecordingBackend, SubmissionBuilder, TestResult, init_tracing, t, with_timeout,
};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use taskgov::engine::{Governor, GovernorEvent, GovernorOptions, Runtime};
use taskgov::protocol::{ClientEvent, FromClient, ToClient, ToWorker};
use taskgov::registry::WorkerInfo;
use taskgov::server::{BackendFuture, MessageBackend};
use taskgov::types::{ClientId, Resources, SessionId, WorkerId};

fn worker_info(n: u64) -> WorkerInfo {
    WorkerInfo {
        address: format!("127.0.0.1:{}", 7000 + n),
        data_address: format!("127.0.0.1:{}", 8000 + n),
        capacity: Resources::cpus(1),
    }
}

fn options() -> GovernorOptions {
    GovernorOptions {
        debug_consistency_checks: true,
        ..GovernorOptions::default()
    }
}

/// Poll `recorded` until `done` holds.
async fn wait_until(recorded: &Arc<Mutex<Recorded>>, done: impl Fn(&Recorded) -> bool) {
    with_timeout(async {
        loop {
            if done(&recorded.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

fn client_got(recorded: &Recorded, event: &ClientEvent) -> bool {
    recorded
        .to_clients
        .iter()
        .any(|(_, message)| *message == ToClient::Event(event.clone()))
}

#[tokio::test]
async fn chain_runs_to_completion_through_the_backend() -> TestResult {
    init_tracing();
    let (tx, rx) = mpsc::channel(64);
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let backend = RecordingBackend::new(tx.clone(), Arc::clone(&recorded));
    let runtime = Runtime::new(Governor::new(options()), rx, tx.clone(), backend);
    let handle = tokio::spawn(runtime.run());

    let client = ClientId(1);
    tx.send(GovernorEvent::WorkerRegistered {
        worker: WorkerId(1),
        info: worker_info(1),
        at: Instant::now(),
    })
    .await?;
    tx.send(GovernorEvent::ClientConnected { client }).await?;
    tx.send(GovernorEvent::ClientRequest {
        client,
        request: FromClient::OpenSession,
    })
    .await?;
    let (tasks, objects) = SubmissionBuilder::new()
        .objects(&[1, 2, 3])
        .task(1, &[], &[1])
        .task(2, &[1], &[2])
        .task(3, &[2], &[3])
        .build();
    tx.send(GovernorEvent::ClientRequest {
        client,
        request: FromClient::Submit {
            session: SessionId(1),
            tasks,
            objects,
        },
    })
    .await?;

    let last = ClientEvent::TaskFinished { task: t(3) };
    wait_until(&recorded, |r| client_got(r, &last)).await;

    tx.send(GovernorEvent::ShutdownRequested).await?;
    with_timeout(handle).await??;

    let recorded = recorded.lock().unwrap();
    let dispatched: Vec<_> = recorded
        .to_workers
        .iter()
        .filter_map(|(_, message)| match message {
            ToWorker::Dispatch(request) => Some(request.task),
            _ => None,
        })
        .collect();
    assert_eq!(dispatched, vec![t(1), t(2), t(3)]);
    assert!(matches!(
        recorded.to_workers.last(),
        Some((WorkerId(1), ToWorker::Shutdown))
    ));
    let replies: Vec<_> = recorded
        .to_clients
        .iter()
        .filter(|(_, message)| !matches!(message, ToClient::Event(_)))
        .map(|(_, message)| message.clone())
        .collect();
    assert_eq!(replies.len(), 2);
    assert_eq!(
        replies[0],
        ToClient::SessionOpened {
            session: SessionId(1)
        }
    );
    assert!(matches!(replies[1], ToClient::Submitted { .. }));
    assert!(recorded.disconnected.is_empty());
    Ok(())
}

/// Records dispatches without ever acknowledging them.
struct SilentBackend {
    recorded: Arc<Mutex<Recorded>>,
}

impl MessageBackend for SilentBackend {
    fn send_to_worker(&mut self, worker: WorkerId, message: ToWorker) -> BackendFuture<'_> {
        let recorded = Arc::clone(&self.recorded);
        Box::pin(async move {
            recorded.lock().unwrap().to_workers.push((worker, message));
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

#[tokio::test]
async fn dispatch_timer_moves_an_unacknowledged_task() -> TestResult {
    init_tracing();
    let (tx, rx) = mpsc::channel(64);
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let backend = SilentBackend {
        recorded: Arc::clone(&recorded),
    };
    let options = GovernorOptions {
        dispatch_timeout: Duration::from_millis(50),
        ..options()
    };
    let runtime = Runtime::new(Governor::new(options), rx, tx.clone(), backend);
    let handle = tokio::spawn(runtime.run());

    for n in 1..=2 {
        tx.send(GovernorEvent::WorkerRegistered {
            worker: WorkerId(n),
            info: worker_info(n),
            at: Instant::now(),
        })
        .await?;
    }
    let client = ClientId(1);
    tx.send(GovernorEvent::ClientConnected { client }).await?;
    tx.send(GovernorEvent::ClientRequest {
        client,
        request: FromClient::OpenSession,
    })
    .await?;
    let (tasks, objects) = SubmissionBuilder::new().object(1).task(1, &[], &[1]).build();
    tx.send(GovernorEvent::ClientRequest {
        client,
        request: FromClient::Submit {
            session: SessionId(1),
            tasks,
            objects,
        },
    })
    .await?;

    wait_until(&recorded, |r| {
        r.to_workers.iter().any(|(worker, message)| {
            *worker == WorkerId(2) && matches!(message, ToWorker::Dispatch(req) if req.attempt == 2)
        })
    })
    .await;

    tx.send(GovernorEvent::ShutdownRequested).await?;
    with_timeout(handle).await??;

    let recorded = recorded.lock().unwrap();
    let to_first: Vec<_> = recorded
        .to_workers
        .iter()
        .filter(|(worker, _)| *worker == WorkerId(1))
        .map(|(_, message)| message)
        .collect();
    assert!(matches!(to_first[0], ToWorker::Dispatch(req) if req.attempt == 1));
    assert_eq!(to_first[1], &ToWorker::Cancel { task: t(1) });
    Ok(())
}
