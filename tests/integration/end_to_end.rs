// tests/integration/end_to_end.rs

use crate::common::{
    ConfigFileBuilder, SubmissionBuilder, TaskSpecBuilder, TestResult, init_tracing, o, t,
    with_timeout,
};

use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use taskgov::client::Client;
use taskgov::engine::GovernorEvent;
use taskgov::server::Server;
use taskgov::types::FailureReason;
use taskgov::worker::{WorkerOptions, run_worker};

/// A coordinator plus workers on localhost.
struct Cluster {
    addr: SocketAddr,
    events: mpsc::Sender<GovernorEvent>,
    server: JoinHandle<anyhow::Result<()>>,
    workers: Vec<JoinHandle<anyhow::Result<()>>>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    async fn start(workers: usize, cpus: u32) -> Result<Self, Box<dyn Error>> {
        let cfg = ConfigFileBuilder::local_cluster().worker_cpus(cpus).build();
        let server = Server::bind(&cfg).await?;
        let addr = server.local_addr()?;
        let events = server.events();
        let server = tokio::spawn(server.run());

        let mut handles = Vec::new();
        let mut dirs = Vec::new();
        for _ in 0..workers {
            let dir = tempfile::tempdir()?;
            let mut options = WorkerOptions::from_config(&cfg);
            options.server = addr.to_string();
            options.work_dir = Some(dir.path().to_path_buf());
            handles.push(tokio::spawn(run_worker(options)));
            dirs.push(dir);
        }

        let cluster = Self {
            addr,
            events,
            server,
            workers: handles,
            _dirs: dirs,
        };
        cluster.wait_for_workers(workers).await?;
        Ok(cluster)
    }

    async fn wait_for_workers(&self, expected: usize) -> TestResult {
        let mut client = Client::connect(self.addr).await?;
        with_timeout(async {
            loop {
                let info = client.server_info().await?;
                if info.workers.len() == expected {
                    return Ok::<_, Box<dyn Error>>(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }

    async fn shutdown(self) -> TestResult {
        self.events.send(GovernorEvent::ShutdownRequested).await?;
        with_timeout(self.server).await??;
        for worker in self.workers {
            with_timeout(worker).await??;
        }
        Ok(())
    }
}

#[tokio::test]
async fn uploaded_and_computed_objects_flow_into_a_kept_result() -> TestResult {
    init_tracing();
    let cluster = Cluster::start(1, 2).await?;
    let mut client = Client::connect(cluster.addr).await?;
    let session = client.open_session().await?;

    let (tasks, objects) = SubmissionBuilder::new()
        .upload(10, b"hello, ".to_vec())
        .object(1)
        .kept(2)
        .task_with(TaskSpecBuilder::new(1).output(1).payload("literal", "world"))
        .task(2, &[10, 1], &[2])
        .build();
    client.submit(session, tasks, objects).await?;

    let outcomes = with_timeout(client.wait_for(&[t(1), t(2)])).await?;
    assert_eq!(outcomes.get(&t(1)), Some(&Ok(())));
    assert_eq!(outcomes.get(&t(2)), Some(&Ok(())));

    let result = client.fetch(session, o(2)).await?;
    assert_eq!(result.as_deref(), Some(&b"hello, world"[..]));

    client.close_session(session).await?;
    assert_eq!(client.fetch(session, o(2)).await?, None);
    cluster.shutdown().await
}

#[tokio::test]
async fn outputs_move_between_workers() -> TestResult {
    init_tracing();
    let cluster = Cluster::start(2, 1).await?;
    let mut client = Client::connect(cluster.addr).await?;
    let session = client.open_session().await?;

    let (tasks, objects) = SubmissionBuilder::new()
        .objects(&[1, 2])
        .kept(3)
        .task_with(TaskSpecBuilder::new(1).output(1).payload("literal", "left|"))
        .task_with(TaskSpecBuilder::new(2).output(2).payload("literal", "right"))
        .task(3, &[1, 2], &[3])
        .build();
    client.submit(session, tasks, objects).await?;

    let outcomes = with_timeout(client.wait_for(&[t(3)])).await?;
    assert_eq!(outcomes.get(&t(3)), Some(&Ok(())));
    assert_eq!(
        client.fetch(session, o(3)).await?.as_deref(),
        Some(&b"left|right"[..])
    );

    let info = client.server_info().await?;
    assert_eq!(info.workers.len(), 2);
    cluster.shutdown().await
}

#[tokio::test]
async fn failures_and_cancellations_reach_the_client() -> TestResult {
    init_tracing();
    let cluster = Cluster::start(1, 4).await?;
    let mut client = Client::connect(cluster.addr).await?;
    let session = client.open_session().await?;

    let (tasks, objects) = SubmissionBuilder::new()
        .objects(&[1, 2, 3])
        .task_with(TaskSpecBuilder::new(1).output(1).payload("fail", "nope"))
        .task(2, &[1], &[2])
        .task_with(TaskSpecBuilder::new(3).output(3).payload("sleep", "60000"))
        .build();
    client.submit(session, tasks, objects).await?;

    let outcomes = with_timeout(client.wait_for(&[t(1), t(2)])).await?;
    assert_eq!(
        outcomes.get(&t(1)),
        Some(&Err(FailureReason::Application("nope".into())))
    );
    assert_eq!(
        outcomes.get(&t(2)),
        Some(&Err(FailureReason::DependencyFailed { task: t(1) }))
    );

    client.cancel(session, vec![t(3)]).await?;
    let outcomes = with_timeout(client.wait_for(&[t(3)])).await?;
    assert_eq!(outcomes.get(&t(3)), Some(&Err(FailureReason::Cancelled)));

    cluster.shutdown().await
}

#[tokio::test]
async fn rejected_submission_comes_back_as_an_error() -> TestResult {
    init_tracing();
    let cluster = Cluster::start(1, 1).await?;
    let mut client = Client::connect(cluster.addr).await?;
    let session = client.open_session().await?;

    let (tasks, objects) = SubmissionBuilder::new().object(1).task(1, &[42], &[1]).build();
    let err = client
        .submit(session, tasks, objects)
        .await
        .err()
        .ok_or("dangling input accepted")?;
    assert!(err.to_string().contains("o42"), "error: {err}");

    // The connection is still usable.
    let (tasks, objects) = SubmissionBuilder::new()
        .kept(1)
        .task_with(TaskSpecBuilder::new(1).output(1).payload("literal", "ok"))
        .build();
    client.submit(session, tasks, objects).await?;
    let outcomes = with_timeout(client.wait_for(&[t(1)])).await?;
    assert_eq!(outcomes.get(&t(1)), Some(&Ok(())));
    assert_eq!(client.fetch(session, o(1)).await?.as_deref(), Some(&b"ok"[..]));

    cluster.shutdown().await
}
