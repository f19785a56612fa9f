// src/worker/runtime.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::codec;
use crate::protocol::{
    DispatchResult, FromWorker, Hello, HelloReply, PROTOCOL_VERSION, ToWorker,
};
use crate::types::{DispatchRejection, LoadSnapshot, WorkerId};
use crate::worker::WorkerOptions;
use crate::worker::data_server;
use crate::worker::executor::Executor;
use crate::worker::store::LocalStore;

/// Connect to the coordinator and serve it until `Shutdown` or until the
/// connection is lost.
pub async fn run_worker(options: WorkerOptions) -> anyhow::Result<()> {
    // Keep the temporary directory alive for the lifetime of the worker.
    let (_tempdir, work_dir) = match &options.work_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating work dir {}", dir.display()))?;
            (None, dir.clone())
        }
        None => {
            let dir = tempfile::tempdir().context("creating temporary work dir")?;
            let path: PathBuf = dir.path().to_path_buf();
            (Some(dir), path)
        }
    };
    let store = Arc::new(LocalStore::new(&work_dir, options.spill_threshold));

    let data_listener = TcpListener::bind(&options.listen)
        .await
        .with_context(|| format!("binding data server to {}", options.listen))?;
    let data_address = data_listener.local_addr()?.to_string();
    let data_server = tokio::spawn(data_server::serve(data_listener, Arc::clone(&store)));

    let stream = TcpStream::connect(&options.server)
        .await
        .with_context(|| format!("connecting to coordinator at {}", options.server))?;
    stream.set_nodelay(true)?;
    let mut framed = codec::framed(stream);
    let hello = Hello::Worker {
        version: PROTOCOL_VERSION,
        data_address: data_address.clone(),
        capacity: options.capacity,
    };
    codec::send(&mut framed, &hello).await?;
    let (worker, heartbeat_interval) = match codec::expect(&mut framed).await? {
        HelloReply::WorkerAccepted {
            worker,
            heartbeat_interval_ms,
        } => (worker, Duration::from_millis(heartbeat_interval_ms.max(1))),
        HelloReply::Rejected(reason) => bail!("coordinator rejected worker: {reason}"),
        other => bail!("unexpected handshake reply {other:?}"),
    };
    info!(worker = %worker, data = %data_address, cpus = options.capacity.cpus, "registered with coordinator");

    let (mut sink, mut stream) = framed.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<FromWorker>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(err) = codec::send(&mut sink, &message).await {
                warn!(error = %err, "write to coordinator failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let executor = Executor::new(
        options.capacity.cpus,
        options.functions.clone(),
        Arc::clone(&store),
        out_tx.clone(),
    );
    let heartbeat = tokio::spawn(heartbeat_loop(
        worker,
        heartbeat_interval,
        executor.clone(),
        Arc::clone(&store),
        out_tx.clone(),
    ));

    loop {
        let message = match codec::recv::<_, ToWorker>(&mut stream).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!(worker = %worker, "coordinator closed the connection");
                break;
            }
            Err(err) => {
                warn!(worker = %worker, error = %err, "coordinator connection failed");
                break;
            }
        };

        match message {
            ToWorker::Dispatch(request) => {
                let task = request.task;
                let attempt = request.attempt;
                let result = match executor.dispatch(request) {
                    Ok(()) => DispatchResult::Accepted,
                    Err(err) => {
                        debug!(task = %task, error = %err, "dispatch rejected");
                        DispatchResult::Rejected(DispatchRejection::from(err))
                    }
                };
                let _ = out_tx.send(FromWorker::DispatchAck {
                    task,
                    attempt,
                    result,
                });
            }
            ToWorker::Cancel { task } => {
                if !executor.cancel(task) {
                    debug!(task = %task, "cancel for a task that is not running here");
                }
            }
            ToWorker::ObjectTransferRequest { object, source } => {
                let store = Arc::clone(&store);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let reply = match store.fetch(object, &source).await {
                        Ok((_, stored)) => {
                            if !stored.spilled.is_empty() {
                                let _ = out_tx.send(FromWorker::ObjectsSpilled {
                                    objects: stored.spilled,
                                });
                            }
                            FromWorker::ObjectTransferComplete {
                                object,
                                size: stored.size,
                            }
                        }
                        Err(err) => FromWorker::ObjectTransferFailed {
                            object,
                            reason: err.to_string(),
                        },
                    };
                    let _ = out_tx.send(reply);
                });
            }
            ToWorker::RemoveObjects { objects } => store.remove(&objects).await,
            ToWorker::Shutdown => {
                info!(worker = %worker, "shutdown requested by coordinator");
                break;
            }
        }
    }

    heartbeat.abort();
    data_server.abort();
    drop(out_tx);
    writer.abort();
    Ok(())
}

async fn heartbeat_loop(
    worker: WorkerId,
    interval: Duration,
    executor: Executor,
    store: Arc<LocalStore>,
    out: mpsc::UnboundedSender<FromWorker>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let load = LoadSnapshot {
            running_tasks: executor.running(),
            memory_used_bytes: store.memory_used().await,
            stored_objects: u32::try_from(store.len().await).unwrap_or(u32::MAX),
        };
        if out.send(FromWorker::Heartbeat { worker, load }).is_err() {
            break;
        }
    }
}
