// src/server/listener.rs

//! Accept loop and per-connection tasks of the coordinator.
//!
//! Each connection starts with a [`Hello`]. Afterwards a writer task drains
//! the peer's outgoing queue into the socket while the reader turns incoming
//! frames into [`GovernorEvent`]s. When the socket closes the peer is
//! removed from the connection table and the core is told.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::engine::GovernorEvent;
use crate::errors::{GovernorError, Result};
use crate::protocol::codec;
use crate::protocol::{FromClient, FromWorker, Hello, HelloReply, PROTOCOL_VERSION};
use crate::registry::WorkerInfo;
use crate::server::backend::TcpBackend;
use crate::types::{ClientId, WorkerId};

/// State shared by all connection tasks.
#[derive(Debug)]
pub(crate) struct ListenerContext {
    pub(crate) backend: TcpBackend,
    pub(crate) events: mpsc::Sender<GovernorEvent>,
    pub(crate) heartbeat_interval_ms: u64,
    next_worker: AtomicU64,
    next_client: AtomicU64,
}

impl ListenerContext {
    pub(crate) fn new(
        backend: TcpBackend,
        events: mpsc::Sender<GovernorEvent>,
        heartbeat_interval_ms: u64,
    ) -> Self {
        Self {
            backend,
            events,
            heartbeat_interval_ms,
            next_worker: AtomicU64::new(1),
            next_client: AtomicU64::new(1),
        }
    }
}

pub(crate) async fn accept_loop(listener: TcpListener, ctx: Arc<ListenerContext>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "could not disable Nagle");
        }
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, ctx).await {
                warn!(%peer, error = %err, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ListenerContext>,
) -> Result<()> {
    let mut framed = codec::framed(stream);
    let hello: Hello = codec::expect(&mut framed).await?;

    let version = match &hello {
        Hello::Worker { version, .. } | Hello::Client { version } => *version,
    };
    if version != PROTOCOL_VERSION {
        let reason = format!(
            "protocol version {version} is not supported (expected {PROTOCOL_VERSION})"
        );
        codec::send(&mut framed, &HelloReply::Rejected(reason.clone())).await?;
        return Err(GovernorError::Protocol(reason));
    }

    match hello {
        Hello::Worker {
            data_address,
            capacity,
            ..
        } => {
            let worker = WorkerId(ctx.next_worker.fetch_add(1, Ordering::Relaxed));
            let info = WorkerInfo {
                address: peer.to_string(),
                data_address: resolve_data_address(&data_address, peer),
                capacity,
            };
            codec::send(
                &mut framed,
                &HelloReply::WorkerAccepted {
                    worker,
                    heartbeat_interval_ms: ctx.heartbeat_interval_ms,
                },
            )
            .await?;
            info!(worker = %worker, %peer, data = %info.data_address, cpus = capacity.cpus, "worker connected");

            let (tx, rx) = mpsc::unbounded_channel();
            ctx.backend.workers.insert(worker, tx)?;
            let registered = GovernorEvent::WorkerRegistered {
                worker,
                info,
                at: Instant::now(),
            };
            if ctx.events.send(registered).await.is_ok() {
                pump(framed, rx, &ctx.events, |message: FromWorker| {
                    GovernorEvent::WorkerMessage {
                        worker,
                        message,
                        at: Instant::now(),
                    }
                })
                .await;
            }

            ctx.backend.workers.remove(worker)?;
            info!(worker = %worker, "worker connection closed");
            let _ = ctx
                .events
                .send(GovernorEvent::WorkerConnectionLost { worker })
                .await;
        }
        Hello::Client { .. } => {
            let client = ClientId(ctx.next_client.fetch_add(1, Ordering::Relaxed));
            codec::send(&mut framed, &HelloReply::ClientAccepted { client }).await?;
            debug!(client = %client, %peer, "client connected");

            let (tx, rx) = mpsc::unbounded_channel();
            ctx.backend.clients.insert(client, tx)?;
            if ctx
                .events
                .send(GovernorEvent::ClientConnected { client })
                .await
                .is_ok()
            {
                pump(framed, rx, &ctx.events, |request: FromClient| {
                    GovernorEvent::ClientRequest { client, request }
                })
                .await;
            }

            ctx.backend.clients.remove(client)?;
            let _ = ctx
                .events
                .send(GovernorEvent::ClientDisconnected { client })
                .await;
        }
    }
    Ok(())
}

/// Shuttle frames both ways until either side gives up.
async fn pump<In, Out, F>(
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Out>,
    events: &mpsc::Sender<GovernorEvent>,
    to_event: F,
) where
    In: DeserializeOwned,
    Out: Serialize + Send + 'static,
    F: Fn(In) -> GovernorEvent,
{
    let (mut sink, mut stream) = framed.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            let frame = match codec::encode(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "could not encode outgoing message");
                    continue;
                }
            };
            if let Err(err) = sink.send(frame).await {
                debug!(error = %err, "write failed; closing connection");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        match codec::recv::<_, In>(&mut stream).await {
            Ok(Some(message)) => {
                if events.send(to_event(message)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "undecodable frame; dropping connection");
                break;
            }
        }
    }

    writer.abort();
}

/// Workers listening on `0.0.0.0` are reachable at the IP they connected from.
pub(crate) fn resolve_data_address(announced: &str, peer: SocketAddr) -> String {
    match announced.parse::<SocketAddr>() {
        Ok(mut addr) if addr.ip().is_unspecified() => {
            addr.set_ip(peer.ip());
            addr.to_string()
        }
        _ => announced.to_string(),
    }
}
