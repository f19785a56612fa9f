// src/server/mod.rs

//! Coordinator process: TCP listener, connection table and the runtime.

pub mod backend;
pub mod listener;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ConfigFile;
use crate::engine::{Governor, GovernorEvent, GovernorOptions, Runtime};

pub use backend::{BackendFuture, ConnectionTable, MessageBackend, TcpBackend};

use listener::ListenerContext;

/// Time given to connection writers to flush `Shutdown` before exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// A bound, not yet running coordinator.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    options: GovernorOptions,
    events_tx: mpsc::Sender<GovernorEvent>,
    events_rx: mpsc::Receiver<GovernorEvent>,
}

impl Server {
    pub async fn bind(cfg: &ConfigFile) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&cfg.coordinator.listen)
            .await
            .with_context(|| format!("binding coordinator to {}", cfg.coordinator.listen))?;
        let (events_tx, events_rx) = mpsc::channel(1024);
        Ok(Self {
            listener,
            options: GovernorOptions::from_config(cfg),
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sender for injecting events, e.g. `ShutdownRequested`.
    pub fn events(&self) -> mpsc::Sender<GovernorEvent> {
        self.events_tx.clone()
    }

    /// Accept connections and run the coordinator until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let backend = TcpBackend::new();
        let heartbeat_interval_ms =
            u64::try_from(self.options.liveness.heartbeat_interval.as_millis()).unwrap_or(u64::MAX);
        let ctx = Arc::new(ListenerContext::new(
            backend.clone(),
            self.events_tx.clone(),
            heartbeat_interval_ms,
        ));

        let accept = tokio::spawn(listener::accept_loop(self.listener, ctx));

        let core = Governor::new(self.options);
        let runtime = Runtime::new(core, self.events_rx, self.events_tx, backend);
        let result = runtime.run().await;

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        accept.abort();
        Ok(result?)
    }
}

/// Run a coordinator from configuration until Ctrl-C.
///
/// If `ready_file` is given, the bound address is written to it once the
/// listener is up.
pub async fn run_server(cfg: &ConfigFile, ready_file: Option<&Path>) -> anyhow::Result<()> {
    let server = Server::bind(cfg).await?;
    let addr = server.local_addr()?;
    info!(%addr, "coordinator listening");

    let tx = server.events();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        let _ = tx.send(GovernorEvent::ShutdownRequested).await;
    });

    if let Some(path) = ready_file {
        std::fs::write(path, addr.to_string())
            .with_context(|| format!("writing ready file {}", path.display()))?;
    }

    server.run().await
}
