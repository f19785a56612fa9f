// src/engine/runtime.rs

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::server::MessageBackend;

use super::core::Governor;
use super::{CoreCommand, GovernorEvent};

/// Drives the [`Governor`] from connection events and timers, and hands the
/// resulting messages to a [`MessageBackend`].
///
/// The coordinator semantics live in the core; this shell only owns the
/// channels, the tick timer and the per-dispatch timeout timers.
pub struct Runtime<B: MessageBackend> {
    core: Governor,
    event_rx: mpsc::Receiver<GovernorEvent>,
    /// Used by timers to feed events back into the loop.
    event_tx: mpsc::Sender<GovernorEvent>,
    backend: B,
    tick_interval: Duration,
}

impl<B: MessageBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl<B: MessageBackend> Runtime<B> {
    pub fn new(
        core: Governor,
        event_rx: mpsc::Receiver<GovernorEvent>,
        event_tx: mpsc::Sender<GovernorEvent>,
        backend: B,
    ) -> Self {
        // Check liveness twice per heartbeat window.
        let tick_interval = (core.options().liveness.heartbeat_interval / 2)
            .max(Duration::from_millis(10));
        Self {
            core,
            event_rx,
            event_tx,
            backend,
            tick_interval,
        }
    }

    /// Main event loop. Returns once the core handles `ShutdownRequested`.
    pub async fn run(mut self) -> Result<()> {
        info!(tick = ?self.tick_interval, "coordinator runtime started");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            let event = tokio::select! {
                received = self.event_rx.recv() => match received {
                    Some(event) => event,
                    None => {
                        info!("event channel closed; exiting");
                        break;
                    }
                },
                at = ticker.tick() => GovernorEvent::Tick { now: at.into_std() },
            };

            if !matches!(event, GovernorEvent::Tick { .. }) {
                debug!(?event, "coordinator received event");
            }

            let step = self.core.step(event);
            for command in step.commands {
                self.execute_command(command).await;
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        info!("coordinator runtime exiting");
        Ok(())
    }

    /// Delivery failures mean the peer is gone; its connection task reports
    /// the loss as an event of its own.
    async fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::SendToWorker { worker, message } => {
                if let Err(err) = self.backend.send_to_worker(worker, message).await {
                    warn!(worker = %worker, error = %err, "could not send to worker");
                }
            }
            CoreCommand::SendToClient { client, message } => {
                if let Err(err) = self.backend.send_to_client(client, message).await {
                    warn!(client = %client, error = %err, "could not send to client");
                }
            }
            CoreCommand::ArmDispatchTimer {
                task,
                worker,
                attempt,
            } => {
                let tx = self.event_tx.clone();
                let timeout = self.core.options().dispatch_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx
                        .send(GovernorEvent::DispatchTimedOut {
                            task,
                            worker,
                            attempt,
                        })
                        .await;
                });
            }
            CoreCommand::DisconnectWorker { worker } => {
                if let Err(err) = self.backend.disconnect_worker(worker).await {
                    warn!(worker = %worker, error = %err, "could not close worker connection");
                }
            }
        }
    }
}
