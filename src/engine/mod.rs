// src/engine/mod.rs

//! Coordinator engine.
//!
//! The pure core state machine lives in [`core`] (with its handlers split
//! over [`event_handlers`], [`sessions`] and [`recovery`]); the async/IO
//! shell is implemented in [`runtime`]. Every mutation of the task graph,
//! object store and worker registry happens inside [`Governor::step`], which
//! is the single serialization point of the coordinator.

use std::time::{Duration, Instant};

use crate::config::ConfigFile;
use crate::protocol::{FromClient, FromWorker};
use crate::registry::{LivenessPolicy, WorkerInfo};
use crate::scheduler::SchedulerWeights;
use crate::types::{ClientId, TaskId, WorkerId};

/// Options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct GovernorOptions {
    pub liveness: LivenessPolicy,
    pub dispatch_timeout: Duration,
    pub max_task_attempts: u32,
    pub debug_consistency_checks: bool,
    pub weights: SchedulerWeights,
}

impl GovernorOptions {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            liveness: LivenessPolicy {
                heartbeat_interval: cfg.coordinator.heartbeat_interval(),
                disconnect_after_missed_heartbeats: cfg
                    .coordinator
                    .disconnect_after_missed_heartbeats,
            },
            dispatch_timeout: cfg.coordinator.dispatch_timeout(),
            max_task_attempts: cfg.coordinator.max_task_attempts,
            debug_consistency_checks: cfg.coordinator.debug_consistency_checks,
            weights: SchedulerWeights::from(&cfg.scheduler),
        }
    }
}

impl Default for GovernorOptions {
    fn default() -> Self {
        Self::from_config(&ConfigFile::default())
    }
}

/// Events flowing into the coordinator from connections and timers.
#[derive(Debug, Clone)]
pub enum GovernorEvent {
    /// A worker completed the handshake.
    WorkerRegistered {
        worker: WorkerId,
        info: WorkerInfo,
        at: Instant,
    },
    WorkerMessage {
        worker: WorkerId,
        message: FromWorker,
        at: Instant,
    },
    /// The worker's connection closed. Treated as a confirmed disconnect.
    WorkerConnectionLost {
        worker: WorkerId,
    },
    ClientConnected {
        client: ClientId,
    },
    ClientRequest {
        client: ClientId,
        request: FromClient,
    },
    ClientDisconnected {
        client: ClientId,
    },
    /// Fired `dispatch_timeout` after a dispatch; ignored if acknowledged.
    DispatchTimedOut {
        task: TaskId,
        worker: WorkerId,
        attempt: u32,
    },
    /// Periodic liveness check and object sweep.
    Tick {
        now: Instant,
    },
    ShutdownRequested,
}

pub mod consistency;
pub mod core;
pub mod event_handlers;
pub mod recovery;
pub mod runtime;
pub mod sessions;

pub use core::Governor;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::Runtime;
