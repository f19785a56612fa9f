// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::Resources;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [coordinator]
/// listen = "0.0.0.0:7210"
/// heartbeat_interval_ms = 1000
///
/// [scheduler]
/// locality_bonus = 100.0
///
/// [worker]
/// server = "127.0.0.1:7210"
/// cpus = 4
/// ```
///
/// Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub coordinator: CoordinatorSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub worker: WorkerSection,
}

/// Validated configuration. Construct via `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub coordinator: CoordinatorSection,
    pub scheduler: SchedulerSection,
    pub worker: WorkerSection,
}

impl ConfigFile {
    /// Build without running validation. Callers must have validated the
    /// sections already.
    pub(crate) fn new_unchecked(
        coordinator: CoordinatorSection,
        scheduler: SchedulerSection,
        worker: WorkerSection,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            worker,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(
            CoordinatorSection::default(),
            SchedulerSection::default(),
            WorkerSection::default(),
        )
    }
}

/// `[coordinator]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorSection {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Workers send a heartbeat this often. The coordinator runs its
    /// liveness check and object sweep twice per interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a dispatch may stay unacknowledged before it is moved to
    /// another worker.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Missed heartbeat windows before a worker is disconnected. It is
    /// Suspected for at least one liveness check first, also when this is 1.
    #[serde(default = "default_disconnect_after_missed_heartbeats")]
    pub disconnect_after_missed_heartbeats: u32,

    /// Upper bound on dispatches of one task when it keeps failing with a
    /// transient input error.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,

    #[serde(default)]
    pub debug_consistency_checks: bool,
}

fn default_listen() -> String {
    "0.0.0.0:7210".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_dispatch_timeout_ms() -> u64 {
    5000
}

fn default_disconnect_after_missed_heartbeats() -> u32 {
    2
}

fn default_max_task_attempts() -> u32 {
    8
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            disconnect_after_missed_heartbeats: default_disconnect_after_missed_heartbeats(),
            max_task_attempts: default_max_task_attempts(),
            debug_consistency_checks: false,
        }
    }
}

impl CoordinatorSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// `[scheduler]` section: weights of the placement score.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_locality_bonus")]
    pub locality_bonus: f64,

    #[serde(default = "default_load_penalty")]
    pub load_penalty: f64,

    #[serde(default = "default_transfer_cost_per_mib")]
    pub transfer_cost_per_mib: f64,

    #[serde(default = "default_replicate_shared_inputs")]
    pub replicate_shared_inputs: bool,
}

fn default_locality_bonus() -> f64 {
    100.0
}

fn default_load_penalty() -> f64 {
    50.0
}

fn default_transfer_cost_per_mib() -> f64 {
    1.0
}

fn default_replicate_shared_inputs() -> bool {
    true
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            locality_bonus: default_locality_bonus(),
            load_penalty: default_load_penalty(),
            transfer_cost_per_mib: default_transfer_cost_per_mib(),
            replicate_shared_inputs: default_replicate_shared_inputs(),
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    /// Coordinator address to connect to.
    #[serde(default = "default_server")]
    pub server: String,

    /// Address of the worker's data server; port 0 picks a free port.
    #[serde(default = "default_worker_listen")]
    pub listen: String,

    /// CPU slots. `None` means "use the detected parallelism".
    #[serde(default)]
    pub cpus: Option<u32>,

    /// Memory capacity; 0 means unlimited.
    #[serde(default)]
    pub memory_bytes: u64,

    #[serde(default = "default_object_spill_threshold_bytes")]
    pub object_spill_threshold_bytes: u64,

    /// Scratch directory for spilled objects. `None` means a temporary
    /// directory removed on exit.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

fn default_server() -> String {
    "127.0.0.1:7210".to_string()
}

fn default_worker_listen() -> String {
    "0.0.0.0:0".to_string()
}

fn default_object_spill_threshold_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            listen: default_worker_listen(),
            cpus: None,
            memory_bytes: 0,
            object_spill_threshold_bytes: default_object_spill_threshold_bytes(),
            work_dir: None,
        }
    }
}

impl WorkerSection {
    /// Capacity announced in the handshake.
    pub fn capacity(&self) -> Resources {
        let cpus = self.cpus.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(1)
        });
        Resources::new(cpus, self.memory_bytes)
    }
}
