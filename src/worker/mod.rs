// src/worker/mod.rs

//! Worker process: executes dispatched tasks, keeps their outputs and
//! serves them to peers.

pub mod data_server;
pub mod executor;
pub mod functions;
pub mod runtime;
pub mod store;

use std::path::PathBuf;

use crate::config::ConfigFile;
use crate::types::Resources;

pub use executor::Executor;
pub use functions::{FunctionRegistry, TaskFn, TaskFuture, TaskInput};
pub use runtime::run_worker;
pub use store::LocalStore;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Coordinator address.
    pub server: String,
    /// Bind address of the data server.
    pub listen: String,
    pub capacity: Resources,
    pub spill_threshold: u64,
    pub work_dir: Option<PathBuf>,
    pub functions: FunctionRegistry,
}

impl WorkerOptions {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            server: cfg.worker.server.clone(),
            listen: cfg.worker.listen.clone(),
            capacity: cfg.worker.capacity(),
            spill_threshold: cfg.worker.object_spill_threshold_bytes,
            work_dir: cfg.worker.work_dir.clone(),
            functions: FunctionRegistry::with_builtins(),
        }
    }
}
