// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
pub mod worker;

use anyhow::Result;
use tracing::info;

use crate::cli::{CliArgs, Command};
use crate::config::load_or_default;
use crate::worker::WorkerOptions;

/// High-level entry point used by `main.rs`: load configuration, apply CLI
/// overrides and run the selected role.
pub async fn run(args: CliArgs) -> Result<()> {
    let mut cfg = load_or_default(args.config.as_deref())?;

    match args.command {
        Command::Server(server_args) => {
            server_args.apply(&mut cfg);
            server::run_server(&cfg, server_args.ready_file.as_deref()).await
        }
        Command::Worker(worker_args) => {
            worker_args.apply(&mut cfg);
            let options = WorkerOptions::from_config(&cfg);
            info!(server = %options.server, cpus = options.capacity.cpus, "starting worker");
            worker::run_worker(options).await
        }
    }
}
