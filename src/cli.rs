// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ConfigFile;

/// Command-line arguments for `taskgov`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskgov",
    version,
    about = "Distributed task-graph coordinator and worker.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML). Built-in defaults are used if omitted.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKGOV_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the coordinator.
    Server(ServerArgs),
    /// Run a worker and connect it to a coordinator.
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Overrides `[coordinator].listen`.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Write the bound address to this file once listening.
    #[arg(long, value_name = "PATH")]
    pub ready_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Overrides `[worker].server`.
    #[arg(long, value_name = "ADDR")]
    pub server: Option<String>,

    /// Overrides `[worker].listen` (data server address).
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Overrides `[worker].cpus`.
    #[arg(long, value_name = "N")]
    pub cpus: Option<u32>,

    /// Overrides `[worker].memory_bytes`.
    #[arg(long, value_name = "BYTES")]
    pub memory: Option<u64>,

    /// Overrides `[worker].work_dir`.
    #[arg(long, value_name = "PATH")]
    pub work_dir: Option<PathBuf>,
}

impl ServerArgs {
    pub fn apply(&self, cfg: &mut ConfigFile) {
        if let Some(listen) = &self.listen {
            cfg.coordinator.listen = listen.clone();
        }
    }
}

impl WorkerArgs {
    pub fn apply(&self, cfg: &mut ConfigFile) {
        if let Some(server) = &self.server {
            cfg.worker.server = server.clone();
        }
        if let Some(listen) = &self.listen {
            cfg.worker.listen = listen.clone();
        }
        if self.cpus.is_some() {
            cfg.worker.cpus = self.cpus;
        }
        if let Some(memory) = self.memory {
            cfg.worker.memory_bytes = memory;
        }
        if self.work_dir.is_some() {
            cfg.worker.work_dir = self.work_dir.clone();
        }
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
