// tests/integration/main.rs

#[path = "../common/mod.rs"]
mod common;

mod config_errors;
mod end_to_end;
mod local_store;
mod runtime_backend;
mod worker_executor;
