// src/config/mod.rs

//! Configuration file model, loading and validation.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_or_default};
pub use model::{ConfigFile, CoordinatorSection, RawConfigFile, SchedulerSection, WorkerSection};
