// tests/property/main.rs
#[path = "../common/mod.rs"]
mod common;
mod graph_runs;
mod liveness;
mod object_refs;
