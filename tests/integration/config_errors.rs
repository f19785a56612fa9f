// tests/integration/config_errors.rs

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use taskgov::config::{load_and_validate, load_or_default};
use taskgov::errors::GovernorError;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn full_config_is_loaded() {
    let file = write_config(
        r#"
[coordinator]
listen = "127.0.0.1:9000"
heartbeat_interval_ms = 250
dispatch_timeout_ms = 1500
disconnect_after_missed_heartbeats = 4
max_task_attempts = 2

[scheduler]
locality_bonus = 10.0
load_penalty = 5.0
transfer_cost_per_mib = 0.5
replicate_shared_inputs = false

[worker]
server = "10.1.2.3:9000"
cpus = 6
memory_bytes = 1048576
work_dir = "/var/tmp/taskgov"
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();

    assert_eq!(cfg.coordinator.listen, "127.0.0.1:9000");
    assert_eq!(cfg.coordinator.heartbeat_interval().as_millis(), 250);
    assert_eq!(cfg.coordinator.dispatch_timeout().as_millis(), 1500);
    assert_eq!(cfg.coordinator.disconnect_after_missed_heartbeats, 4);
    assert_eq!(cfg.coordinator.max_task_attempts, 2);
    assert_eq!(cfg.scheduler.locality_bonus, 10.0);
    assert!(!cfg.scheduler.replicate_shared_inputs);
    assert_eq!(cfg.worker.server, "10.1.2.3:9000");
    assert_eq!(cfg.worker.capacity().cpus, 6);
    assert_eq!(cfg.worker.capacity().memory_bytes, 1_048_576);
    assert_eq!(
        cfg.worker.work_dir.as_deref(),
        Some(Path::new("/var/tmp/taskgov"))
    );
}

#[test]
fn empty_file_gives_defaults() {
    let file = write_config("");
    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.coordinator.heartbeat_interval().as_millis(), 1000);
    assert_eq!(cfg.coordinator.disconnect_after_missed_heartbeats, 2);
    assert!(cfg.worker.capacity().cpus >= 1);
}

#[test]
fn no_path_gives_defaults() {
    let cfg = load_or_default(None).unwrap();
    assert_eq!(cfg.coordinator.listen, "0.0.0.0:7210");
}

#[test]
fn zero_heartbeat_interval_is_rejected() {
    let file = write_config(
        r#"
[coordinator]
heartbeat_interval_ms = 0
"#,
    );

    match load_and_validate(file.path()) {
        Err(GovernorError::ConfigError(msg)) => {
            assert!(msg.contains("heartbeat_interval_ms"), "message: {msg}");
        }
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn negative_scheduler_weight_is_rejected() {
    let file = write_config(
        r#"
[scheduler]
load_penalty = -1.0
"#,
    );

    match load_and_validate(file.path()) {
        Err(GovernorError::ConfigError(msg)) => {
            assert!(msg.contains("load_penalty"), "message: {msg}");
            assert!(msg.contains("-1"), "message: {msg}");
        }
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn zero_worker_cpus_is_rejected() {
    let file = write_config(
        r#"
[worker]
cpus = 0
"#,
    );

    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, GovernorError::ConfigError(msg) if msg.contains("[worker].cpus")));
}

#[test]
fn unknown_keys_are_a_parse_error() {
    let file = write_config(
        r#"
[coordinator]
heartbeat_ms = 10
"#,
    );

    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, GovernorError::TomlError(_)), "got {err:?}");
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_and_validate(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, GovernorError::IoError(_)), "got {err:?}");
}
