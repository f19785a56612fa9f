// src/config/validate.rs

use crate::config::model::{
    ConfigFile, CoordinatorSection, RawConfigFile, SchedulerSection, WorkerSection,
};
use crate::errors::{GovernorError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::GovernorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(
            raw.coordinator,
            raw.scheduler,
            raw.worker,
        ))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_coordinator(&cfg.coordinator)?;
    validate_scheduler(&cfg.scheduler)?;
    validate_worker(&cfg.worker)?;
    Ok(())
}

fn validate_coordinator(section: &CoordinatorSection) -> Result<()> {
    if section.heartbeat_interval_ms == 0 {
        return Err(config_error(
            "[coordinator].heartbeat_interval_ms must be > 0 (got 0)",
        ));
    }
    if section.dispatch_timeout_ms == 0 {
        return Err(config_error(
            "[coordinator].dispatch_timeout_ms must be > 0 (got 0)",
        ));
    }
    if section.disconnect_after_missed_heartbeats == 0 {
        return Err(config_error(
            "[coordinator].disconnect_after_missed_heartbeats must be >= 1 (got 0)",
        ));
    }
    if section.max_task_attempts == 0 {
        return Err(config_error(
            "[coordinator].max_task_attempts must be >= 1 (got 0)",
        ));
    }
    Ok(())
}

fn validate_scheduler(section: &SchedulerSection) -> Result<()> {
    let weights = [
        ("locality_bonus", section.locality_bonus),
        ("load_penalty", section.load_penalty),
        ("transfer_cost_per_mib", section.transfer_cost_per_mib),
    ];
    for (name, value) in weights {
        if !value.is_finite() || value < 0.0 {
            return Err(GovernorError::ConfigError(format!(
                "[scheduler].{name} must be a finite, non-negative number (got {value})"
            )));
        }
    }
    Ok(())
}

fn validate_worker(section: &WorkerSection) -> Result<()> {
    if section.cpus == Some(0) {
        return Err(config_error("[worker].cpus must be >= 1 (got 0)"));
    }
    if section.object_spill_threshold_bytes == 0 {
        return Err(config_error(
            "[worker].object_spill_threshold_bytes must be > 0 (got 0)",
        ));
    }
    Ok(())
}

fn config_error(msg: &str) -> GovernorError {
    GovernorError::ConfigError(msg.to_string())
}
