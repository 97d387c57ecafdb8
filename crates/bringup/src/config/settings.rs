//! Run limit resolution: CLI flag, then environment, then launch file, then default

use std::time::Duration;

use crate::config::RunSettings;
use crate::runtime::SchedulerConfig;

pub const GLOBAL_TIMEOUT_ENV: &str = "BRINGUP_GLOBAL_TIMEOUT_SECS";
pub const GRACE_PERIOD_ENV: &str = "BRINGUP_GRACE_PERIOD_SECS";

/// Positive integer from an environment variable; invalid values are logged and ignored
fn env_secs(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => {
            log::info!("Using {}={}", name, secs);
            Some(secs)
        }
        _ => {
            log::warn!(
                "Invalid {} value {:?}. A positive integer is expected.",
                name,
                raw
            );
            None
        }
    }
}

/// Drop a zero from the CLI or the launch file; it would expire immediately
fn positive(value: Option<u64>, name: &str, origin: &str) -> Option<u64> {
    match value {
        Some(0) => {
            log::warn!("Ignoring {} of 0 from {}. A positive integer is expected.", name, origin);
            None
        }
        other => other,
    }
}

/// Values passed on the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsOverrides {
    pub global_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
}

/// Merge every source into the scheduler limits
pub fn resolve_scheduler_config(
    file: &RunSettings,
    overrides: SettingsOverrides,
) -> SchedulerConfig {
    let defaults = SchedulerConfig::default();

    let global_timeout = positive(overrides.global_timeout_secs, "global timeout", "the command line")
        .or_else(|| env_secs(GLOBAL_TIMEOUT_ENV))
        .or(positive(file.global_timeout_secs, "global_timeout_secs", "the launch file"))
        .map(Duration::from_secs)
        .unwrap_or(defaults.global_timeout);

    let grace_period = positive(overrides.grace_period_secs, "grace period", "the command line")
        .or_else(|| env_secs(GRACE_PERIOD_ENV))
        .or(positive(file.grace_period_secs, "grace_period_secs", "the launch file"))
        .map(Duration::from_secs)
        .unwrap_or(defaults.grace_period);

    SchedulerConfig {
        global_timeout,
        grace_period,
    }
}
