use pmon_core::{InstanceFilter, InstanceState};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsoleConfig {
    pub poll: PollerConfig,
    pub filter: InstanceFilter,
    pub log_stdout: bool,
}

impl ConsoleConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves every setting through `lookup`, which returns the raw value
    /// of an environment variable when it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            poll: PollerConfig {
                interval: resolve_poll_interval(&lookup),
            },
            filter: InstanceFilter {
                states: resolve_filter_states(&lookup),
                age_days: resolve_filter_age_days(&lookup),
                name_contains: resolve_filter_name(&lookup),
            },
            log_stdout: lookup("PMON_LOG_STDOUT")
                .and_then(|value| parse_bool_flag(&value))
                .unwrap_or(false),
        }
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_poll_interval(lookup: &impl Fn(&str) -> Option<String>) -> Duration {
    let millis = match lookup("PMON_POLL_INTERVAL_MS") {
        Some(value) => match value.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => ms,
            _ => {
                warn!(value = %value, "ignoring invalid PMON_POLL_INTERVAL_MS");
                DEFAULT_POLL_INTERVAL_MS
            }
        },
        None => DEFAULT_POLL_INTERVAL_MS,
    };
    Duration::from_millis(millis)
}

fn resolve_filter_states(lookup: &impl Fn(&str) -> Option<String>) -> Vec<InstanceState> {
    let Some(value) = lookup("PMON_FILTER_STATES") else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match item.parse::<InstanceState>() {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(error = %err, "ignoring PMON_FILTER_STATES entry");
                None
            }
        })
        .collect()
}

fn resolve_filter_age_days(lookup: &impl Fn(&str) -> Option<String>) -> Option<u32> {
    let value = lookup("PMON_FILTER_AGE_DAYS")?;
    if value.trim().is_empty() {
        return None;
    }
    match value.trim().parse::<u32>() {
        Ok(days) => Some(days),
        Err(_) => {
            warn!(value = %value, "ignoring invalid PMON_FILTER_AGE_DAYS");
            None
        }
    }
}

fn resolve_filter_name(lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    lookup("PMON_FILTER_NAME")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
