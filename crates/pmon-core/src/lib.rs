use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod gateway;

pub use gateway::{Gateway, GatewayCalls, GatewayError, MemoryGateway, TaskAttributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub i64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse lifecycle state of a pipeline instance.
///
/// The remote service reports states as strings. A value this client does
/// not know is kept as `Unrecognized` rather than being mapped onto a known
/// state, so the status indicator can refuse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    Initialized,
    Processing,
    Completed,
    ErrorsRunning,
    ErrorsStalled,
    Stopped,
    Unrecognized(String),
}

impl InstanceState {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Initialized => "INITIALIZED",
            InstanceState::Processing => "PROCESSING",
            InstanceState::Completed => "COMPLETED",
            InstanceState::ErrorsRunning => "ERRORS_RUNNING",
            InstanceState::ErrorsStalled => "ERRORS_STALLED",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Unrecognized(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_state_name(input);
        match normalized.as_str() {
            "INITIALIZED" => Ok(InstanceState::Initialized),
            "PROCESSING" => Ok(InstanceState::Processing),
            "COMPLETED" => Ok(InstanceState::Completed),
            "ERRORS_RUNNING" => Ok(InstanceState::ErrorsRunning),
            "ERRORS_STALLED" => Ok(InstanceState::ErrorsStalled),
            "STOPPED" => Ok(InstanceState::Stopped),
            _ => Err(format!("Unknown instance state: {}", input.trim())),
        }
    }
}

impl From<String> for InstanceState {
    fn from(raw: String) -> Self {
        raw.parse().unwrap_or(InstanceState::Unrecognized(raw))
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        match state {
            InstanceState::Unrecognized(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Initialized,
    Submitted,
    Processing,
    Error,
    Completed,
    Partial,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Initialized,
        TaskState::Submitted,
        TaskState::Processing,
        TaskState::Error,
        TaskState::Completed,
        TaskState::Partial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Initialized => "INITIALIZED",
            TaskState::Submitted => "SUBMITTED",
            TaskState::Processing => "PROCESSING",
            TaskState::Error => "ERROR",
            TaskState::Completed => "COMPLETED",
            TaskState::Partial => "PARTIAL",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_state_name(input);
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("Unknown task state: {}", input.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    #[default]
    Initializing,
    Marshaling,
    AlgorithmSubmitting,
    AlgorithmQueued,
    AlgorithmExecuting,
    AlgorithmComplete,
    Storing,
    Complete,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Initializing => "INITIALIZING",
            ProcessingState::Marshaling => "MARSHALING",
            ProcessingState::AlgorithmSubmitting => "ALGORITHM_SUBMITTING",
            ProcessingState::AlgorithmQueued => "ALGORITHM_QUEUED",
            ProcessingState::AlgorithmExecuting => "ALGORITHM_EXECUTING",
            ProcessingState::AlgorithmComplete => "ALGORITHM_COMPLETE",
            ProcessingState::Storing => "STORING",
            ProcessingState::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pipeline_name: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended: Option<DateTime<Utc>>,
}

impl Instance {
    /// "pipeline: name", or just the pipeline when the instance is unnamed.
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            self.pipeline_name.clone()
        } else {
            format!("{}: {}", self.pipeline_name, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub state: TaskState,
    pub module_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingAttributes {
    pub processing_state: ProcessingState,
    #[serde(default)]
    pub failed_subtask_count: u32,
    #[serde(default)]
    pub total_subtask_count: u32,
    #[serde(default)]
    pub completed_subtask_count: u32,
}

/// A task can be restarted when it errored outright, or when it finished
/// processing with some subtasks failed.
pub fn is_restart_candidate(task: &Task, attributes: Option<&ProcessingAttributes>) -> bool {
    if task.state == TaskState::Error {
        return true;
    }
    attributes.is_some_and(|attrs| {
        attrs.processing_state == ProcessingState::Complete && attrs.failed_subtask_count > 0
    })
}

/// Server-side instance predicate. Empty `states` admits every state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFilter {
    #[serde(default)]
    pub states: Vec<InstanceState>,
    #[serde(default)]
    pub age_days: Option<u32>,
    #[serde(default)]
    pub name_contains: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &Instance, now: DateTime<Utc>) -> bool {
        if !self.states.is_empty() && !self.states.contains(&instance.state) {
            return false;
        }
        if let Some(days) = self.age_days {
            if instance.created < now - Duration::days(i64::from(days)) {
                return false;
            }
        }
        if let Some(needle) = self.name_contains.as_deref() {
            let needle = needle.trim().to_lowercase();
            if !needle.is_empty() && !instance.display_name().to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

fn normalize_state_name(input: &str) -> String {
    input.trim().to_ascii_uppercase().replace(['-', ' '], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn instance(id: i64, state: InstanceState, name: &str) -> Instance {
        Instance {
            id: InstanceId(id),
            state,
            name: name.to_string(),
            pipeline_name: "calibration".to_string(),
            created: ts(10),
            started: None,
            ended: None,
        }
    }

    #[test]
    fn instance_state_accepts_loose_spellings() {
        assert_eq!(
            "errors-running".parse::<InstanceState>(),
            Ok(InstanceState::ErrorsRunning)
        );
        assert_eq!(" stopped ".parse::<InstanceState>(), Ok(InstanceState::Stopped));
        assert!("QUEUED".parse::<InstanceState>().is_err());
    }

    #[test]
    fn unknown_instance_state_survives_deserialization() {
        let raw = r#"{"id": 4, "state": "TRANSITION_FAILED", "created": "2026-03-10T12:00:00Z"}"#;
        let parsed: Instance = serde_json::from_str(raw).expect("parse instance");
        assert_eq!(
            parsed.state,
            InstanceState::Unrecognized("TRANSITION_FAILED".to_string())
        );

        let encoded = serde_json::to_value(&parsed).expect("encode instance");
        assert_eq!(encoded["state"], "TRANSITION_FAILED");
    }

    #[test]
    fn task_snapshot_uses_remote_field_names() {
        let raw = r#"{"id": 101, "instanceId": 7, "state": "PROCESSING", "moduleName": "cal"}"#;
        let task: Task = serde_json::from_str(raw).expect("parse task");
        assert_eq!(task.id, TaskId(101));
        assert_eq!(task.instance_id, InstanceId(7));
        assert_eq!(task.state, TaskState::Processing);
    }

    #[test]
    fn filter_applies_state_age_and_name() {
        let now = ts(20);
        let mut filter = InstanceFilter::default();
        let target = instance(1, InstanceState::Processing, "Nightly");
        assert!(filter.matches(&target, now));

        filter.states = vec![InstanceState::Completed];
        assert!(!filter.matches(&target, now));

        filter.states.clear();
        filter.age_days = Some(5);
        assert!(!filter.matches(&target, now));
        filter.age_days = Some(15);
        assert!(filter.matches(&target, now));

        filter.name_contains = Some("night".to_string());
        assert!(filter.matches(&target, now));
        filter.name_contains = Some("weekly".to_string());
        assert!(!filter.matches(&target, now));
    }

    #[test]
    fn restart_candidates_cover_errors_and_partial_failures() {
        let mut task = Task {
            id: TaskId(1),
            instance_id: InstanceId(1),
            state: TaskState::Error,
            module_name: "cal".to_string(),
        };
        assert!(is_restart_candidate(&task, None));

        task.state = TaskState::Completed;
        let mut attrs = ProcessingAttributes {
            processing_state: ProcessingState::Complete,
            failed_subtask_count: 2,
            ..ProcessingAttributes::default()
        };
        assert!(is_restart_candidate(&task, Some(&attrs)));

        attrs.failed_subtask_count = 0;
        assert!(!is_restart_candidate(&task, Some(&attrs)));
        assert!(!is_restart_candidate(&task, None));
    }
}
