use chrono::Utc;
use pmon_core::{
    Gateway, GatewayError, Instance, InstanceFilter, InstanceId, ProcessingAttributes, Task,
    TaskAttributes, TaskId,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info};

type QueuedWorkReply = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureFile {
    #[serde(default)]
    instances: Vec<Instance>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    attributes: Vec<FixtureAttributes>,
    #[serde(default)]
    queued_work: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureAttributes {
    task_id: TaskId,
    #[serde(flatten)]
    attributes: ProcessingAttributes,
}

/// Gateway backed by a JSON file that is re-read on every query, so editing
/// the file while the console runs looks like progress on the service.
pub struct FixtureGateway {
    path: PathBuf,
    on_queued_work: Option<QueuedWorkReply>,
}

impl FixtureGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            on_queued_work: None,
        }
    }

    /// Called with the file's `queuedWork` flag whenever a queued-work check
    /// is requested.
    pub fn on_queued_work(mut self, reply: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_queued_work = Some(Box::new(reply));
        self
    }

    fn load(&self) -> Result<FixtureFile, GatewayError> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            let reason = match err.kind() {
                ErrorKind::NotFound => "fixture not found".to_string(),
                _ => err.to_string(),
            };
            GatewayError::Unavailable(format!("{}: {reason}", self.path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|err| GatewayError::Query(format!("{}: {err}", self.path.display())))
    }
}

impl Gateway for FixtureGateway {
    fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, GatewayError> {
        let now = Utc::now();
        let mut instances: Vec<Instance> = self
            .load()?
            .instances
            .into_iter()
            .filter(|instance| filter.matches(instance, now))
            .collect();
        instances.sort_by_key(|instance| instance.id);
        Ok(instances)
    }

    fn list_tasks(&self, instance_id: InstanceId) -> Result<Vec<Task>, GatewayError> {
        let mut tasks: Vec<Task> = self
            .load()?
            .tasks
            .into_iter()
            .filter(|task| task.instance_id == instance_id)
            .collect();
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    fn list_processing_attributes(
        &self,
        instance_id: InstanceId,
    ) -> Result<TaskAttributes, GatewayError> {
        let fixture = self.load()?;
        let owned: HashSet<TaskId> = fixture
            .tasks
            .iter()
            .filter(|task| task.instance_id == instance_id)
            .map(|task| task.id)
            .collect();
        Ok(fixture
            .attributes
            .into_iter()
            .filter(|entry| owned.contains(&entry.task_id))
            .map(|entry| (entry.task_id, entry.attributes))
            .collect())
    }

    fn request_queued_work_check(&self) {
        match self.load() {
            Ok(fixture) => {
                info!(queued = fixture.queued_work, "queued work check");
                if let Some(reply) = &self.on_queued_work {
                    reply(fixture.queued_work);
                }
            }
            Err(err) => debug!(error = %err, "queued work check skipped"),
        }
    }
}
