use crate::{Instance, InstanceFilter, InstanceId, ProcessingAttributes, Task, TaskId};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub type TaskAttributes = HashMap<TaskId, ProcessingAttributes>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl GatewayError {
    /// Errors the console recovers from by keeping its previous snapshot.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::SessionExpired(_))
    }
}

/// Blocking query interface to the remote pipeline service.
///
/// Calls are serialized on the service side; implementations must still be
/// callable from any background thread.
pub trait Gateway: Send + Sync {
    fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, GatewayError>;

    fn list_tasks(&self, instance_id: InstanceId) -> Result<Vec<Task>, GatewayError>;

    fn list_processing_attributes(
        &self,
        instance_id: InstanceId,
    ) -> Result<TaskAttributes, GatewayError>;

    /// Fire-and-forget request asking the service to report queued work.
    fn request_queued_work_check(&self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GatewayCalls {
    pub list_instances: usize,
    pub list_tasks: usize,
    pub list_attributes: usize,
    pub queued_work_checks: usize,
}

#[derive(Debug, Default)]
struct MemoryData {
    instances: Vec<Instance>,
    tasks: BTreeMap<InstanceId, Vec<Task>>,
    attributes: BTreeMap<InstanceId, TaskAttributes>,
    failures: VecDeque<GatewayError>,
}

/// In-process gateway holding its data in memory. Counts every query so
/// callers can assert which refreshes reached the service.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    data: Mutex<MemoryData>,
    list_instances_calls: AtomicUsize,
    list_tasks_calls: AtomicUsize,
    list_attributes_calls: AtomicUsize,
    queued_work_checks: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(instances: Vec<Instance>) -> Self {
        let gateway = Self::new();
        gateway.set_instances(instances);
        gateway
    }

    pub fn set_instances(&self, instances: Vec<Instance>) {
        self.data().instances = instances;
    }

    pub fn set_tasks(&self, instance_id: InstanceId, tasks: Vec<Task>) {
        self.data().tasks.insert(instance_id, tasks);
    }

    pub fn set_attributes(&self, instance_id: InstanceId, attributes: TaskAttributes) {
        self.data().attributes.insert(instance_id, attributes);
    }

    /// The next query of any kind fails with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, error: GatewayError) {
        self.data().failures.push_back(error);
    }

    pub fn calls(&self) -> GatewayCalls {
        GatewayCalls {
            list_instances: self.list_instances_calls.load(Ordering::SeqCst),
            list_tasks: self.list_tasks_calls.load(Ordering::SeqCst),
            list_attributes: self.list_attributes_calls.load(Ordering::SeqCst),
            queued_work_checks: self.queued_work_checks.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        self.list_instances_calls.store(0, Ordering::SeqCst);
        self.list_tasks_calls.store(0, Ordering::SeqCst);
        self.list_attributes_calls.store(0, Ordering::SeqCst);
        self.queued_work_checks.store(0, Ordering::SeqCst);
    }

    fn data(&self) -> MutexGuard<'_, MemoryData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(data: &mut MemoryData) -> Result<(), GatewayError> {
        match data.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Gateway for MemoryGateway {
    fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, GatewayError> {
        self.list_instances_calls.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data();
        Self::take_failure(&mut data)?;
        let now = Utc::now();
        let mut instances: Vec<Instance> = data
            .instances
            .iter()
            .filter(|instance| filter.matches(instance, now))
            .cloned()
            .collect();
        instances.sort_by_key(|instance| instance.id);
        Ok(instances)
    }

    fn list_tasks(&self, instance_id: InstanceId) -> Result<Vec<Task>, GatewayError> {
        self.list_tasks_calls.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data();
        Self::take_failure(&mut data)?;
        Ok(data.tasks.get(&instance_id).cloned().unwrap_or_default())
    }

    fn list_processing_attributes(
        &self,
        instance_id: InstanceId,
    ) -> Result<TaskAttributes, GatewayError> {
        self.list_attributes_calls.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data();
        Self::take_failure(&mut data)?;
        Ok(data
            .attributes
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    fn request_queued_work_check(&self) {
        self.queued_work_checks.fetch_add(1, Ordering::SeqCst);
    }
}
