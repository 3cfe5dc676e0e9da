use crate::{lock, read, write, EngineError, ModelEvent};
use pmon_core::{Gateway, Instance, InstanceFilter, InstanceId, InstanceState};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Filter owned by the surrounding UI and read on every automatic refresh.
pub type SharedFilter = Arc<RwLock<InstanceFilter>>;

#[derive(Debug, Default)]
struct FetchedInstances {
    instances: Arc<Vec<Instance>>,
    pending: bool,
}

/// Instances visible under the active filter, sorted ascending by id.
///
/// `refresh` runs on a background thread and only touches the fetched
/// snapshot; `commit` runs on the foreground and publishes it. Readers only
/// ever see the published snapshot.
pub struct InstanceViewModel {
    gateway: Arc<dyn Gateway>,
    filter: SharedFilter,
    refresh_gate: Mutex<()>,
    fetched: Mutex<FetchedInstances>,
    published: RwLock<Arc<Vec<Instance>>>,
    events: broadcast::Sender<ModelEvent>,
}

impl InstanceViewModel {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        filter: SharedFilter,
        events: broadcast::Sender<ModelEvent>,
    ) -> Self {
        Self {
            gateway,
            filter,
            refresh_gate: Mutex::new(()),
            fetched: Mutex::new(FetchedInstances::default()),
            published: RwLock::new(Arc::new(Vec::new())),
            events,
        }
    }

    /// Replaces the fetched snapshot with a fresh query. Blocking.
    ///
    /// Concurrent refreshes of the same model are serialized. A transient
    /// gateway error keeps the previous snapshot and reports success.
    pub fn refresh(&self, filter: &InstanceFilter) -> Result<(), EngineError> {
        let _gate = lock(&self.refresh_gate);
        match self.gateway.list_instances(filter) {
            Ok(mut instances) => {
                instances.sort_by_key(|instance| instance.id);
                let mut fetched = lock(&self.fetched);
                fetched.instances = Arc::new(instances);
                fetched.pending = true;
                Ok(())
            }
            Err(err) if err.is_transient() => {
                debug!(error = %err, "instance refresh skipped; keeping previous list");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Publishes the last fetched snapshot. Returns false, without notifying,
    /// when nothing was fetched since the previous commit.
    pub fn commit(&self) -> bool {
        let snapshot = {
            let mut fetched = lock(&self.fetched);
            if !fetched.pending {
                return false;
            }
            fetched.pending = false;
            Arc::clone(&fetched.instances)
        };
        *write(&self.published) = snapshot;
        let _ = self.events.send(ModelEvent::InstancesChanged);
        true
    }

    /// Refreshes with the current shared filter.
    pub fn refresh_with_current_filter(&self) -> Result<(), EngineError> {
        let filter = self.filter();
        self.refresh(&filter)
    }

    pub fn filter(&self) -> InstanceFilter {
        read(&self.filter).clone()
    }

    /// Takes effect on the next refresh.
    pub fn set_filter(&self, filter: InstanceFilter) {
        *write(&self.filter) = filter;
    }

    pub fn index_of(&self, instance_id: InstanceId) -> Option<usize> {
        read(&self.published)
            .iter()
            .position(|instance| instance.id == instance_id)
    }

    /// State of the highest-id instance. An empty list reads as COMPLETED,
    /// meaning there is nothing to report.
    pub fn state_of_newest_instance(&self) -> InstanceState {
        read(&self.published)
            .last()
            .map(|instance| instance.state.clone())
            .unwrap_or(InstanceState::Completed)
    }

    pub fn instances(&self) -> Arc<Vec<Instance>> {
        Arc::clone(&read(&self.published))
    }

    pub fn instance_at(&self, row: usize) -> Option<Instance> {
        read(&self.published).get(row).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.published).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.published).is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }
}
