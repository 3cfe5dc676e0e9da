use crate::{lock, read, write, EngineError, ModelEvent};
use pmon_core::{
    is_restart_candidate, Gateway, InstanceId, ProcessingAttributes, Task, TaskAttributes,
    TaskId, TaskState,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceSelection {
    #[default]
    NoSelection,
    Selected(InstanceId),
}

impl InstanceSelection {
    pub fn id(self) -> Option<InstanceId> {
        match self {
            InstanceSelection::NoSelection => None,
            InstanceSelection::Selected(id) => Some(id),
        }
    }
}

impl From<Option<InstanceId>> for InstanceSelection {
    fn from(value: Option<InstanceId>) -> Self {
        value.map_or(InstanceSelection::NoSelection, InstanceSelection::Selected)
    }
}

/// Tasks and attributes of one instance, tagged with the instance they were
/// fetched for. An untagged snapshot is the empty "nothing selected" list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskSnapshot {
    pub instance_id: Option<InstanceId>,
    pub tasks: Vec<Task>,
    pub attributes: TaskAttributes,
}

impl TaskSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn attributes_for(&self, task_id: TaskId) -> Option<&ProcessingAttributes> {
        self.attributes.get(&task_id)
    }
}

/// Selection continuity record.
///
/// `last_selected` is the most recent non-none argument to `set_instance`
/// and is never cleared. `stash` is the last fetched snapshot of a selected
/// instance; it survives a round trip through "no selection" so the same
/// instance can be restored without a fetch.
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    current: InstanceSelection,
    last_selected: Option<InstanceId>,
    stash: Arc<TaskSnapshot>,
}

impl SelectionState {
    pub fn current(&self) -> InstanceSelection {
        self.current
    }

    pub fn stashed_instance_id(&self) -> Option<InstanceId> {
        self.last_selected
    }

    pub fn stash(&self) -> &TaskSnapshot {
        &self.stash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    FullUpdate,
    ReplaceFromStash,
    SameInstance,
}

impl UpdateMode {
    /// A forced reload always fetches. Otherwise an instance other than the
    /// stashed one fetches, and the stashed one is restored only when the
    /// live list is empty.
    pub fn select(
        force_reload: bool,
        current: InstanceId,
        prior: Option<InstanceId>,
        live_is_empty: bool,
    ) -> Self {
        if force_reload || prior != Some(current) {
            UpdateMode::FullUpdate
        } else if live_is_empty {
            UpdateMode::ReplaceFromStash
        } else {
            UpdateMode::SameInstance
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No instance selected; the live list was emptied without a fetch.
    Cleared,
    Updated(UpdateMode),
    /// The selection moved while the fetch was running; its result was
    /// dropped.
    Superseded,
    /// Transient gateway error; previous data kept.
    Retained,
}

/// Scoreboard row for one pipeline module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    pub module_name: String,
    pub state_counts: BTreeMap<TaskState, usize>,
    pub subtask_total: u64,
    pub subtask_complete: u64,
    pub subtask_failed: u64,
}

impl ModuleSummary {
    fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            state_counts: zeroed_state_counts(),
            subtask_total: 0,
            subtask_complete: 0,
            subtask_failed: 0,
        }
    }

    pub fn task_count(&self) -> usize {
        self.state_counts.values().sum()
    }
}

#[derive(Debug, Default)]
struct TaskModelState {
    selection: SelectionState,
    live: Arc<TaskSnapshot>,
    pending: bool,
}

/// Tasks of the selected instance.
///
/// `set_instance` and `commit` belong to the foreground; `refresh` runs in
/// the background and holds the state lock only around the bookkeeping, never
/// across a gateway call. Lookups read the published snapshot.
pub struct TaskViewModel {
    gateway: Arc<dyn Gateway>,
    refresh_gate: Mutex<()>,
    state: Mutex<TaskModelState>,
    published: RwLock<Arc<TaskSnapshot>>,
    events: broadcast::Sender<ModelEvent>,
}

impl TaskViewModel {
    pub fn new(gateway: Arc<dyn Gateway>, events: broadcast::Sender<ModelEvent>) -> Self {
        Self {
            gateway,
            refresh_gate: Mutex::new(()),
            state: Mutex::new(TaskModelState::default()),
            published: RwLock::new(Arc::new(TaskSnapshot::default())),
            events,
        }
    }

    /// Changes the selected instance and reports whether this is a genuinely
    /// new subject. Re-selecting the current instance, or returning to the
    /// last selected instance after a spell of "no selection", is not.
    ///
    /// The outgoing instance's live data is stashed first. Selecting none
    /// empties the live list.
    pub fn set_instance(&self, instance_id: Option<InstanceId>) -> bool {
        let mut state = lock(&self.state);
        let previous = state.selection.current.id();

        if let Some(prev) = previous {
            if state.live.instance_id == Some(prev) {
                state.selection.stash = Arc::clone(&state.live);
            }
        }

        let genuinely_new = match instance_id {
            Some(next) => {
                previous != Some(next)
                    && !(previous.is_none() && state.selection.last_selected == Some(next))
            }
            None => previous.is_some(),
        };

        state.selection.current = instance_id.into();
        match instance_id {
            Some(id) => state.selection.last_selected = Some(id),
            None => {
                if state.live.instance_id.is_some() || !state.live.is_empty() {
                    state.live = Arc::new(TaskSnapshot::default());
                    state.pending = true;
                }
            }
        }

        debug!(
            instance = ?instance_id,
            previous = ?previous,
            genuinely_new,
            "task instance selection changed"
        );
        genuinely_new
    }

    /// Brings the live data in line with the current selection. Blocking.
    ///
    /// Only `FullUpdate` reaches the gateway. Concurrent refreshes of this
    /// model are serialized; a transient gateway error keeps the previous
    /// data and leaves nothing to commit.
    pub fn refresh(&self, force_reload: bool) -> Result<RefreshOutcome, EngineError> {
        let _gate = lock(&self.refresh_gate);

        let target = {
            let mut state = lock(&self.state);
            let Some(current) = state.selection.current.id() else {
                if state.live.instance_id.is_some() || !state.live.is_empty() {
                    state.live = Arc::new(TaskSnapshot::default());
                    state.pending = true;
                }
                return Ok(RefreshOutcome::Cleared);
            };
            let prior = state.selection.stash.instance_id;
            match UpdateMode::select(force_reload, current, prior, state.live.is_empty()) {
                UpdateMode::SameInstance => {
                    return Ok(RefreshOutcome::Updated(UpdateMode::SameInstance));
                }
                UpdateMode::ReplaceFromStash => {
                    state.live = Arc::clone(&state.selection.stash);
                    state.pending = true;
                    return Ok(RefreshOutcome::Updated(UpdateMode::ReplaceFromStash));
                }
                UpdateMode::FullUpdate => current,
            }
        };

        let fetched = self.gateway.list_tasks(target).and_then(|tasks| {
            let attributes = self.gateway.list_processing_attributes(target)?;
            Ok((tasks, attributes))
        });
        let (tasks, attributes) = match fetched {
            Ok(data) => data,
            Err(err) if err.is_transient() => {
                debug!(instance = %target, error = %err, "task refresh skipped; keeping previous tasks");
                return Ok(RefreshOutcome::Retained);
            }
            Err(err) => return Err(err.into()),
        };

        let mut state = lock(&self.state);
        if state.selection.current.id() != Some(target) {
            debug!(instance = %target, "selection moved during task fetch; dropping result");
            return Ok(RefreshOutcome::Superseded);
        }
        let snapshot = Arc::new(TaskSnapshot {
            instance_id: Some(target),
            tasks,
            attributes,
        });
        state.selection.stash = Arc::clone(&snapshot);
        state.live = snapshot;
        state.pending = true;
        Ok(RefreshOutcome::Updated(UpdateMode::FullUpdate))
    }

    /// Publishes the live data. Returns false, without notifying, when
    /// nothing changed since the previous commit.
    pub fn commit(&self) -> bool {
        let snapshot = {
            let mut state = lock(&self.state);
            if !state.pending {
                return false;
            }
            state.pending = false;
            Arc::clone(&state.live)
        };
        *write(&self.published) = snapshot;
        let _ = self.events.send(ModelEvent::TasksChanged);
        true
    }

    pub fn task_for_row(&self, row: usize) -> Option<Task> {
        read(&self.published).tasks.get(row).cloned()
    }

    /// Current rows of the given task ids, in the order given. Ids no longer
    /// present are skipped.
    pub fn rows_for_task_ids(&self, ids: &[TaskId]) -> Vec<usize> {
        let published = read(&self.published);
        ids.iter()
            .filter_map(|id| published.tasks.iter().position(|task| task.id == *id))
            .collect()
    }

    /// Task count per state over the published list. Every state is present.
    pub fn aggregate_state_counts(&self) -> BTreeMap<TaskState, usize> {
        let mut counts = zeroed_state_counts();
        for task in &read(&self.published).tasks {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        counts
    }

    /// Per module scoreboard, ordered by module name.
    pub fn module_summaries(&self) -> Vec<ModuleSummary> {
        let published = read(&self.published);
        let mut modules: BTreeMap<&str, ModuleSummary> = BTreeMap::new();
        for task in &published.tasks {
            let summary = modules
                .entry(task.module_name.as_str())
                .or_insert_with(|| ModuleSummary::new(&task.module_name));
            *summary.state_counts.entry(task.state).or_insert(0) += 1;
            if let Some(attrs) = published.attributes_for(task.id) {
                summary.subtask_total += u64::from(attrs.total_subtask_count);
                summary.subtask_complete += u64::from(attrs.completed_subtask_count);
                summary.subtask_failed += u64::from(attrs.failed_subtask_count);
            }
        }
        modules.into_values().collect()
    }

    /// Tasks eligible for restart. An empty `ids` considers every task.
    pub fn restart_candidates(&self, ids: &[TaskId]) -> Vec<Task> {
        let published = read(&self.published);
        published
            .tasks
            .iter()
            .filter(|task| ids.is_empty() || ids.contains(&task.id))
            .filter(|task| is_restart_candidate(task, published.attributes_for(task.id)))
            .cloned()
            .collect()
    }

    pub fn published_snapshot(&self) -> Arc<TaskSnapshot> {
        Arc::clone(&read(&self.published))
    }

    pub fn selection_state(&self) -> SelectionState {
        lock(&self.state).selection.clone()
    }

    pub fn current_instance(&self) -> Option<InstanceId> {
        lock(&self.state).selection.current.id()
    }

    pub fn len(&self) -> usize {
        read(&self.published).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.published).is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }
}

fn zeroed_state_counts() -> BTreeMap<TaskState, usize> {
    TaskState::ALL.into_iter().map(|state| (state, 0)).collect()
}
