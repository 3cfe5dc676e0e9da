use crate::{EngineError, InstanceViewModel, TaskViewModel};
use pmon_core::{InstanceId, Task, TaskId};
use std::sync::Arc;
use tracing::{debug, info};

/// Keeps the operator's instance and task selection consistent across
/// refreshes. Foreground only.
///
/// Task selection is remembered by task id so it survives the rows of a
/// reload coming back in a different order.
pub struct SelectionCoordinator {
    instances: Arc<InstanceViewModel>,
    tasks: Arc<TaskViewModel>,
    selected_instance: Option<InstanceId>,
    remembered_task_ids: Vec<TaskId>,
    selected_task_rows: Vec<usize>,
}

impl SelectionCoordinator {
    pub fn new(instances: Arc<InstanceViewModel>, tasks: Arc<TaskViewModel>) -> Self {
        Self {
            instances,
            tasks,
            selected_instance: None,
            remembered_task_ids: Vec::new(),
            selected_task_rows: Vec::new(),
        }
    }

    /// Drops the instance selection when the selected instance vanished from
    /// the committed list. Returns true when it did.
    pub fn after_instances_commit(&mut self) -> bool {
        let Some(selected) = self.selected_instance else {
            return false;
        };
        if self.instances.index_of(selected).is_some() {
            return false;
        }
        info!(instance = %selected, "selected instance left the instance list");
        self.tasks.set_instance(None);
        self.tasks.commit();
        self.selected_instance = None;
        self.remembered_task_ids.clear();
        self.selected_task_rows.clear();
        true
    }

    /// Operator picked an instance row. The caller refreshes the task model
    /// afterwards. Returns whether the instance is genuinely new; if so the
    /// remembered task selection is discarded.
    pub fn select_instance(&mut self, instance_id: InstanceId) -> Result<bool, EngineError> {
        if self.instances.index_of(instance_id).is_none() {
            return Err(EngineError::UnknownInstance(instance_id));
        }
        let genuinely_new = self.tasks.set_instance(Some(instance_id));
        self.selected_instance = Some(instance_id);
        if genuinely_new {
            self.remembered_task_ids.clear();
            self.selected_task_rows.clear();
        }
        Ok(genuinely_new)
    }

    /// Operator picked task rows. Rows past the end of the list are ignored.
    pub fn select_task_rows(&mut self, rows: &[usize]) {
        self.selected_task_rows.clear();
        self.remembered_task_ids.clear();
        for &row in rows {
            if let Some(task) = self.tasks.task_for_row(row) {
                self.selected_task_rows.push(row);
                self.remembered_task_ids.push(task.id);
            }
        }
    }

    pub fn clear_task_selection(&mut self) {
        self.selected_task_rows.clear();
        self.remembered_task_ids.clear();
    }

    /// Re-resolves remembered task ids after a task commit.
    ///
    /// When the data changed, row selection is stale and is dropped first.
    /// Ids that no longer resolve are forgotten. Returns true when a
    /// selection was reapplied.
    pub fn after_tasks_commit(&mut self, data_changed: bool) -> bool {
        if data_changed {
            self.selected_task_rows.clear();
        }
        if self.remembered_task_ids.is_empty() || !self.selected_task_rows.is_empty() {
            return false;
        }

        let mut kept = Vec::with_capacity(self.remembered_task_ids.len());
        let mut rows = Vec::with_capacity(self.remembered_task_ids.len());
        for &task_id in &self.remembered_task_ids {
            if let Some(&row) = self.tasks.rows_for_task_ids(&[task_id]).first() {
                kept.push(task_id);
                rows.push(row);
            }
        }
        if kept.len() < self.remembered_task_ids.len() {
            debug!(
                dropped = self.remembered_task_ids.len() - kept.len(),
                "remembered tasks no longer listed"
            );
        }
        self.remembered_task_ids = kept;
        self.selected_task_rows = rows;
        !self.selected_task_rows.is_empty()
    }

    pub fn selected_instance(&self) -> Option<InstanceId> {
        self.selected_instance
    }

    pub fn remembered_task_ids(&self) -> &[TaskId] {
        &self.remembered_task_ids
    }

    pub fn selected_task_rows(&self) -> &[usize] {
        &self.selected_task_rows
    }

    pub fn selected_tasks(&self) -> Vec<Task> {
        self.selected_task_rows
            .iter()
            .filter_map(|&row| self.tasks.task_for_row(row))
            .collect()
    }
}
