pub mod config;
pub mod console;
pub mod error;
pub mod foreground;
pub mod indicator;
pub mod instances;
pub mod poller;
pub mod selection;
pub mod tasks;

pub use config::{parse_bool_flag, ConsoleConfig, PollerConfig, DEFAULT_POLL_INTERVAL_MS};
pub use console::{Console, CycleReport};
pub use error::EngineError;
pub use foreground::{foreground_queue, Dispatcher, ForegroundQueue};
pub use indicator::{indicator_for, Lamp, LampColor, StatusIndicator, StreakState};
pub use instances::{InstanceViewModel, SharedFilter};
pub use poller::{Poller, MIN_POLL_INTERVAL};
pub use selection::SelectionCoordinator;
pub use tasks::{
    InstanceSelection, ModuleSummary, RefreshOutcome, SelectionState, TaskSnapshot,
    TaskViewModel, UpdateMode,
};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Change notifications fired by `commit()` on the view models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvent {
    InstancesChanged,
    TasksChanged,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
