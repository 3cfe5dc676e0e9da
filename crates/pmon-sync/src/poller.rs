use crate::foreground::{run_background, Dispatcher};
use crate::{Console, EngineError, InstanceViewModel, PollerConfig, TaskViewModel};
use pmon_core::Gateway;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest period the loop will tick at; `interval` rejects zero.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed-rate refresh loop.
///
/// Each tick refreshes both view models on the blocking pool, then
/// dispatches the commit step to the console's foreground queue. Cycles run
/// one at a time; a tick that falls due while a cycle is still running is
/// skipped.
pub struct Poller {
    instances: Arc<InstanceViewModel>,
    tasks: Arc<TaskViewModel>,
    gateway: Arc<dyn Gateway>,
    dispatcher: Dispatcher<Console>,
    runtime: Handle,
    config: PollerConfig,
    live: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new(console: &Console, mut config: PollerConfig) -> Self {
        if config.interval < MIN_POLL_INTERVAL {
            warn!(
                interval_ms = config.interval.as_millis() as u64,
                "poll interval below minimum; clamping"
            );
            config.interval = MIN_POLL_INTERVAL;
        }
        Self {
            instances: Arc::clone(console.instances()),
            tasks: Arc::clone(console.tasks()),
            gateway: Arc::clone(console.gateway()),
            dispatcher: console.dispatcher().clone(),
            runtime: console.runtime().clone(),
            config,
            live: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Sends one queued-work check, then schedules cycles. Does nothing if
    /// already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        // A fresh flag per run: cycles left over from an earlier run stay dead.
        let live = Arc::new(AtomicBool::new(true));
        self.live = Arc::clone(&live);

        let instances = Arc::clone(&self.instances);
        let tasks = Arc::clone(&self.tasks);
        let gateway = Arc::clone(&self.gateway);
        let dispatcher = self.dispatcher.clone();
        let period = self.config.interval;
        info!(interval_ms = period.as_millis() as u64, "poller started");

        self.handle = Some(self.runtime.spawn(async move {
            if let Err(err) = run_background(move || gateway.request_queued_work_check()).await {
                warn!(error = %err, "queued work check failed");
            }

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !live.load(Ordering::SeqCst) {
                    break;
                }
                run_cycle(&instances, &tasks, &dispatcher, &live).await;
            }
        }));
    }

    /// Cancels pending and future cycles. A cycle already in its background
    /// step finishes, but its foreground step is discarded.
    pub fn stop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_cycle(
    instances: &Arc<InstanceViewModel>,
    tasks: &Arc<TaskViewModel>,
    dispatcher: &Dispatcher<Console>,
    live: &Arc<AtomicBool>,
) {
    let instances = Arc::clone(instances);
    let tasks = Arc::clone(tasks);
    let background = run_background(move || {
        let mut failures: Vec<EngineError> = Vec::new();
        if let Err(err) = instances.refresh_with_current_filter() {
            failures.push(err);
        }
        if let Err(err) = tasks.refresh(true) {
            failures.push(err);
        }
        failures
    })
    .await;
    let failures = background.unwrap_or_else(|err| vec![err]);

    let live = Arc::clone(live);
    dispatcher.invoke_later(move |console: &mut Console| {
        if !live.load(Ordering::SeqCst) {
            debug!("dropping poll cycle that finished after stop");
            return;
        }
        console.finish_poll_cycle(failures);
    });
}
