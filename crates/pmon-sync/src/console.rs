use crate::foreground::{run_background, Dispatcher};
use crate::{
    EngineError, InstanceViewModel, Lamp, ModelEvent, RefreshOutcome, SelectionCoordinator,
    SharedFilter, StatusIndicator, TaskViewModel,
};
use pmon_core::{Gateway, InstanceFilter, InstanceId, Task};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 64;

/// What one foreground commit step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub instances_changed: bool,
    pub tasks_changed: bool,
    pub selection_dropped: bool,
    pub task_selection_restored: bool,
    pub lamp: Lamp,
}

/// Foreground-owned console state.
///
/// Lives on the single foreground consumer: every method taking `&mut self`
/// must run there, either directly or as a job dispatched through the
/// console's [`Dispatcher`]. Background steps only ever touch the view
/// models' fetch side.
pub struct Console {
    gateway: Arc<dyn Gateway>,
    instances: Arc<InstanceViewModel>,
    tasks: Arc<TaskViewModel>,
    selection: SelectionCoordinator,
    indicator: StatusIndicator,
    lamp: Option<Lamp>,
    last_error: Option<String>,
    cycles_applied: u64,
    dispatcher: Dispatcher<Console>,
    runtime: Handle,
    events: broadcast::Sender<ModelEvent>,
}

impl Console {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        filter: SharedFilter,
        dispatcher: Dispatcher<Console>,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let instances = Arc::new(InstanceViewModel::new(
            Arc::clone(&gateway),
            filter,
            events.clone(),
        ));
        let tasks = Arc::new(TaskViewModel::new(Arc::clone(&gateway), events.clone()));
        let selection = SelectionCoordinator::new(Arc::clone(&instances), Arc::clone(&tasks));
        Self {
            gateway,
            instances,
            tasks,
            selection,
            indicator: StatusIndicator::new(),
            lamp: None,
            last_error: None,
            cycles_applied: 0,
            dispatcher,
            runtime,
            events,
        }
    }

    /// Foreground half of a poll cycle: commit both models, reconcile the
    /// selection, then update the lamp.
    pub fn apply_poll_cycle(&mut self) -> Result<CycleReport, EngineError> {
        let instances_changed = self.instances.commit();
        let tasks_changed = self.tasks.commit();
        let selection_dropped = self.selection.after_instances_commit();
        let task_selection_restored = self
            .selection
            .after_tasks_commit(tasks_changed || selection_dropped);
        self.cycles_applied += 1;

        let lamp = self
            .indicator
            .update(&self.instances.state_of_newest_instance())?;
        if lamp.request_queued_work_check {
            self.request_queued_work_check();
        }
        self.lamp = Some(lamp);

        Ok(CycleReport {
            instances_changed,
            tasks_changed,
            selection_dropped,
            task_selection_restored,
            lamp,
        })
    }

    /// Runs a poll cycle's foreground step; failures from either step are
    /// logged and kept as the last error, never returned.
    pub(crate) fn finish_poll_cycle(&mut self, background_failures: Vec<EngineError>) {
        for err in background_failures {
            self.record_error("poll refresh failed", &err);
        }
        match self.apply_poll_cycle() {
            Ok(report) => debug!(
                instances_changed = report.instances_changed,
                tasks_changed = report.tasks_changed,
                selection_dropped = report.selection_dropped,
                lamp = %report.lamp.color,
                "poll cycle applied"
            ),
            Err(err) => self.record_error("poll cycle failed", &err),
        }
    }

    /// Operator selected an instance row. Returns whether it is genuinely
    /// new; the task refresh that follows runs in the background and commits
    /// through the foreground queue.
    pub fn select_instance(&mut self, instance_id: InstanceId) -> Result<bool, EngineError> {
        let genuinely_new = self.selection.select_instance(instance_id)?;
        let tasks = Arc::clone(&self.tasks);
        let dispatcher = self.dispatcher.clone();
        self.runtime.spawn(async move {
            let result = run_background(move || tasks.refresh(false))
                .await
                .and_then(|outcome| outcome);
            if !dispatcher.invoke_later(move |console: &mut Console| {
                console.finish_task_refresh(result);
            }) {
                debug!("foreground queue closed; task refresh result dropped");
            }
        });
        Ok(genuinely_new)
    }

    fn finish_task_refresh(&mut self, result: Result<RefreshOutcome, EngineError>) {
        match result {
            Ok(outcome) => {
                debug!(?outcome, "task refresh finished");
                let changed = self.tasks.commit();
                self.selection.after_tasks_commit(changed);
            }
            Err(err) => self.record_error("task refresh failed", &err),
        }
    }

    /// Manual instance refresh. Gateway failures propagate to the caller;
    /// on success the commit is dispatched to the foreground.
    pub fn refresh_instances_now(
        &self,
    ) -> impl Future<Output = Result<(), EngineError>> + Send + 'static {
        let instances = Arc::clone(&self.instances);
        let dispatcher = self.dispatcher.clone();
        async move {
            run_background(move || instances.refresh_with_current_filter()).await??;
            dispatcher.invoke_later(|console: &mut Console| console.finish_instance_refresh());
            Ok::<(), EngineError>(())
        }
    }

    fn finish_instance_refresh(&mut self) {
        if !self.instances.commit() {
            return;
        }
        if self.selection.after_instances_commit() {
            self.selection.after_tasks_commit(true);
        }
    }

    /// Manual forced reload of the selected instance's tasks.
    pub fn refresh_tasks_now(
        &self,
    ) -> impl Future<Output = Result<(), EngineError>> + Send + 'static {
        let tasks = Arc::clone(&self.tasks);
        let dispatcher = self.dispatcher.clone();
        async move {
            let outcome = run_background(move || tasks.refresh(true)).await??;
            dispatcher.invoke_later(move |console: &mut Console| {
                console.finish_task_refresh(Ok(outcome));
            });
            Ok::<(), EngineError>(())
        }
    }

    pub fn select_task_rows(&mut self, rows: &[usize]) {
        self.selection.select_task_rows(rows);
    }

    pub fn clear_task_selection(&mut self) {
        self.selection.clear_task_selection();
    }

    /// Reply to a queued-work check: whether the service has work waiting.
    pub fn note_queued_work(&mut self, queued: bool) {
        self.indicator.note_queued_work(queued);
    }

    pub fn set_filter(&self, filter: InstanceFilter) {
        self.instances.set_filter(filter);
    }

    fn request_queued_work_check(&self) {
        let gateway = Arc::clone(&self.gateway);
        self.runtime
            .spawn_blocking(move || gateway.request_queued_work_check());
    }

    fn record_error(&mut self, context: &str, err: &EngineError) {
        warn!(error = %err, "{context}");
        self.last_error = Some(format!("{context}: {err}"));
    }

    pub fn instances(&self) -> &Arc<InstanceViewModel> {
        &self.instances
    }

    pub fn tasks(&self) -> &Arc<TaskViewModel> {
        &self.tasks
    }

    pub fn selection(&self) -> &SelectionCoordinator {
        &self.selection
    }

    pub fn selected_tasks(&self) -> Vec<Task> {
        self.selection.selected_tasks()
    }

    pub fn lamp(&self) -> Option<Lamp> {
        self.lamp
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cycles_applied(&self) -> u64 {
        self.cycles_applied
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    pub(crate) fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher<Console> {
        &self.dispatcher
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{foreground_queue, ForegroundQueue, LampColor};
    use chrono::Utc;
    use pmon_core::{
        GatewayError, Instance, InstanceState, MemoryGateway, TaskAttributes, TaskId, TaskState,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    fn instance(id: i64, state: InstanceState) -> Instance {
        Instance {
            id: InstanceId(id),
            state,
            name: format!("run-{id}"),
            pipeline_name: "sector".to_string(),
            created: Utc::now(),
            started: None,
            ended: None,
        }
    }

    fn console(gateway: &Arc<MemoryGateway>) -> (Console, ForegroundQueue<Console>) {
        let (dispatcher, queue) = foreground_queue();
        let gateway: Arc<dyn Gateway> = gateway.clone();
        let console = Console::new(gateway, SharedFilter::default(), dispatcher, Handle::current());
        (console, queue)
    }

    async fn drain_one(queue: &mut ForegroundQueue<Console>, console: &mut Console) {
        let ran = tokio::time::timeout(Duration::from_secs(5), queue.run_one(console))
            .await
            .expect("foreground job arrives");
        assert!(ran);
    }

    #[tokio::test]
    async fn manual_refresh_commits_on_the_foreground() {
        let gateway = Arc::new(MemoryGateway::with_instances(vec![instance(
            1,
            InstanceState::Processing,
        )]));
        let (mut console, mut queue) = console(&gateway);
        let mut events = console.subscribe();

        console.refresh_instances_now().await.expect("refresh");
        assert!(console.instances().is_empty());

        drain_one(&mut queue, &mut console).await;
        assert_eq!(console.instances().len(), 1);
        assert_eq!(events.try_recv().ok(), Some(ModelEvent::InstancesChanged));
    }

    #[tokio::test]
    async fn manual_refresh_propagates_unavailable_gateway() {
        let gateway = Arc::new(MemoryGateway::new());
        let (mut console, mut queue) = console(&gateway);
        gateway.fail_next(GatewayError::Unavailable("down".to_string()));

        let err = console
            .refresh_instances_now()
            .await
            .expect_err("manual refresh surfaces failures");
        assert!(matches!(err, EngineError::Gateway(GatewayError::Unavailable(_))));
        assert_eq!(queue.run_pending(&mut console), 0);
    }

    fn task(id: i64, instance: i64) -> Task {
        Task {
            id: TaskId(id),
            instance_id: InstanceId(instance),
            state: TaskState::Processing,
            module_name: "cal".to_string(),
        }
    }

    #[tokio::test]
    async fn manual_task_refresh_always_fetches_and_commits_on_the_foreground() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.set_tasks(InstanceId(3), vec![task(31, 3)]);
        let (mut console, mut queue) = console(&gateway);
        let mut events = console.subscribe();
        console.tasks().set_instance(Some(InstanceId(3)));

        console.refresh_tasks_now().await.expect("refresh");
        assert!(console.tasks().is_empty());
        drain_one(&mut queue, &mut console).await;
        assert_eq!(console.tasks().len(), 1);
        assert_eq!(events.try_recv().ok(), Some(ModelEvent::TasksChanged));

        gateway.set_tasks(InstanceId(3), vec![task(31, 3), task(32, 3)]);
        console.refresh_tasks_now().await.expect("refresh");
        drain_one(&mut queue, &mut console).await;
        assert_eq!(gateway.calls().list_tasks, 2);
        assert_eq!(console.tasks().len(), 2);
    }

    #[tokio::test]
    async fn manual_task_refresh_propagates_unavailable_gateway() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.set_tasks(InstanceId(3), vec![task(31, 3)]);
        let (mut console, mut queue) = console(&gateway);
        console.tasks().set_instance(Some(InstanceId(3)));
        console.refresh_tasks_now().await.expect("refresh");
        drain_one(&mut queue, &mut console).await;

        gateway.fail_next(GatewayError::Unavailable("down".to_string()));
        let err = console
            .refresh_tasks_now()
            .await
            .expect_err("manual refresh surfaces failures");
        assert!(matches!(err, EngineError::Gateway(GatewayError::Unavailable(_))));
        assert_eq!(queue.run_pending(&mut console), 0);
        assert_eq!(console.tasks().len(), 1);
    }

    /// Holds every instance and task query until the test releases it, and
    /// records whether two queries were ever inside the gateway at once.
    struct GatedGateway {
        inner: MemoryGateway,
        entered: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
        active: AtomicUsize,
        overlapped: AtomicBool,
    }

    impl GatedGateway {
        fn new(inner: MemoryGateway) -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered, entered_rx) = mpsc::channel();
            let (release_tx, release) = mpsc::channel();
            let gateway = Arc::new(Self {
                inner,
                entered,
                release: Mutex::new(release),
                active: AtomicUsize::new(0),
                overlapped: AtomicBool::new(false),
            });
            (gateway, entered_rx, release_tx)
        }

        fn hold<T>(&self, query: impl FnOnce() -> T) -> T {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let _ = self.entered.send(());
            let _ = crate::lock(&self.release).recv_timeout(Duration::from_secs(5));
            let result = query();
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl Gateway for GatedGateway {
        fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, GatewayError> {
            self.hold(|| self.inner.list_instances(filter))
        }

        fn list_tasks(&self, instance_id: InstanceId) -> Result<Vec<Task>, GatewayError> {
            self.hold(|| self.inner.list_tasks(instance_id))
        }

        fn list_processing_attributes(
            &self,
            instance_id: InstanceId,
        ) -> Result<TaskAttributes, GatewayError> {
            self.inner.list_processing_attributes(instance_id)
        }

        fn request_queued_work_check(&self) {
            self.inner.request_queued_work_check();
        }
    }

    fn gated_console(gateway: &Arc<GatedGateway>) -> (Console, ForegroundQueue<Console>) {
        let (dispatcher, queue) = foreground_queue();
        let gateway: Arc<dyn Gateway> = gateway.clone();
        let console = Console::new(gateway, SharedFilter::default(), dispatcher, Handle::current());
        (console, queue)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manual_instance_refresh_waits_for_running_cycle() {
        let (gateway, entered, release) =
            GatedGateway::new(MemoryGateway::with_instances(vec![instance(
                1,
                InstanceState::Processing,
            )]));
        let (mut console, mut queue) = gated_console(&gateway);

        let instances = Arc::clone(console.instances());
        let automatic =
            tokio::task::spawn_blocking(move || instances.refresh_with_current_filter());
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("automatic refresh reaches the gateway");

        let manual = tokio::spawn(console.refresh_instances_now());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(entered.try_recv().is_err());

        release.send(()).expect("release automatic");
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("manual refresh reaches the gateway");
        gateway.inner.set_instances(vec![
            instance(1, InstanceState::Completed),
            instance(2, InstanceState::Processing),
        ]);
        release.send(()).expect("release manual");

        automatic.await.expect("join").expect("automatic refresh");
        manual.await.expect("join").expect("manual refresh");
        assert!(!gateway.overlapped.load(Ordering::SeqCst));

        drain_one(&mut queue, &mut console).await;
        assert_eq!(console.instances().len(), 2);
        assert_eq!(
            console.instances().state_of_newest_instance(),
            InstanceState::Processing
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manual_task_refresh_waits_for_running_cycle() {
        let inner = MemoryGateway::new();
        inner.set_tasks(InstanceId(3), vec![task(31, 3)]);
        let (gateway, entered, release) = GatedGateway::new(inner);
        let (mut console, mut queue) = gated_console(&gateway);
        console.tasks().set_instance(Some(InstanceId(3)));

        let tasks = Arc::clone(console.tasks());
        let automatic = tokio::task::spawn_blocking(move || tasks.refresh(true));
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("automatic refresh reaches the gateway");

        let manual = tokio::spawn(console.refresh_tasks_now());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(entered.try_recv().is_err());

        release.send(()).expect("release automatic");
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("manual refresh reaches the gateway");
        gateway
            .inner
            .set_tasks(InstanceId(3), vec![task(31, 3), task(32, 3)]);
        release.send(()).expect("release manual");

        automatic.await.expect("join").expect("automatic refresh");
        manual.await.expect("join").expect("manual refresh");
        assert!(!gateway.overlapped.load(Ordering::SeqCst));
        assert_eq!(gateway.inner.calls().list_tasks, 2);

        drain_one(&mut queue, &mut console).await;
        let rows: Vec<TaskId> = console
            .tasks()
            .published_snapshot()
            .tasks
            .iter()
            .map(|task| task.id)
            .collect();
        assert_eq!(rows, vec![TaskId(31), TaskId(32)]);
    }

    #[tokio::test]
    async fn selecting_an_instance_loads_its_tasks() {
        let gateway = Arc::new(MemoryGateway::with_instances(vec![instance(
            3,
            InstanceState::Processing,
        )]));
        gateway.set_tasks(
            InstanceId(3),
            vec![Task {
                id: TaskId(31),
                instance_id: InstanceId(3),
                state: TaskState::Submitted,
                module_name: "dv".to_string(),
            }],
        );
        let (mut console, mut queue) = console(&gateway);
        console.refresh_instances_now().await.expect("refresh");
        drain_one(&mut queue, &mut console).await;

        assert!(console.select_instance(InstanceId(3)).expect("select"));
        drain_one(&mut queue, &mut console).await;
        assert_eq!(console.tasks().len(), 1);

        console.select_task_rows(&[0]);
        assert_eq!(console.selected_tasks()[0].id, TaskId(31));
    }

    #[tokio::test]
    async fn poll_cycle_failure_is_recorded_not_raised() {
        let gateway = Arc::new(MemoryGateway::with_instances(vec![instance(
            2,
            InstanceState::Unrecognized("PAUSED".to_string()),
        )]));
        let (mut console, _queue) = console(&gateway);
        console
            .instances()
            .refresh_with_current_filter()
            .expect("refresh");

        console.finish_poll_cycle(Vec::new());
        assert_eq!(console.cycles_applied(), 1);
        assert!(console.lamp().is_none());
        assert!(console
            .last_error()
            .is_some_and(|message| message.contains("PAUSED")));
    }

    #[tokio::test]
    async fn quiet_system_requests_one_queued_work_check() {
        let gateway = Arc::new(MemoryGateway::with_instances(vec![instance(
            1,
            InstanceState::Completed,
        )]));
        let (mut console, _queue) = console(&gateway);

        let first = console.apply_poll_cycle().expect("cycle");
        assert_eq!(first.lamp.color, LampColor::Gray);
        assert!(first.lamp.request_queued_work_check);
        let second = console.apply_poll_cycle().expect("cycle");
        assert!(!second.lamp.request_queued_work_check);

        for _ in 0..50 {
            if gateway.calls().queued_work_checks == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gateway.calls().queued_work_checks, 1);
    }
}
