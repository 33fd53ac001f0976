//! The supervisor: owns the [`Worker`], the name-keyed controller registry, and the health
//! watchdog. Mediates every start/stop/pause/resume request an embedder (the UI thread) makes.
//! Grounded on spec §4.5; the watchdog's periodic-check shape follows `roboplc::time::Interval`,
//! the same primitive [`crate::time`] already exposes.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bma_ts::Monotonic;
use parking_lot::Mutex;
use tracing::warn;

use crate::{
    action::InputBackend,
    controller::{BodyFactory, BodyResult, TaskCx, TaskController, TaskId, TaskName},
    hub::{Client, Hub, LogEvent},
    threaded::{ThreadCx, ThreadedController},
    time::Interval,
    variables::VariableStore,
    worker::{RunExit, Worker, WorkerOptions},
    Error, Result,
};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(200);
const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_WATCHDOG_STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Builder-style options for a [`TaskManager`].
pub struct ManagerOptions {
    worker_options: WorkerOptions,
    grace_period: Duration,
    watchdog_interval: Duration,
    watchdog_stall_threshold: Duration,
    input: Arc<dyn InputBackend>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            worker_options: WorkerOptions::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            watchdog_stall_threshold: DEFAULT_WATCHDOG_STALL_THRESHOLD,
            input: Arc::new(crate::action::NullBackend),
        }
    }
}

impl ManagerOptions {
    /// Default options: 200ms grace period, 2s watchdog tick, 5s stall threshold, no-op input.
    pub fn new() -> Self {
        Self::default()
    }
    /// Overrides the underlying worker's sleep-clamp tuning.
    pub fn worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }
    /// How long [`TaskManager::stop_worker`]/[`TaskManager::pause_worker`] wait for the worker
    /// thread to quiesce before reporting [`Error::WorkerUnresponsive`].
    pub fn grace_period(mut self, d: Duration) -> Self {
        self.grace_period = d;
        self
    }
    /// How often the watchdog checks the worker's heartbeat.
    pub fn watchdog_interval(mut self, d: Duration) -> Self {
        self.watchdog_interval = d;
        self
    }
    /// How stale a heartbeat must be before the watchdog logs and auto-pauses.
    pub fn watchdog_stall_threshold(mut self, d: Duration) -> Self {
        self.watchdog_stall_threshold = d;
        self
    }
    /// The [`InputBackend`] every registered task body is handed.
    pub fn input_backend(mut self, input: Arc<dyn InputBackend>) -> Self {
        self.input = input;
        self
    }
}

struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the worker instance, the name-keyed controller registry, and the watchdog. The single
/// entry point an embedding application uses to run task bodies.
pub struct TaskManager {
    options_grace_period: Duration,
    options_watchdog_interval: Duration,
    options_watchdog_stall_threshold: Duration,
    worker_options: WorkerOptions,
    worker: Mutex<Arc<Worker>>,
    variables: Arc<VariableStore>,
    log_hub: Hub<LogEvent>,
    input: Arc<dyn InputBackend>,
    next_cid: AtomicU64,
    controllers: Mutex<HashMap<Arc<str>, Arc<TaskController>>>,
    run_handle: Mutex<Option<JoinHandle<RunExit>>>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl TaskManager {
    /// Creates a manager with an idle worker and an empty registry.
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            options_grace_period: options.grace_period,
            options_watchdog_interval: options.watchdog_interval,
            options_watchdog_stall_threshold: options.watchdog_stall_threshold,
            worker_options: options.worker_options,
            worker: Mutex::new(Arc::new(Worker::new(options.worker_options))),
            variables: Arc::new(VariableStore::new()),
            log_hub: Hub::default(),
            input: options.input,
            next_cid: AtomicU64::new(1),
            controllers: Mutex::new(HashMap::new()),
            run_handle: Mutex::new(None),
            watchdog: Mutex::new(None),
        }
    }

    /// The shared variable store handed to every task body.
    pub fn variables(&self) -> Arc<VariableStore> {
        self.variables.clone()
    }

    /// Subscribes to the manager's log/crash event stream (spec §6.4).
    pub fn subscribe_logs(&self, name: &str) -> Result<Client<LogEvent>> {
        self.log_hub.subscribe(name)
    }

    /// Registers a cooperative-flavor task body, returning its controller. The name must be
    /// unique among currently registered tasks.
    pub fn register_cooperative<F>(
        &self,
        name: impl Into<Arc<str>>,
        loop_delay: Option<Duration>,
        factory: F,
    ) -> Result<Arc<TaskController>>
    where
        F: Fn(TaskCx) -> Pin<Box<dyn Future<Output = BodyResult> + Send>> + Send + Sync + 'static,
    {
        self.register(name, loop_delay, Arc::new(factory))
    }

    /// Registers a threaded-flavor task body: `body` runs on a dedicated OS thread every time the
    /// controller (re)starts. See [`crate::threaded`].
    pub fn register_threaded<F>(
        &self,
        name: impl Into<Arc<str>>,
        loop_delay: Option<Duration>,
        body: F,
    ) -> Result<Arc<TaskController>>
    where
        F: Fn(ThreadCx) -> BodyResult + Send + Sync + 'static,
    {
        self.register(name, loop_delay, ThreadedController::factory(body))
    }

    fn register(
        &self,
        name: impl Into<Arc<str>>,
        loop_delay: Option<Duration>,
        factory: Arc<BodyFactory>,
    ) -> Result<Arc<TaskController>> {
        let name: Arc<str> = name.into();
        let mut controllers = self.controllers.lock();
        if controllers.contains_key(&name) {
            return Err(Error::DuplicateTask(name.to_string()));
        }
        let cid = TaskId(self.next_cid.fetch_add(1, Ordering::SeqCst));
        let controller = Arc::new(TaskController::new(
            cid,
            TaskName::Named(name.clone()),
            loop_delay,
            self.variables.clone(),
            self.log_hub.clone(),
            self.input.clone(),
            factory,
        ));
        controllers.insert(name, controller.clone());
        Ok(controller)
    }

    /// Removes a task from the registry, stopping it first. Does not require the worker to be
    /// running.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let controller = self
            .controllers
            .lock()
            .remove(name)
            .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;
        controller.stop();
        Ok(())
    }

    /// Looks up a registered controller by name.
    pub fn get(&self, name: &str) -> Option<Arc<TaskController>> {
        self.controllers.lock().get(name).cloned()
    }

    /// Whether the worker currently considers itself alive (started and not stopped/finished).
    pub fn is_worker_alive(&self) -> bool {
        self.worker.lock().is_alive()
    }

    /// Whether the worker is currently globally paused.
    pub fn is_worker_paused(&self) -> bool {
        self.worker.lock().is_paused()
    }

    /// Reloads every enabled registered controller into the worker, starts the loop thread and
    /// the watchdog.
    pub fn start_worker(&self) {
        let enabled: Vec<Arc<TaskController>> = self.controllers.lock().values().cloned().collect();
        self.worker.lock().reload_controllers(enabled);
        self.spawn_run_thread();
        self.start_watchdog();
    }

    /// Stops the worker: clears its pause state, marks it not alive, and waits up to the grace
    /// period for the loop thread to notice. If it hasn't,
    /// [`Error::WorkerUnresponsive`] is returned and the thread is left running — call
    /// [`TaskManager::force_terminate_worker`] to abandon it outright.
    pub fn stop_worker(&self) -> Result<()> {
        self.stop_watchdog();
        self.worker.lock().stop();
        self.join_run_thread(self.options_grace_period)
    }

    /// Triggers the worker's global pause and waits up to the grace period for the loop thread to
    /// quiesce (spec: the loop exits the moment it observes the pause).
    pub fn pause_worker(&self, interrupt: bool) -> Result<()> {
        self.worker.lock().pause(interrupt);
        self.join_run_thread(self.options_grace_period)
    }

    /// Resumes a globally paused worker and restarts the loop thread and watchdog.
    pub fn resume_worker(&self) -> Result<()> {
        self.worker.lock().resume().ok_or(Error::WorkerNotAlive)?;
        self.spawn_run_thread();
        self.start_watchdog();
        Ok(())
    }

    /// Abandons a worker thread that refused to quiesce within the grace period (a task is
    /// blocking without yielding): detaches the stuck thread, builds a fresh [`Worker`], and
    /// rebinds every registered controller to it. The stuck thread's body keeps running to
    /// completion on its own; this manager simply stops waiting on it.
    pub fn force_terminate_worker(&self) {
        self.stop_watchdog();
        *self.run_handle.lock() = None;
        *self.worker.lock() = Arc::new(Worker::new(self.worker_options));
        warn!("worker thread forcibly abandoned: a task did not quiesce within the grace period");
    }

    fn spawn_run_thread(&self) {
        let worker = self.worker.lock().clone();
        let handle = thread::Builder::new()
            .name("macro-worker".into())
            .spawn(move || worker.run())
            .expect("failed to spawn worker thread");
        *self.run_handle.lock() = Some(handle);
    }

    fn join_run_thread(&self, grace_period: Duration) -> Result<()> {
        let Some(handle) = self.run_handle.lock().take() else {
            return Ok(());
        };
        let deadline = Monotonic::now() + grace_period;
        while !handle.is_finished() {
            if Monotonic::now() >= deadline {
                *self.run_handle.lock() = Some(handle);
                return Err(Error::WorkerUnresponsive);
            }
            thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
        Ok(())
    }

    fn start_watchdog(&self) {
        self.stop_watchdog();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = self.worker.lock().clone();
        let log_hub = self.log_hub.clone();
        let interval = self.options_watchdog_interval;
        let threshold = self.options_watchdog_stall_threshold;
        let stop_for_thread = stop.clone();
        let handle = thread::Builder::new()
            .name("macro-watchdog".into())
            .spawn(move || {
                let mut tick = Interval::new(interval);
                while !stop_for_thread.load(Ordering::Acquire) {
                    tick.tick();
                    if stop_for_thread.load(Ordering::Acquire) {
                        break;
                    }
                    if !worker.is_alive() || worker.is_paused() {
                        continue;
                    }
                    let stalled = Monotonic::now() - worker.last_heartbeat();
                    if stalled >= threshold {
                        warn!(?stalled, "worker heartbeat stalled, auto-pausing");
                        log_hub.send(LogEvent::Error(crate::hub::LogErrorPacket {
                            message: format!("worker heartbeat stalled for {stalled:?}, auto-pausing"),
                            traceback: None,
                            task_name: TaskName::Anonymous(0),
                        }));
                        worker.pause(false);
                    }
                }
            })
            .expect("failed to spawn watchdog thread");
        *self.watchdog.lock() = Some(Watchdog { stop, handle });
    }

    fn stop_watchdog(&self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.stop.store(true, Ordering::Release);
            let _ = watchdog.handle.join();
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop_watchdog();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::sleep;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_register_duplicate_name_errors() {
        let manager = TaskManager::new(ManagerOptions::new());
        manager
            .register_cooperative("a", None, |cx| {
                Box::pin(async move { sleep(&cx, Duration::from_millis(1)).await.map_err(Into::into) })
            })
            .unwrap();
        let dup = manager.register_cooperative("a", None, |cx| {
            Box::pin(async move { sleep(&cx, Duration::from_millis(1)).await.map_err(Into::into) })
        });
        assert!(dup.is_err());
    }

    #[test]
    fn test_start_stop_worker() {
        let manager = TaskManager::new(ManagerOptions::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        manager
            .register_cooperative("looper", None, move |cx| {
                let ran = ran2.clone();
                Box::pin(async move {
                    loop {
                        ran.fetch_add(1, Ordering::SeqCst);
                        sleep(&cx, Duration::from_millis(5)).await?;
                    }
                })
            })
            .unwrap();
        manager.start_worker();
        thread::sleep(Duration::from_millis(30));
        manager.stop_worker().expect("worker should quiesce within grace period");
        assert!(ran.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_unregister_stops_task() {
        let manager = TaskManager::new(ManagerOptions::new());
        let controller = manager
            .register_cooperative("once", None, |cx| {
                Box::pin(async move { sleep(&cx, Duration::from_millis(1)).await.map_err(Into::into) })
            })
            .unwrap();
        manager.unregister("once").unwrap();
        assert_eq!(controller.state(), crate::controller::TaskState::Stopped);
        assert!(manager.get("once").is_none());
    }

    // The following exercise the named scenarios end-to-end against a real worker thread, with
    // generous tolerances since they run on real wall-clock time, not a virtual clock.

    fn packet_text(event: &LogEvent) -> String {
        match event {
            LogEvent::Packet(p) => p.parts.join(""),
            LogEvent::Error(e) => e.message.clone(),
        }
    }

    fn drain_for(client: &Client<LogEvent>, window: Duration) -> Vec<LogEvent> {
        let deadline = std::time::Instant::now() + window;
        let mut out = Vec::new();
        while std::time::Instant::now() < deadline {
            if let Ok(event) = client.try_recv() {
                out.push(event);
            } else {
                thread::sleep(Duration::from_millis(2));
            }
        }
        out
    }

    /// S1: two-task ping-pong — expects log marker order A1, B1, B2, A2.
    #[test]
    fn test_scenario_ping_pong() {
        let manager = TaskManager::new(ManagerOptions::new());
        let client = manager.subscribe_logs("observer").unwrap();
        manager
            .register_cooperative("a", None, |cx| {
                Box::pin(async move {
                    cx.log(crate::hub::LogLevel::Info, vec!["A1".into()]);
                    sleep(&cx, Duration::from_millis(100)).await?;
                    cx.log(crate::hub::LogLevel::Info, vec!["A2".into()]);
                    Ok(())
                })
            })
            .unwrap();
        manager
            .register_cooperative("b", None, |cx| {
                Box::pin(async move {
                    cx.log(crate::hub::LogLevel::Info, vec!["B1".into()]);
                    sleep(&cx, Duration::from_millis(50)).await?;
                    cx.log(crate::hub::LogLevel::Info, vec!["B2".into()]);
                    Ok(())
                })
            })
            .unwrap();
        manager.start_worker();
        let markers: Vec<String> = drain_for(&client, Duration::from_millis(200))
            .iter()
            .map(packet_text)
            .collect();
        manager.stop_worker().unwrap();
        assert_eq!(markers, vec!["A1", "B1", "B2", "A2"]);
    }

    /// S2: a global hard interrupt releases a held key; `log("done")` is not observed until resume.
    #[test]
    fn test_scenario_interrupt_releases_held_key() {
        struct CountingBackend {
            downs: Arc<AtomicUsize>,
            ups: Arc<AtomicUsize>,
        }
        impl InputBackend for CountingBackend {
            fn key_down(&self, _key: &str) {
                self.downs.fetch_add(1, Ordering::SeqCst);
            }
            fn key_up(&self, _key: &str) {
                self.ups.fetch_add(1, Ordering::SeqCst);
            }
            fn mouse_down(&self, _p: Option<(i32, i32)>, _b: crate::action::MouseButton) {}
            fn mouse_up(&self, _p: Option<(i32, i32)>, _b: crate::action::MouseButton) {}
        }
        let downs = Arc::new(AtomicUsize::new(0));
        let ups = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(CountingBackend {
            downs: downs.clone(),
            ups: ups.clone(),
        });
        let manager = TaskManager::new(ManagerOptions::new().input_backend(backend));
        let client = manager.subscribe_logs("observer").unwrap();
        manager
            .register_cooperative("holder", None, |cx| {
                Box::pin(async move {
                    crate::action::hold_key(&cx, "w", Duration::from_secs(10)).await?;
                    cx.log(crate::hub::LogLevel::Info, vec!["done".into()]);
                    Ok(())
                })
            })
            .unwrap();
        manager.start_worker();
        while downs.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        manager.pause_worker(true).expect("worker should quiesce");
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert_eq!(ups.load(Ordering::SeqCst), 1, "the key must be released by the interrupt");
        assert!(drain_for(&client, Duration::from_millis(20))
            .iter()
            .map(packet_text)
            .all(|m| m != "done"));
        manager.resume_worker().unwrap();
        let markers: Vec<String> = drain_for(&client, Duration::from_millis(100))
            .iter()
            .map(packet_text)
            .collect();
        manager.stop_worker().unwrap();
        assert!(markers.contains(&"done".to_string()));
        assert_eq!(downs.load(Ordering::SeqCst), 1, "only one press for the whole run");
        assert_eq!(ups.load(Ordering::SeqCst), 1, "only one release for the whole run");
    }

    /// S3: a global soft pause preserves the remaining sleep time across the pause window.
    #[test]
    fn test_scenario_soft_pause_preserves_remaining_time() {
        let manager = TaskManager::new(ManagerOptions::new());
        let client = manager.subscribe_logs("observer").unwrap();
        let start = std::time::Instant::now();
        manager
            .register_cooperative("sleeper", None, |cx| {
                Box::pin(async move {
                    sleep(&cx, Duration::from_millis(100)).await?;
                    cx.log(crate::hub::LogLevel::Info, vec!["end".into()]);
                    Ok(())
                })
            })
            .unwrap();
        manager.start_worker();
        thread::sleep(Duration::from_millis(30));
        manager.pause_worker(false).expect("worker should quiesce");
        thread::sleep(Duration::from_millis(60));
        manager.resume_worker().unwrap();
        let markers = drain_for(&client, Duration::from_millis(250));
        let elapsed = start.elapsed();
        manager.stop_worker().unwrap();
        assert!(markers.iter().map(packet_text).any(|m| m == "end"));
        // expected ≈ 90 + (100 - 30) = 160ms; generous bounds for scheduler jitter.
        assert!(elapsed >= Duration::from_millis(130), "elapsed too short: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(260), "elapsed too long: {elapsed:?}");
    }

    /// S4: a global hard interrupt discards the remaining sleep time entirely.
    #[test]
    fn test_scenario_interrupt_discards_remaining_time() {
        let manager = TaskManager::new(ManagerOptions::new());
        let client = manager.subscribe_logs("observer").unwrap();
        let start = std::time::Instant::now();
        manager
            .register_cooperative("sleeper", None, |cx| {
                Box::pin(async move {
                    match sleep(&cx, Duration::from_millis(100)).await {
                        Ok(()) => {}
                        Err(crate::controller::TaskError::Interrupted) => {
                            crate::action::wait_for_resume(&cx).await?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    cx.log(crate::hub::LogLevel::Info, vec!["end".into()]);
                    Ok(())
                })
            })
            .unwrap();
        manager.start_worker();
        thread::sleep(Duration::from_millis(30));
        manager.pause_worker(true).expect("worker should quiesce");
        thread::sleep(Duration::from_millis(60));
        manager.resume_worker().unwrap();
        let markers = drain_for(&client, Duration::from_millis(150));
        let elapsed = start.elapsed();
        manager.stop_worker().unwrap();
        assert!(markers.iter().map(packet_text).any(|m| m == "end"));
        // expected ≈ 90ms (the remaining 70ms is discarded), not ≈ 160ms as in S3.
        assert!(elapsed <= Duration::from_millis(200), "remaining sleep was not discarded: {elapsed:?}");
    }

    /// S5: a crash in one task does not affect another; the crash is reported as an ERROR over the
    /// hub and the healthy task still completes.
    #[test]
    fn test_scenario_crash_isolation() {
        let manager = TaskManager::new(ManagerOptions::new());
        let client = manager.subscribe_logs("observer").unwrap();
        manager
            .register_cooperative("doomed", None, |_cx| {
                Box::pin(async move { Err(Error::failed("boom").into()) })
            })
            .unwrap();
        manager
            .register_cooperative("healthy", None, |cx| {
                Box::pin(async move {
                    sleep(&cx, Duration::from_millis(50)).await?;
                    cx.log(crate::hub::LogLevel::Info, vec!["ok".into()]);
                    Ok(())
                })
            })
            .unwrap();
        manager.start_worker();
        let events = drain_for(&client, Duration::from_millis(150));
        manager.stop_worker().unwrap();
        let errors: Vec<&LogEvent> = events.iter().filter(|e| matches!(e, LogEvent::Error(_))).collect();
        assert_eq!(errors.len(), 1);
        assert!(packet_text(errors[0]).contains("boom"));
        assert!(events.iter().map(packet_text).any(|m| m == "ok"));
        let doomed = manager.get("doomed").unwrap();
        assert_eq!(doomed.state(), crate::controller::TaskState::Crashed);
    }

    /// S6: a cooperative task that blocks the worker thread outright (never yielding) trips the
    /// watchdog, which soft-pauses the worker once the task finally returns control.
    #[test]
    fn test_scenario_deadlock_watchdog() {
        let manager = TaskManager::new(
            ManagerOptions::new()
                .watchdog_interval(Duration::from_millis(10))
                .watchdog_stall_threshold(Duration::from_millis(50)),
        );
        let client = manager.subscribe_logs("observer").unwrap();
        manager
            .register_cooperative("blocker", None, |_cx| {
                Box::pin(async move {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
            })
            .unwrap();
        manager.start_worker();
        thread::sleep(Duration::from_millis(500));
        let events = drain_for(&client, Duration::from_millis(10));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, LogEvent::Error(_)) && packet_text(e).contains("stalled")),
            "expected a watchdog stall report"
        );
        assert!(manager.is_worker_paused(), "worker should have been auto-paused");
        manager.force_terminate_worker();
    }
}
