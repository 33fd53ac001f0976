//! The "threaded" task body flavor: a user routine that runs on its own dedicated OS thread
//! instead of yielding cooperatively on the worker. Grounded on spec §4.3, whose own wording
//! ("the worker-facing side of a threaded controller is itself a generator... exposes the same
//! outward state machine as [`crate::controller::TaskController`]") is taken literally here: there
//! is no separate threaded state machine. [`ThreadedController::factory`] produces a body
//! *factory* — the same `BodyFactory` shape a cooperative task uses — whose future is a thin
//! bridge that spawns the real OS thread and polls its liveness. [`Worker`](crate::worker::Worker)
//! therefore only ever has to drive `Arc<TaskController>`, regardless of flavor.
//!
//! The bridge and the spawned thread share the controller's `interrupted`/`aborted` flags (via the
//! same [`TaskCx`] clone each is handed), so a `pause(interrupt)`/`stop()` call is visible to the
//! thread without any extra plumbing: the thread observes them the next time it calls
//! [`ThreadCx::sleep`] or [`ThreadCx::wait_for_resume`].

use std::{
    future::Future,
    pin::Pin,
    sync::{
        mpsc::{self, TryRecvError},
        Arc,
    },
    task::{Context as PollContext, Poll},
    thread,
    time::Duration,
};

use bma_ts::Monotonic;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{
    action::{InputBackend, MouseButton},
    controller::{BodyError, BodyResult, Step, TaskCx, TaskError, TaskId, TaskName},
};

/// How often the bridge re-checks the thread's result channel while it hasn't finished. Bounds
/// how stale the worker's view of a threaded task's liveness can be.
const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Below this remaining duration, [`ThreadCx::sleep`] spins instead of calling `thread::sleep`,
/// trading a little CPU for the precision `thread::sleep`'s OS-scheduler slop can't guarantee.
const SPIN_TAIL: Duration = Duration::from_millis(2);

#[derive(thiserror::Error, Debug)]
#[error("threaded task body panicked")]
struct ThreadPanicked;

/// The open/closed gate a threaded body's blocking primitives wait on while the controller is
/// `PAUSED_LIKE`. Closed by [`crate::controller::TaskController::pause`]/`pause_with_origin`,
/// opened by `resume`/`stop`/`restart`. Same Condvar+Mutex shape as
/// `roboplc::semaphore::Semaphore`, narrowed from a counting permit to a single gate.
#[derive(Debug)]
pub struct ResumeGate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Default for ResumeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumeGate {
    /// Creates a gate that starts open.
    pub fn new() -> Self {
        Self {
            open: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    /// Opens the gate, waking every thread blocked in [`ResumeGate::wait_while_closed`].
    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cv.notify_all();
    }

    /// Closes the gate. Threads already blocked stay blocked; new waiters block too.
    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// Blocks until the gate is open.
    pub fn wait_while_closed(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    /// Whether the gate is currently closed, without blocking.
    pub fn is_closed(&self) -> bool {
        !*self.open.lock()
    }
}

/// The handle a threaded body runs with, on its own OS thread. The blocking counterpart of
/// [`TaskCx`]/the `crate::action` futures: same suspension-point contract (interrupt/abort
/// observed at `sleep`/`wait_for_resume`, same RAII key/mouse guards), expressed without `.await`
/// since the body does not run on the worker.
pub struct ThreadCx {
    cx: TaskCx,
}

impl ThreadCx {
    fn new(cx: TaskCx) -> Self {
        Self { cx }
    }

    /// The task's stable id.
    pub fn id(&self) -> TaskId {
        self.cx.id()
    }
    /// The task's name.
    pub fn name(&self) -> &TaskName {
        self.cx.name()
    }
    /// Reads a variable's current value, if registered.
    pub fn get_var(&self, key: &str) -> Option<crate::variables::VariableValue> {
        self.cx.get_var(key)
    }
    /// Emits an informational/warning/error log packet tagged with this task's name.
    pub fn log(&self, level: crate::hub::LogLevel, parts: Vec<String>) {
        self.cx.log(level, parts);
    }
    /// Emits an error log packet with an optional traceback/backtrace string.
    pub fn log_error(&self, message: impl Into<String>, trace: Option<String>) {
        self.cx.log_error(message, trace);
    }
    /// Is the controller mid-interrupt right now.
    pub fn is_interrupted(&self) -> bool {
        self.cx.is_interrupted()
    }
    /// Has the controller been stopped outright.
    pub fn is_aborted(&self) -> bool {
        self.cx.is_aborted()
    }

    fn check(&self) -> Result<(), TaskError> {
        if self.cx.is_aborted() {
            return Err(TaskError::Aborted);
        }
        if self.cx.is_interrupted() {
            return Err(TaskError::Interrupted);
        }
        Ok(())
    }

    /// Blocks for `duration`, in chunks, checking the shared interrupt/abort flags between chunks
    /// so a signal is observed within one [`POLL_INTERVAL`]-ish slice rather than only at the end.
    /// The final [`SPIN_TAIL`] is spun rather than slept, since `thread::sleep`'s wakeup slop would
    /// otherwise dominate the error for short durations.
    ///
    /// While a *soft* pause has the resume gate closed (and the controller is neither interrupted
    /// nor aborted), this freezes in place on [`ResumeGate::wait_while_closed`] rather than
    /// continuing to count down, preserving the remaining duration across the pause — matching
    /// the original's `threaded_controller.py` freezing while `not self._resume_event.is_set()`.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        self.check()?;
        let mut deadline = Monotonic::now() + duration;
        loop {
            if self.cx.resume_gate.is_closed() && !self.cx.is_interrupted() && !self.cx.is_aborted() {
                let frozen_at = Monotonic::now();
                self.cx.resume_gate.wait_while_closed();
                deadline = deadline + (Monotonic::now() - frozen_at);
                continue;
            }
            self.check()?;
            let now = Monotonic::now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = deadline - now;
            if remaining <= SPIN_TAIL {
                while Monotonic::now() < deadline {
                    self.check()?;
                    if self.cx.resume_gate.is_closed() && !self.cx.is_interrupted() && !self.cx.is_aborted() {
                        break;
                    }
                    std::hint::spin_loop();
                }
                if Monotonic::now() >= deadline {
                    return Ok(());
                }
                continue;
            }
            thread::sleep(remaining.min(POLL_INTERVAL));
            self.check()?;
        }
    }

    /// Blocks until the controller's shared resume gate opens (i.e. until `resume()`/`stop()` is
    /// called), or returns immediately if the controller is already stopped outright.
    pub fn wait_for_resume(&self) -> Result<(), TaskError> {
        if self.cx.is_aborted() {
            return Err(TaskError::Aborted);
        }
        self.cx.resume_gate.wait_while_closed();
        if self.cx.is_aborted() {
            return Err(TaskError::Aborted);
        }
        Ok(())
    }

    /// Presses `key`, blocks for `duration`, releases on every exit path, waiting for resume after
    /// an interrupt — the blocking counterpart of [`crate::action::hold_key`].
    pub fn hold_key(&self, key: impl Into<String>, duration: Duration) -> Result<(), TaskError> {
        let guard = BlockingKeyGuard::new(self.cx.input.clone(), key.into());
        match self.sleep(duration) {
            Ok(()) => {
                drop(guard);
                Ok(())
            }
            Err(TaskError::Interrupted) => {
                drop(guard);
                self.wait_for_resume()
            }
            Err(e) => {
                drop(guard);
                Err(e)
            }
        }
    }

    /// Clicks the mouse at `point` (or the current cursor position if `None`) — the blocking
    /// counterpart of [`crate::action::mouse_click`].
    pub fn mouse_click(&self, point: Option<(i32, i32)>, button: MouseButton) -> Result<(), TaskError> {
        let guard = BlockingMouseGuard::new(self.cx.input.clone(), point, button);
        match self.sleep(Duration::from_millis(50)) {
            Ok(()) => {
                drop(guard);
                Ok(())
            }
            Err(TaskError::Interrupted) => {
                drop(guard);
                self.wait_for_resume()
            }
            Err(e) => {
                drop(guard);
                Err(e)
            }
        }
    }
}

struct BlockingKeyGuard {
    input: Arc<dyn InputBackend>,
    key: String,
}

impl BlockingKeyGuard {
    fn new(input: Arc<dyn InputBackend>, key: String) -> Self {
        input.key_down(&key);
        Self { input, key }
    }
}

impl Drop for BlockingKeyGuard {
    fn drop(&mut self) {
        self.input.key_up(&self.key);
    }
}

struct BlockingMouseGuard {
    input: Arc<dyn InputBackend>,
    point: Option<(i32, i32)>,
    button: MouseButton,
}

impl BlockingMouseGuard {
    fn new(input: Arc<dyn InputBackend>, point: Option<(i32, i32)>, button: MouseButton) -> Self {
        input.mouse_down(point, button);
        Self { input, point, button }
    }
}

impl Drop for BlockingMouseGuard {
    fn drop(&mut self) {
        self.input.mouse_up(self.point, self.button);
    }
}

/// The bridge future the worker actually drives: not the task's own logic, only a liveness proxy
/// for the OS thread running it. On every poll: if the channel has a result, the thread is joined
/// and the result is returned; otherwise the bridge reports back to the controller. While an
/// interrupt is in flight it reports [`Step::WaitForResume`] unconditionally — the interrupt is
/// the *thread's* to handle (via [`ThreadCx::sleep`]/[`ThreadCx::wait_for_resume`] observing the
/// same shared flags), not the bridge's, so [`crate::controller::TaskController::pause_with_origin`]'s
/// injected poll must not see this as "ignored the interrupt". Otherwise it reports
/// [`Step::Sleep`] so the worker re-checks again after [`POLL_INTERVAL`].
struct BridgeFuture {
    cx: TaskCx,
    rx: mpsc::Receiver<BodyResult>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Future for BridgeFuture {
    type Output = BodyResult;

    fn poll(self: Pin<&mut Self>, _poll_cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.rx.try_recv() {
            Ok(result) => {
                if let Some(handle) = this.handle.take() {
                    let _ = handle.join();
                }
                Poll::Ready(result)
            }
            Err(TryRecvError::Disconnected) => {
                if let Some(handle) = this.handle.take() {
                    let _ = handle.join();
                }
                Poll::Ready(Err(Box::new(ThreadPanicked) as BodyError))
            }
            Err(TryRecvError::Empty) => {
                let step = if this.cx.is_interrupted() {
                    Step::WaitForResume
                } else {
                    Step::Sleep(POLL_INTERVAL)
                };
                this.cx.set_pending_step(step);
                Poll::Pending
            }
        }
    }
}

/// Entry point for registering a threaded task body with a [`crate::manager::TaskManager`].
pub struct ThreadedController;

impl ThreadedController {
    /// Wraps a blocking routine as a [`crate::controller::BodyFactory`] that spawns it on a
    /// dedicated OS thread every time the controller (re)starts.
    pub fn factory<F>(body: F) -> Arc<crate::controller::BodyFactory>
    where
        F: Fn(ThreadCx) -> BodyResult + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        Arc::new(move |cx: TaskCx| {
            let body = body.clone();
            let thread_name = cx.name().to_string();
            let thread_cx = ThreadCx::new(cx.clone());
            let (tx, rx) = mpsc::channel();
            let spawned = thread::Builder::new().name(thread_name).spawn(move || {
                let result = body(thread_cx);
                let _ = tx.send(result);
            });
            match spawned {
                Ok(handle) => Box::pin(BridgeFuture {
                    cx,
                    rx,
                    handle: Some(handle),
                }) as Pin<Box<dyn Future<Output = BodyResult> + Send>>,
                Err(e) => {
                    warn!(task = %cx.name(), error = %e, "failed to spawn task thread");
                    Box::pin(async move { Err(Box::new(e) as BodyError) })
                        as Pin<Box<dyn Future<Output = BodyResult> + Send>>
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        action::NullBackend,
        controller::{TaskController, TaskState},
        hub::Hub,
        variables::VariableStore,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_controller(factory: Arc<crate::controller::BodyFactory>) -> TaskController {
        let hub = Hub::default();
        let variables = Arc::new(VariableStore::new());
        let input: Arc<dyn InputBackend> = Arc::new(NullBackend);
        TaskController::new(
            TaskId(7),
            TaskName::Named(Arc::from("threaded")),
            None,
            variables,
            hub,
            input,
            factory,
        )
    }

    #[test]
    fn test_threaded_body_runs_to_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let factory = ThreadedController::factory(move |tcx: ThreadCx| {
            ran2.fetch_add(1, Ordering::SeqCst);
            tcx.sleep(Duration::from_millis(5))?;
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let ctl = make_controller(factory);
        ctl.restart(None);
        loop {
            match ctl.next_step() {
                crate::controller::StepOutcome::Done(result) => {
                    assert!(result.is_ok());
                    break;
                }
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_threaded_sleep_freezes_on_soft_pause() {
        let finished_at: Arc<Mutex<Option<Monotonic>>> = Arc::new(Mutex::new(None));
        let finished_at2 = finished_at.clone();
        let factory = ThreadedController::factory(move |tcx: ThreadCx| {
            tcx.sleep(Duration::from_millis(60))?;
            *finished_at2.lock() = Some(Monotonic::now());
            Ok(())
        });
        let ctl = make_controller(factory);
        let start = Monotonic::now();
        ctl.restart(None);
        thread::sleep(Duration::from_millis(20));
        assert!(ctl.pause(false));
        assert_eq!(ctl.state(), TaskState::Paused);
        // while soft-paused the thread must stay frozen, not finish on its own
        thread::sleep(Duration::from_millis(80));
        assert!(finished_at.lock().is_none(), "body must not progress while soft-paused");
        ctl.resume().expect("was paused");
        loop {
            match ctl.next_step() {
                crate::controller::StepOutcome::Done(result) => {
                    assert!(result.is_ok());
                    break;
                }
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        let elapsed = finished_at.lock().expect("body finished") - start;
        // expected: ~20ms (pre-pause) + 80ms (frozen) + ~40ms (remaining sleep) ≈ 140ms, not ~60ms
        assert!(elapsed >= Duration::from_millis(110), "remaining sleep was not preserved: {elapsed:?}");
    }

    #[test]
    fn test_threaded_body_releases_key_on_interrupt() {
        let downs = Arc::new(AtomicUsize::new(0));
        let ups = Arc::new(AtomicUsize::new(0));
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
            fn mouse_down(&self, _point: Option<(i32, i32)>, _button: MouseButton) {}
            fn mouse_up(&self, _point: Option<(i32, i32)>, _button: MouseButton) {}
        }
        let backend = Arc::new(CountingBackend {
            downs: downs.clone(),
            ups: ups.clone(),
        });
        let factory = ThreadedController::factory(move |tcx: ThreadCx| {
            loop {
                match tcx.hold_key("w", Duration::from_secs(30)) {
                    Ok(()) => return Ok(()),
                    Err(TaskError::Interrupted) => continue,
                    Err(TaskError::Aborted) => return Err(Box::new(TaskError::Aborted)),
                }
            }
        });
        let hub = Hub::default();
        let variables = Arc::new(VariableStore::new());
        let input: Arc<dyn InputBackend> = backend;
        let ctl = TaskController::new(
            TaskId(8),
            TaskName::Named(Arc::from("holder")),
            None,
            variables,
            hub,
            input,
            factory,
        );
        ctl.restart(None);
        // give the OS thread a chance to press the key
        while downs.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(ctl.pause(true));
        assert_eq!(ctl.state(), TaskState::Interrupted);
        while ups.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(ups.load(Ordering::SeqCst), 1);
        ctl.stop();
        assert_eq!(ctl.state(), TaskState::Stopped);
    }
}
