//! Task identity and the cooperative [`TaskController`] — the per-task state machine that owns a
//! body future, its generation counter, its wake time and its pause state.
//!
//! Grounded on `macro_studio/core/controllers/task_controller.py`'s `TaskController`. The state
//! beacon (`TaskState`) follows the atomic-`i8` idiom of `roboplc::controller::{State,
//! ControllerStateKind}`.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicI8, Ordering},
        Arc,
    },
    task::{Context as PollContext, Poll},
    time::Duration,
};

use bma_ts::Monotonic;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    hub::{Hub, LogErrorPacket, LogEvent, LogLevel, LogPacket},
    variables::VariableStore,
    pause::PauseState,
};

/// The error produced by a task body's own unhandled mistakes, i.e. anything other than
/// [`TaskError::Interrupted`]/[`TaskError::Aborted`]. Matches `roboplc::controller::WResult`'s
/// `Box<dyn Error + Send + Sync>` exactly so interrupt/abort and ordinary crashes share one
/// channel and the controller tells them apart by downcasting.
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;
/// The result type a task body returns.
pub type BodyResult = std::result::Result<(), BodyError>;

/// The two first-class cancellation signals. `sleep`/`wait_for_resume` resolve to one of these
/// the moment the controller's shared interrupt/abort flag is observed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Raised at the body's current suspension point on a per-task or global interrupt. Must be
    /// caught and handled (typically by releasing held resources and calling
    /// [`crate::action::wait_for_resume`]); an uncaught `Interrupted` crashes the task.
    #[error("task interrupted")]
    Interrupted,
    /// Raised when the controller has been stopped outright (not merely paused). A body may catch
    /// this purely to return promptly but must not swallow it silently — propagating it is the
    /// expected behavior.
    #[error("task aborted")]
    Aborted,
}

/// What a body's suspension point asked for. Written to the controller's scratch cell by
/// [`crate::action::sleep`]/[`crate::action::wait_for_resume`] on their first poll, and read back
/// by the controller once the wrapping body future returns `Poll::Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Rest for the given duration.
    Sleep(Duration),
    /// Rest until the controller's interrupted state clears (`resume()` is called).
    WaitForResume,
}

/// The outcome of advancing a controller by one step, as seen by the worker.
pub enum StepOutcome {
    /// Reschedule at `now + d`.
    Sleep(Duration),
    /// Move to the paused set; the controller is already `INTERRUPTED`.
    WaitForResume,
    /// The body returned. `Ok(())` is a normal finish; `Err` is an unhandled body error (crash).
    Done(BodyResult),
}

/// A stable, process-unique controller id — the heap's and subscriber registry's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task's user-facing identity: either a string name or an anonymous numeric one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskName {
    /// A user-supplied, process-unique string name.
    Named(Arc<str>),
    /// An anonymous task, identified only by its `cid`.
    Anonymous(u64),
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskName::Named(name) => write!(f, "{name}"),
            TaskName::Anonymous(cid) => write!(f, "task#{cid}"),
        }
    }
}

/// The only authoritative liveness signal for a task. Represented as an atomic `i8` beacon so any
/// thread can cheaply read it without locking, following `roboplc::controller::ControllerStateKind`.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Ord, PartialOrd)]
#[repr(i8)]
pub enum TaskState {
    /// Eligible to be dispatched by the worker.
    Running = 0,
    /// Soft-paused: body frozen between yields, held resources not released.
    Paused = 1,
    /// Interrupt signaled; the body's suspension point has been asked to raise, and any scoped
    /// cleanup has run synchronously.
    Interrupted = 2,
    /// Terminated by user/manager; body closed. Terminal.
    Stopped = -1,
    /// Body returned normally (and is not configured to repeat). Terminal.
    Finished = -2,
    /// Body raised an unhandled error, or failed to handle an interrupt. Terminal.
    Crashed = -3,
}

impl TaskState {
    fn from_i8(v: i8) -> Self {
        match v {
            0 => TaskState::Running,
            1 => TaskState::Paused,
            2 => TaskState::Interrupted,
            -1 => TaskState::Stopped,
            -2 => TaskState::Finished,
            -3 => TaskState::Crashed,
            _ => unreachable!("invalid TaskState discriminant {v}"),
        }
    }

    /// `DEAD = {Stopped, Finished, Crashed}`.
    pub fn is_dead(self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::Finished | TaskState::Crashed)
    }

    /// `PAUSED_LIKE = {Paused, Interrupted}`.
    pub fn is_paused_like(self) -> bool {
        matches!(self, TaskState::Paused | TaskState::Interrupted)
    }
}

/// A cloneable atomic state beacon, shared between a controller and anything that needs to read
/// its liveness (the worker, the manager, `TaskCx`) without locking.
#[derive(Clone)]
pub(crate) struct StateCell(Arc<AtomicI8>);

impl StateCell {
    pub(crate) fn new(initial: TaskState) -> Self {
        Self(Arc::new(AtomicI8::new(initial as i8)))
    }
    pub(crate) fn get(&self) -> TaskState {
        TaskState::from_i8(self.0.load(Ordering::Acquire))
    }
    pub(crate) fn set(&self, state: TaskState) {
        self.0.store(state as i8, Ordering::Release);
    }
}

/// Per-task shared context: the scratch cell a suspension-point future writes its request into,
/// the flags it polls to resolve to [`TaskError`], and the handles (hub, variables, input
/// backend) exposed to the running body. Cloneable and `'static`; cheap to hand to the body.
pub struct TaskCx {
    pub(crate) id: TaskId,
    pub(crate) name: TaskName,
    pub(crate) state: StateCell,
    pub(crate) interrupted: Arc<AtomicBool>,
    pub(crate) aborted: Arc<AtomicBool>,
    pub(crate) pending_step: Arc<Mutex<Option<Step>>>,
    pub(crate) variables: Arc<VariableStore>,
    pub(crate) log_hub: Hub<LogEvent>,
    pub(crate) input: Arc<dyn crate::action::InputBackend>,
    /// Gate a threaded body's blocking `sleep`/`wait_for_resume` block on. Closed whenever the
    /// controller enters `PAUSED_LIKE`, opened whenever it leaves it (spec §4.3's invariant).
    /// Unused by cooperative bodies.
    pub(crate) resume_gate: Arc<crate::threaded::ResumeGate>,
}

impl Clone for TaskCx {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            state: self.state.clone(),
            interrupted: self.interrupted.clone(),
            aborted: self.aborted.clone(),
            pending_step: self.pending_step.clone(),
            variables: self.variables.clone(),
            log_hub: self.log_hub.clone(),
            input: self.input.clone(),
            resume_gate: self.resume_gate.clone(),
        }
    }
}

impl TaskCx {
    /// The task's stable id.
    pub fn id(&self) -> TaskId {
        self.id
    }
    /// The task's name.
    pub fn name(&self) -> &TaskName {
        &self.name
    }
    /// Current state, as observed by the body itself (e.g. to implement custom polling loops).
    pub fn state(&self) -> TaskState {
        self.state.get()
    }
    /// Is the task currently paused (soft or hard).
    pub fn is_paused(&self) -> bool {
        self.state.get().is_paused_like()
    }
    /// Is the task eligible for dispatch right now.
    pub fn is_running(&self) -> bool {
        self.state.get() == TaskState::Running
    }
    /// Has a live body and is not in a terminal state.
    pub fn is_alive(&self) -> bool {
        !self.state.get().is_dead()
    }
    /// Reads a variable's current value, if registered.
    pub fn get_var(&self, key: &str) -> Option<crate::variables::VariableValue> {
        self.variables.get(key)
    }
    /// Emits an informational/warning/error log packet tagged with this task's name.
    pub fn log(&self, level: crate::hub::LogLevel, parts: Vec<String>) {
        self.log_hub.send(LogEvent::Packet(crate::hub::LogPacket {
            parts,
            level,
            task_name: self.name.clone(),
        }));
    }
    /// Emits an error log packet with an optional traceback/backtrace string.
    pub fn log_error(&self, message: impl Into<String>, trace: Option<String>) {
        self.log_hub.send(LogEvent::Error(crate::hub::LogErrorPacket {
            message: message.into(),
            traceback: trace,
            task_name: self.name.clone(),
        }));
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
    pub(crate) fn set_pending_step(&self, step: Step) {
        *self.pending_step.lock() = Some(step);
    }
}

pub(crate) type BodyFactory =
    dyn Fn(TaskCx) -> Pin<Box<dyn Future<Output = BodyResult> + Send>> + Send + Sync;

struct Inner {
    generation: u64,
    wake_time: Monotonic,
    state_change_by_worker: bool,
    enabled: bool,
    loop_delay: Option<Duration>,
    body: Option<Pin<Box<dyn Future<Output = BodyResult> + Send>>>,
    pause_timestamp: Option<Monotonic>,
}

/// The cooperative per-task controller: owns a body future, its generation counter, wake time and
/// pause state, and bridges worker ticks to the body. See `macro_studio`'s `TaskController`.
pub struct TaskController {
    id: TaskId,
    name: TaskName,
    state: StateCell,
    pause: PauseState,
    interrupted: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    pending_step: Arc<Mutex<Option<Step>>>,
    variables: Arc<VariableStore>,
    log_hub: Hub<LogEvent>,
    input: Arc<dyn crate::action::InputBackend>,
    resume_gate: Arc<crate::threaded::ResumeGate>,
    factory: Arc<BodyFactory>,
    inner: Mutex<Inner>,
}

impl TaskController {
    /// Creates a new controller for `name`, wired to `log_hub`/`variables`/`input`, with a body
    /// factory invoked on every (re)start. The controller begins `STOPPED` with no live body; the
    /// caller (the manager) calls [`TaskController::restart`] to bring it up.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        name: TaskName,
        loop_delay: Option<Duration>,
        variables: Arc<VariableStore>,
        log_hub: Hub<LogEvent>,
        input: Arc<dyn crate::action::InputBackend>,
        factory: Arc<BodyFactory>,
    ) -> Self {
        Self {
            id,
            name,
            state: StateCell::new(TaskState::Stopped),
            pause: PauseState::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
            pending_step: Arc::new(Mutex::new(None)),
            variables,
            log_hub,
            input,
            resume_gate: Arc::new(crate::threaded::ResumeGate::new()),
            factory,
            inner: Mutex::new(Inner {
                generation: 0,
                wake_time: Monotonic::now(),
                state_change_by_worker: false,
                enabled: true,
                loop_delay,
                body: None,
                pause_timestamp: None,
            }),
        }
    }

    fn make_cx(&self) -> TaskCx {
        TaskCx {
            id: self.id,
            name: self.name.clone(),
            state: self.state.clone(),
            interrupted: self.interrupted.clone(),
            aborted: self.aborted.clone(),
            pending_step: self.pending_step.clone(),
            variables: self.variables.clone(),
            log_hub: self.log_hub.clone(),
            input: self.input.clone(),
            resume_gate: self.resume_gate.clone(),
        }
    }

    /// The task's stable id.
    pub fn id(&self) -> TaskId {
        self.id
    }
    /// The task's name.
    pub fn name(&self) -> TaskName {
        self.name.clone()
    }
    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state.get()
    }
    /// `PAUSED_LIKE`.
    pub fn is_paused_like(&self) -> bool {
        self.state.get().is_paused_like()
    }
    /// Has a live body and is not in `DEAD`.
    pub fn is_alive(&self) -> bool {
        !self.state.get().is_dead()
    }
    /// The task's current monotonic generation.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
    /// The instant at which this task next becomes eligible for dispatch.
    pub fn wake_time(&self) -> Monotonic {
        self.inner.lock().wake_time
    }
    /// Overwrites the wake time without touching generation — used by the worker after computing
    /// `now + d` from a `Sleep` step outcome.
    pub(crate) fn set_wake_time(&self, t: Monotonic) {
        self.inner.lock().wake_time = t;
    }
    /// Whether the most recent pause/resume transition was authored by the worker (global pause)
    /// rather than explicitly by the user.
    pub fn state_change_by_worker(&self) -> bool {
        self.inner.lock().state_change_by_worker
    }
    /// `auto_loop` delay, if the task is configured to repeat on normal completion.
    pub fn loop_delay(&self) -> Option<Duration> {
        self.inner.lock().loop_delay
    }

    /// `pause(interrupt)`. Idempotent. Returns whether the task is alive after the call.
    ///
    /// `by_worker` records whether this pause was authored by the worker's global-pause
    /// propagation (vs. an explicit per-task call from the embedder).
    pub fn pause_with_origin(&self, interrupt: bool, by_worker: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.body.is_none() || self.state.get().is_dead() {
            return false;
        }
        let cur = self.state.get();
        if !interrupt && cur.is_paused_like() {
            return true; // soft-pausing an already-paused task does nothing
        }
        if interrupt && cur == TaskState::Interrupted {
            return true;
        }
        self.pause.trigger(interrupt);
        if inner.pause_timestamp.is_none() {
            inner.pause_timestamp = Some(Monotonic::now());
        }
        inner.state_change_by_worker = by_worker;
        self.resume_gate.close();
        if !interrupt {
            self.state.set(TaskState::Paused);
            return true;
        }
        // interrupt: inject synchronously. The body runs with the inner lock released so it may
        // call back into the controller (e.g. via TaskCx) without deadlocking.
        self.state.set(TaskState::Interrupted);
        self.interrupted.store(true, Ordering::Release);
        let mut body = inner.body.take().expect("checked above");
        drop(inner);
        let outcome = poll_once(&mut body, &self.make_cx());
        let mut inner = self.inner.lock();
        match outcome {
            StepOutcome::WaitForResume => {
                inner.body = Some(body);
                true
            }
            StepOutcome::Sleep(_) => {
                // the body ignored the interrupt and kept running: it did not honor the
                // cancellation contract, so the controller forces a crash.
                warn!(task = %self.name, "task ignored interrupt, forcing crash");
                self.log_hub.send(LogEvent::Packet(LogPacket {
                    parts: vec!["task ignored interrupt, forcing crash".to_string()],
                    level: LogLevel::Warn,
                    task_name: self.name.clone(),
                }));
                inner.generation += 1;
                self.state.set(TaskState::Crashed);
                false
            }
            StepOutcome::Done(Ok(())) => {
                inner.generation += 1;
                self.state.set(TaskState::Finished);
                false
            }
            StepOutcome::Done(Err(e)) => {
                debug!(task = %self.name, error = %e, "task crashed while handling interrupt");
                self.report_crash(&e);
                inner.generation += 1;
                self.state.set(TaskState::Crashed);
                false
            }
        }
    }

    /// `pause(interrupt)` as called directly by the embedder (not the worker).
    pub fn pause(&self, interrupt: bool) -> bool {
        self.pause_with_origin(interrupt, false)
    }

    /// `resume()`. Returns the elapsed pause duration if the task was `PAUSED_LIKE`.
    pub fn resume(&self) -> Option<Duration> {
        let cur = self.state.get();
        if !cur.is_paused_like() {
            return None;
        }
        let elapsed = self.pause.clear()?;
        self.resume_gate.open();
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.pause_timestamp = None;
        self.interrupted.store(false, Ordering::Release);
        if cur == TaskState::Interrupted {
            inner.wake_time = Monotonic::now();
        } else {
            inner.wake_time += elapsed;
        }
        self.state.set(TaskState::Running);
        Some(elapsed)
    }

    /// Moves to `STOPPED`, closing the body (dropping it runs any scoped cleanup) and bumping the
    /// generation so stale heap entries are discarded. The abort flag is left set so a threaded
    /// body's independently-running OS thread observes it and unwinds; [`TaskController::restart`]
    /// clears it again for the next generation.
    pub fn stop(&self) {
        self.aborted.store(true, Ordering::Release);
        self.resume_gate.open();
        let mut inner = self.inner.lock();
        inner.body = None;
        inner.generation += 1;
        self.state.set(TaskState::Stopped);
    }

    /// Emits the forced-stop (WARN) or crash (ERROR) report for `error` over this controller's log
    /// hub (spec §6.4). Called by the worker's dispatch path alongside [`TaskController::crash`].
    pub(crate) fn report_crash(&self, error: &BodyError) {
        if let Some(task_err) = error.downcast_ref::<TaskError>() {
            self.log_hub.send(LogEvent::Packet(LogPacket {
                parts: vec![task_err.to_string()],
                level: LogLevel::Warn,
                task_name: self.name.clone(),
            }));
        } else {
            self.log_hub.send(LogEvent::Error(LogErrorPacket {
                message: error.to_string(),
                traceback: None,
                task_name: self.name.clone(),
            }));
        }
    }

    /// Marks the controller `CRASHED`, closing its body. Used by the worker's dispatch path.
    pub(crate) fn crash(&self) {
        let mut inner = self.inner.lock();
        inner.body = None;
        inner.generation += 1;
        self.state.set(TaskState::Crashed);
    }

    /// Marks the controller `FINISHED`, closing its body. Used by the worker's dispatch path when
    /// a non-repeating body returns normally.
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.body = None;
        inner.generation += 1;
        self.state.set(TaskState::Finished);
    }

    /// Atomic "kill and re-create": closes the current body, builds a fresh one via the stored
    /// factory at `wake_time` (or now), generation++.
    pub fn restart(&self, wake_time: Option<Monotonic>) {
        let mut inner = self.inner.lock();
        inner.body = Some((self.factory)(self.make_cx()));
        inner.wake_time = wake_time.unwrap_or_else(Monotonic::now);
        inner.generation += 1;
        inner.pause_timestamp = None;
        self.interrupted.store(false, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
        self.resume_gate.open();
        self.state.set(TaskState::Running);
    }

    /// Enables/disables the task. Disabling forces `STOPPED` and excludes it from the manager's
    /// next reload; re-enabling restarts it immediately.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().enabled = enabled;
        if !enabled {
            self.stop();
        } else {
            self.restart(None);
        }
    }

    /// Whether the task participates in the manager's reload set.
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Worker-only: advances the body one step.
    pub(crate) fn next_step(&self) -> StepOutcome {
        let mut inner = self.inner.lock();
        let Some(mut body) = inner.body.take() else {
            return StepOutcome::Done(Ok(()));
        };
        drop(inner);
        let outcome = poll_once(&mut body, &self.make_cx());
        let mut inner = self.inner.lock();
        if matches!(outcome, StepOutcome::Sleep(_) | StepOutcome::WaitForResume) {
            inner.body = Some(body);
        }
        outcome
    }
}

/// Polls a body future exactly once, with a no-op waker (the worker's heap, not a reactor, is the
/// sole scheduler). Translates the poll result into a [`StepOutcome`] using the scratch cell the
/// inner suspension-point future wrote before returning `Pending`.
pub(crate) fn poll_once(
    body: &mut Pin<Box<dyn Future<Output = BodyResult> + Send>>,
    cx: &TaskCx,
) -> StepOutcome {
    let waker = noop_waker();
    let mut poll_cx = PollContext::from_waker(&waker);
    match body.as_mut().poll(&mut poll_cx) {
        Poll::Pending => match cx.pending_step.lock().take() {
            Some(Step::Sleep(d)) => StepOutcome::Sleep(d),
            Some(Step::WaitForResume) | None => StepOutcome::WaitForResume,
        },
        Poll::Ready(result) => StepOutcome::Done(result),
    }
}

fn noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw_waker()) }
}
