//! The scheduling loop: a single time-ordered heap of runnable controllers, a side set of paused
//! ones, and the global [`PauseState`] that governs both. Grounded on spec §4.4; structurally
//! adapted from the atomic-state-beacon / mutex-guarded-shared-state shape `roboplc::controller`
//! uses for its own worker lifecycle, restructured around one heap instead of a generic `run()`
//! trait since this crate's worker has exactly one algorithm, not a user-pluggable one.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bma_ts::Monotonic;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{
    controller::{StepOutcome, TaskController, TaskError, TaskId, TaskState},
    pause::PauseState,
};

const DEFAULT_MIN_SLEEP: Duration = Duration::from_millis(1);
const DEFAULT_MAX_SLEEP: Duration = Duration::from_millis(50);
const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Builder-style tuning knobs for a [`Worker`]'s loop. There is no pluggable `run()` body here
/// (unlike `roboplc::controller::WorkerOptions`) since the scheduling algorithm itself is fixed by
/// spec; only its timing is configurable.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    min_sleep: Duration,
    max_sleep: Duration,
    idle_sleep: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            min_sleep: DEFAULT_MIN_SLEEP,
            max_sleep: DEFAULT_MAX_SLEEP,
            idle_sleep: DEFAULT_IDLE_SLEEP,
        }
    }
}

impl WorkerOptions {
    /// Default options: `[1ms, 50ms]` clamp, 50ms idle poll.
    pub fn new() -> Self {
        Self::default()
    }
    /// Lower bound for the computed until-next-wake sleep.
    pub fn min_sleep(mut self, d: Duration) -> Self {
        self.min_sleep = d;
        self
    }
    /// Upper bound for the computed until-next-wake sleep; also the poll period while the heap is
    /// empty but the paused set is non-empty.
    pub fn max_sleep(mut self, d: Duration) -> Self {
        self.max_sleep = d;
        self
    }
    /// How long to sleep between checks while the heap is empty and the paused set is not.
    pub fn idle_sleep(mut self, d: Duration) -> Self {
        self.idle_sleep = d;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct HeapKey {
    wake_time: Monotonic,
    cid: TaskId,
    generation: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wake_time
            .cmp(&other.wake_time)
            .then(self.cid.cmp(&other.cid))
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct HeapEntry {
    key: HeapKey,
    controller: Arc<TaskController>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn push_heap(heap: &mut BinaryHeap<Reverse<HeapEntry>>, controller: Arc<TaskController>) {
    let key = HeapKey {
        wake_time: controller.wake_time(),
        cid: controller.id(),
        generation: controller.generation(),
    };
    heap.push(Reverse(HeapEntry { key, controller }));
}

struct Shared {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Controllers in `PAUSED_LIKE` state, pulled out of the heap.
    paused: HashMap<TaskId, Arc<TaskController>>,
    /// `RUNNING` controllers set aside by a *global soft* pause — their own state/generation is
    /// untouched, only the heap entry is parked, per spec's "remain... resume untouched".
    parked: Vec<Arc<TaskController>>,
}

enum Action {
    Dispatch(Arc<TaskController>),
    Wait(Duration),
    Idle,
    Finished,
}

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// `is_alive` was observed false; the worker was stopped.
    Stopped,
    /// The global [`PauseState`] became active; call [`Worker::run`] again after
    /// [`Worker::resume`].
    Paused,
    /// The heap and the paused set both emptied out: no work remains.
    Finished,
}

/// The scheduling loop itself. One `Worker` drives at most one OS thread at a time (owned by the
/// caller, typically [`crate::manager::TaskManager`]); [`Worker::run`] is the blocking loop body,
/// returning whenever the loop should exit this OS thread (stop, global pause, or natural finish).
pub struct Worker {
    options: WorkerOptions,
    pause: PauseState,
    is_alive: AtomicBool,
    last_heartbeat: Mutex<Monotonic>,
    shared: Mutex<Shared>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new(WorkerOptions::default())
    }
}

impl Worker {
    /// Creates an idle worker with an empty heap.
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            options,
            pause: PauseState::new(),
            is_alive: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Monotonic::now()),
            shared: Mutex::new(Shared {
                heap: BinaryHeap::new(),
                paused: HashMap::new(),
                parked: Vec::new(),
            }),
        }
    }

    /// Whether the loop considers itself alive. Distinct from whether an OS thread is currently
    /// executing [`Worker::run`] for it — the manager owns that thread's lifecycle.
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// The instant of the most recently completed loop iteration. The manager's watchdog compares
    /// this against now to detect a stalled (deadlocked) worker thread.
    pub fn last_heartbeat(&self) -> Monotonic {
        *self.last_heartbeat.lock()
    }

    /// Replaces the heap atomically: controllers not present in `controllers` that were previously
    /// scheduled (running, paused or parked) are stopped; the rest are (re)started fresh and
    /// pushed onto the heap. An empty list is the shutdown path and marks the worker not alive.
    pub fn reload_controllers(&self, controllers: Vec<Arc<TaskController>>) {
        let keep: HashSet<TaskId> = controllers.iter().map(|c| c.id()).collect();
        let mut shared = self.shared.lock();
        for Reverse(entry) in shared.heap.drain() {
            if !keep.contains(&entry.controller.id()) {
                entry.controller.stop();
            }
        }
        for (id, controller) in shared.paused.drain() {
            if !keep.contains(&id) {
                controller.stop();
            }
        }
        for controller in shared.parked.drain(..) {
            if !keep.contains(&controller.id()) {
                controller.stop();
            }
        }
        for controller in &controllers {
            if !controller.is_enabled() {
                continue;
            }
            controller.restart(None);
            push_heap(&mut shared.heap, controller.clone());
        }
        drop(shared);
        if controllers.is_empty() {
            debug!("worker reloaded with an empty controller set: shutting down");
            self.is_alive.store(false, Ordering::Release);
        } else {
            *self.last_heartbeat.lock() = Monotonic::now();
            self.is_alive.store(true, Ordering::Release);
        }
    }

    /// Marks the worker not alive. The running loop observes this within at most
    /// [`WorkerOptions::max_sleep`] and returns [`RunExit::Stopped`].
    pub fn stop(&self) {
        self.is_alive.store(false, Ordering::Release);
        self.pause.clear();
    }

    /// Triggers the global pause. The running loop observes this at its next check and returns
    /// [`RunExit::Paused`] after walking the heap per spec's global-pause lifecycle.
    pub fn pause(&self, interrupt: bool) {
        self.pause.trigger(interrupt);
    }

    /// Whether the global pause is currently active.
    pub fn is_paused(&self) -> bool {
        self.pause.is_active()
    }

    /// Reverses a global pause: reschedules parked and eligible paused controllers, shifting their
    /// wake time by the elapsed pause duration (or to "now" for interrupted ones), and marks the
    /// worker alive again. The caller must spawn a fresh thread calling [`Worker::run`].
    pub fn resume(&self) -> Option<Duration> {
        let elapsed = self.pause.clear()?;
        let mut shared = self.shared.lock();
        let parked: Vec<_> = shared.parked.drain(..).collect();
        for controller in parked {
            if controller.is_alive() {
                controller.set_wake_time(controller.wake_time() + elapsed);
                push_heap(&mut shared.heap, controller);
            }
        }
        let ids: Vec<TaskId> = shared.paused.keys().copied().collect();
        for id in ids {
            let Some(controller) = shared.paused.get(&id) else {
                continue;
            };
            if !controller.is_alive() {
                shared.paused.remove(&id);
                continue;
            }
            if controller.state_change_by_worker() {
                let controller = shared.paused.remove(&id).expect("checked above");
                controller.resume();
                push_heap(&mut shared.heap, controller);
            }
        }
        drop(shared);
        self.is_alive.store(true, Ordering::Release);
        Some(elapsed)
    }

    fn next_action(&self, now: Monotonic) -> Action {
        let mut shared = self.shared.lock();
        let settled: Vec<TaskId> = shared
            .paused
            .iter()
            .filter(|(_, c)| !c.is_paused_like())
            .map(|(id, _)| *id)
            .collect();
        for id in settled {
            if let Some(controller) = shared.paused.remove(&id) {
                if controller.is_alive() {
                    push_heap(&mut shared.heap, controller);
                }
            }
        }
        loop {
            let Some(Reverse(head)) = shared.heap.peek() else {
                return if shared.paused.is_empty() && shared.parked.is_empty() {
                    Action::Finished
                } else {
                    Action::Idle
                };
            };
            if head.key.generation != head.controller.generation() {
                shared.heap.pop();
                continue;
            }
            if head.controller.is_paused_like() {
                let Reverse(entry) = shared.heap.pop().expect("just peeked");
                shared.paused.insert(entry.controller.id(), entry.controller);
                continue;
            }
            if head.key.wake_time <= now {
                let Reverse(entry) = shared.heap.pop().expect("just peeked");
                return Action::Dispatch(entry.controller);
            }
            let wait = (head.key.wake_time - now).clamp(self.options.min_sleep, self.options.max_sleep);
            return Action::Wait(wait);
        }
    }

    fn dispatch(&self, controller: &Arc<TaskController>) {
        match controller.next_step() {
            StepOutcome::Sleep(d) => {
                controller.set_wake_time(Monotonic::now() + d);
                push_heap(&mut self.shared.lock().heap, controller.clone());
            }
            StepOutcome::WaitForResume => {
                self.shared.lock().paused.insert(controller.id(), controller.clone());
            }
            StepOutcome::Done(Ok(())) => {
                if let Some(delay) = controller.loop_delay() {
                    controller.restart(Some(Monotonic::now() + delay));
                    push_heap(&mut self.shared.lock().heap, controller.clone());
                } else {
                    controller.finish();
                }
            }
            StepOutcome::Done(Err(e)) => {
                if let Some(task_err) = e.downcast_ref::<TaskError>() {
                    warn!(task = %controller.name(), error = %task_err, "task forcibly stopped");
                } else {
                    error!(task = %controller.name(), error = %e, "task crashed");
                }
                controller.report_crash(&e);
                controller.crash();
            }
        }
    }

    /// The blocking loop body. Call on a dedicated thread; returns when the loop should exit that
    /// thread. The caller decides what to do with [`RunExit`] (spawn a new thread on `Paused`,
    /// tear the thread down on `Stopped`/`Finished`).
    pub fn run(&self) -> RunExit {
        loop {
            *self.last_heartbeat.lock() = Monotonic::now();
            if !self.is_alive.load(Ordering::Acquire) {
                return RunExit::Stopped;
            }
            if self.pause.is_active() {
                self.handle_global_pause();
                return RunExit::Paused;
            }
            match self.next_action(Monotonic::now()) {
                Action::Finished => {
                    debug!("worker finished: no runnable or paused controllers remain");
                    self.is_alive.store(false, Ordering::Release);
                    return RunExit::Finished;
                }
                Action::Idle => thread::sleep(self.options.idle_sleep),
                Action::Wait(d) => thread::sleep(d),
                Action::Dispatch(controller) => self.dispatch(&controller),
            }
        }
    }

    fn handle_global_pause(&self) {
        let interrupt = self.pause.is_interrupted();
        let mut shared = self.shared.lock();
        let drained: Vec<Arc<TaskController>> = shared
            .heap
            .drain()
            .filter(|Reverse(e)| e.key.generation == e.controller.generation())
            .map(|Reverse(e)| e.controller)
            .collect();
        if !interrupt {
            shared.parked.extend(drained.into_iter().filter(|c| c.is_alive()));
            debug!(parked = shared.parked.len(), "worker soft-paused globally");
            return;
        }
        let mut candidates = drained;
        candidates.extend(shared.paused.drain().map(|(_, c)| c));
        for controller in &candidates {
            if controller.is_alive() && controller.state() != TaskState::Interrupted {
                controller.pause_with_origin(true, true);
            }
        }
        let survivors: Vec<Arc<TaskController>> = candidates.into_iter().filter(|c| c.is_alive()).collect();
        let all_dead = survivors.is_empty();
        for controller in survivors {
            shared.paused.insert(controller.id(), controller);
        }
        if all_dead {
            debug!("worker global interrupt left no survivors, stopping");
            self.is_alive.store(false, Ordering::Release);
        }
    }
}
