//! The small library a task body calls to suspend: `sleep`, `wait_for_resume`, `hold_key`,
//! `mouse_click`. Grounded on `macro_studio/actions.py` (`taskSleep`, `taskWaitForResume`,
//! `holdKey`/`taskHoldKey`, `mouseClick`/`taskMouseClick`).
//!
//! `sleep`/`wait_for_resume` are hand-written [`Future`]s rather than `async fn` bodies because
//! each needs to write to the controller's scratch cell on its *first* poll only, then resolve
//! from the controller's shared flags on any later poll — see [`crate::controller::poll_once`]
//! for how the controller turns that `Pending`/scratch-cell pair into a [`crate::controller::StepOutcome`].

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context as PollContext, Poll},
    time::Duration,
};

use tracing::trace;

use crate::controller::{Step, TaskCx, TaskError};

/// A mouse button, as understood by [`InputBackend::mouse_down`]/[`InputBackend::mouse_up`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    /// The primary (usually left) button.
    Left,
    /// The secondary (usually right) button.
    Right,
    /// The middle button / wheel click.
    Middle,
}

/// Performs the actual key/mouse I/O. The crate does not dictate an input-injection library
/// (spec §1); embedders plug in a real backend, e.g. one wrapping a platform input crate.
pub trait InputBackend: Send + Sync {
    /// Presses and holds a named key.
    fn key_down(&self, key: &str);
    /// Releases a previously pressed key.
    fn key_up(&self, key: &str);
    /// Presses and holds a mouse button, optionally moving to `point` first.
    fn mouse_down(&self, point: Option<(i32, i32)>, button: MouseButton);
    /// Releases a previously pressed mouse button.
    fn mouse_up(&self, point: Option<(i32, i32)>, button: MouseButton);
}

/// The default backend: traces every call and performs no actual I/O. Useful for tests and for
/// embedders that have not wired a real backend yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl InputBackend for NullBackend {
    fn key_down(&self, key: &str) {
        trace!(key, "key_down (null backend)");
    }
    fn key_up(&self, key: &str) {
        trace!(key, "key_up (null backend)");
    }
    fn mouse_down(&self, point: Option<(i32, i32)>, button: MouseButton) {
        trace!(?point, ?button, "mouse_down (null backend)");
    }
    fn mouse_up(&self, point: Option<(i32, i32)>, button: MouseButton) {
        trace!(?point, ?button, "mouse_up (null backend)");
    }
}

struct SleepFuture<'a> {
    cx: &'a TaskCx,
    duration: Duration,
    yielded: bool,
}

impl Future for SleepFuture<'_> {
    type Output = Result<(), TaskError>;
    fn poll(self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cx.is_aborted() {
            return Poll::Ready(Err(TaskError::Aborted));
        }
        if this.cx.is_interrupted() {
            return Poll::Ready(Err(TaskError::Interrupted));
        }
        if !this.yielded {
            this.cx.set_pending_step(Step::Sleep(this.duration));
            this.yielded = true;
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }
}

/// Rests for `duration`. Resolves to [`TaskError::Interrupted`] if interrupted mid-sleep, or
/// [`TaskError::Aborted`] if the controller is stopped outright. Translates the original's
/// `taskSleep`/`yield duration`.
pub fn sleep(cx: &TaskCx, duration: Duration) -> impl Future<Output = Result<(), TaskError>> + '_ {
    SleepFuture {
        cx,
        duration,
        yielded: false,
    }
}

struct WaitForResumeFuture<'a> {
    cx: &'a TaskCx,
    yielded: bool,
}

impl Future for WaitForResumeFuture<'_> {
    type Output = Result<(), TaskError>;
    fn poll(self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.yielded {
            this.cx.set_pending_step(Step::WaitForResume);
            this.yielded = true;
            return Poll::Pending;
        }
        if this.cx.is_aborted() {
            return Poll::Ready(Err(TaskError::Aborted));
        }
        Poll::Ready(Ok(()))
    }
}

/// Rests until the controller's interrupted state clears, i.e. until `resume()` is called.
/// Translates the original's `taskWaitForResume`/`yield None`.
pub fn wait_for_resume(cx: &TaskCx) -> impl Future<Output = Result<(), TaskError>> + '_ {
    WaitForResumeFuture { cx, yielded: false }
}

/// RAII guard for a held key: presses on construction, releases on `Drop`. The Rust-native
/// translation of the original's `@contextmanager holdKey`.
pub struct KeyGuard {
    input: Arc<dyn InputBackend>,
    key: String,
}

impl KeyGuard {
    fn new(input: Arc<dyn InputBackend>, key: String) -> Self {
        input.key_down(&key);
        Self { input, key }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.input.key_up(&self.key);
    }
}

/// Presses `key`, sleeps for `duration`, releases on every exit path — including an interrupt,
/// after which the task waits for resume (matching `taskHoldKey`'s
/// `except TaskInterruptedException: yield from taskWaitForResume()`).
pub async fn hold_key(cx: &TaskCx, key: impl Into<String>, duration: Duration) -> Result<(), TaskError> {
    let guard = KeyGuard::new(cx.input.clone(), key.into());
    match sleep(cx, duration).await {
        Ok(()) => {
            drop(guard);
            Ok(())
        }
        Err(TaskError::Interrupted) => {
            drop(guard);
            wait_for_resume(cx).await
        }
        Err(e) => {
            drop(guard);
            Err(e)
        }
    }
}

/// RAII guard for a held mouse button.
pub struct MouseGuard {
    input: Arc<dyn InputBackend>,
    point: Option<(i32, i32)>,
    button: MouseButton,
}

impl MouseGuard {
    fn new(input: Arc<dyn InputBackend>, point: Option<(i32, i32)>, button: MouseButton) -> Self {
        input.mouse_down(point, button);
        Self { input, point, button }
    }
}

impl Drop for MouseGuard {
    fn drop(&mut self) {
        self.input.mouse_up(self.point, self.button);
    }
}

/// Clicks the mouse at `point` (or the current cursor position if `None`): press, a short yield,
/// release — guaranteed on every exit path. Translates `mouseClick`/`taskMouseClick`.
pub async fn mouse_click(
    cx: &TaskCx,
    point: Option<(i32, i32)>,
    button: MouseButton,
) -> Result<(), TaskError> {
    let guard = MouseGuard::new(cx.input.clone(), point, button);
    match sleep(cx, Duration::from_millis(50)).await {
        Ok(()) => {
            drop(guard);
            Ok(())
        }
        Err(TaskError::Interrupted) => {
            drop(guard);
            wait_for_resume(cx).await
        }
        Err(e) => {
            drop(guard);
            Err(e)
        }
    }
}
