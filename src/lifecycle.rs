//! Lifecycle state shared between the control thread and the capture thread,
//! and the readiness gate for deferred starts.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

/// Logical state of a frame grabber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Not delivering frames.
    Stopped = 0,
    /// Pipeline built, capture graph paused.
    Initializing = 1,
    /// Frames are forwarded downstream.
    Running = 2,
}

impl LifecycleState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Atomically readable lifecycle state.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Start in `Stopped`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Stopped as u8),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Overwrite the state.
    pub fn set(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether frames should be forwarded.
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }
}

/// Callback run once a gate opens.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// An external capability that must be ready before capture may begin.
pub trait UploadGate: Send + Sync {
    /// Whether the capability is ready now.
    fn is_ready(&self) -> bool;

    /// Run `callback` once the capability is ready (immediately if it
    /// already is).
    fn when_ready(&self, callback: ReadyCallback);
}

#[derive(Default)]
struct LatchState {
    ready: bool,
    waiters: Vec<ReadyCallback>,
}

/// A one-shot [`UploadGate`] opened by [`ReadinessLatch::signal_ready`].
#[derive(Default)]
pub struct ReadinessLatch {
    state: Mutex<LatchState>,
}

impl std::fmt::Debug for ReadinessLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessLatch")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl ReadinessLatch {
    /// Create a closed latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the latch and run every registered callback.
    pub fn signal_ready(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.ready = true;
            std::mem::take(&mut state.waiters)
        };
        for callback in waiters {
            callback();
        }
    }
}

impl UploadGate for ReadinessLatch {
    fn is_ready(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
    }

    fn when_ready(&self, callback: ReadyCallback) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.ready {
                state.waiters.push(callback);
                return;
            }
        }
        callback();
    }
}
