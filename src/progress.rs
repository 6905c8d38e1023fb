//! Progress reporting channel between the session worker and the control
//! thread.
//!
//! The worker is the single writer; the control thread (UI) polls. Only
//! atomics and a mutex-guarded message slot cross the thread boundary.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Coarse session phase, mirrored into the progress channel so the control
/// thread can render a status line without touching session internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    StreamSetup = 1,
    Warmup = 2,
    HostAssistedSampling = 3,
    FirmwareCalibrate = 4,
    HealthEvaluation = 5,
    Done = 6,
    Failed = 7,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::StreamSetup,
            2 => SessionState::Warmup,
            3 => SessionState::HostAssistedSampling,
            4 => SessionState::FirmwareCalibrate,
            5 => SessionState::HealthEvaluation,
            6 => SessionState::Done,
            7 => SessionState::Failed,
            _ => SessionState::Idle,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::StreamSetup => write!(f, "Configuring Streams"),
            SessionState::Warmup => write!(f, "Warming Up"),
            SessionState::HostAssistedSampling => write!(f, "Sampling"),
            SessionState::FirmwareCalibrate => write!(f, "Calibrating"),
            SessionState::HealthEvaluation => write!(f, "Evaluating"),
            SessionState::Done => write!(f, "Done"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

struct Shared {
    progress: AtomicU32,
    state: AtomicU8,
    done: AtomicBool,
    failed: AtomicBool,
    message: Mutex<Option<String>>,
}

/// Writer half, owned by the session worker.
#[derive(Clone)]
pub struct ProgressSink {
    shared: Arc<Shared>,
}

impl ProgressSink {
    /// Set progress, clamped to 0..=100 and non-decreasing.
    pub fn set(&self, percent: u32) {
        let clamped = percent.min(100);
        self.shared.progress.fetch_max(clamped, Ordering::Release);
    }

    /// Add to progress, saturating at `cap`.
    pub fn bump(&self, delta: u32, cap: u32) {
        let current = self.shared.progress.load(Ordering::Acquire);
        if current < cap {
            self.set((current + delta).min(cap));
        }
    }

    pub fn get(&self) -> u32 {
        self.shared.progress.load(Ordering::Acquire)
    }

    /// Reset progress to zero for a fresh attempt. The only place the value
    /// may go backwards; phase boundaries within a run never do.
    pub fn reset(&self) {
        self.shared.progress.store(0, Ordering::Release);
        self.shared.done.store(false, Ordering::Release);
        self.shared.failed.store(false, Ordering::Release);
        self.shared.state.store(SessionState::Idle as u8, Ordering::Release);
        *self.shared.message.lock() = None;
    }

    pub fn enter(&self, state: SessionState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    pub fn finish(&self) {
        self.shared.progress.store(100, Ordering::Release);
        self.shared.state.store(SessionState::Done as u8, Ordering::Release);
        self.shared.done.store(true, Ordering::Release);
    }

    pub fn fail(&self, message: impl Into<String>) {
        *self.shared.message.lock() = Some(message.into());
        self.shared.state.store(SessionState::Failed as u8, Ordering::Release);
        self.shared.failed.store(true, Ordering::Release);
        self.shared.done.store(true, Ordering::Release);
    }
}

/// Reader half for the control thread.
#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

impl ProgressHandle {
    pub fn progress(&self) -> u32 {
        self.shared.progress.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn message(&self) -> Option<String> {
        self.shared.message.lock().clone()
    }
}

/// Create a connected sink/handle pair.
pub fn channel() -> (ProgressSink, ProgressHandle) {
    let shared = Arc::new(Shared {
        progress: AtomicU32::new(0),
        state: AtomicU8::new(SessionState::Idle as u8),
        done: AtomicBool::new(false),
        failed: AtomicBool::new(false),
        message: Mutex::new(None),
    });
    (
        ProgressSink {
            shared: shared.clone(),
        },
        ProgressHandle { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic() {
        let (sink, handle) = channel();
        sink.set(40);
        sink.set(20);
        assert_eq!(handle.progress(), 40);
        sink.set(100);
        assert_eq!(handle.progress(), 100);
    }

    #[test]
    fn bump_respects_cap() {
        let (sink, handle) = channel();
        for _ in 0..20 {
            sink.bump(3, 18);
        }
        assert_eq!(handle.progress(), 18);
    }

    #[test]
    fn failure_records_message() {
        let (sink, handle) = channel();
        sink.fail("target not visible");
        assert!(handle.is_failed());
        assert!(handle.is_done());
        assert_eq!(handle.message().as_deref(), Some("target not visible"));
        assert_eq!(handle.state(), SessionState::Failed);
    }
}
