//! Time source abstraction for poll loops.
//!
//! Every timing-sensitive loop in the engine (frame polling, warmup
//! timeouts, settle delays) goes through a [`Clock`] so tests can run the
//! same code paths against a virtual clock without real sleeps.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Injected time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared clock handle passed through the engine.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Bounded poll: invokes `check` every `interval` until it yields a value
/// or `timeout` elapses.
pub fn poll_until<T>(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    let start = clock.now();
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if clock.now().duration_since(start) > timeout {
            return None;
        }
        clock.sleep(interval);
    }
}

/// Virtual clock for tests: `sleep` advances time without blocking.
pub mod test_support {
    use super::Clock;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    pub struct VirtualClock {
        now: Mutex<Instant>,
    }

    impl VirtualClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }
    }

    impl Default for VirtualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for VirtualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }

        fn sleep(&self, duration: Duration) {
            let mut now = self.now.lock();
            *now += duration;
        }
    }
}
