//! Frame Acquisition Adapter.
//!
//! Read-only polling of the runtime's last-frame cache. Harvest loops that
//! need every frame use the per-stream queues instead
//! (`FrameReceiver::wait_for_frame`).

use std::time::Duration;

use crate::clock::{poll_until, Clock};
use crate::error::{CalibrationError, Result};
use crate::stream::frames::VideoFrame;
use crate::stream::{StreamId, StreamRuntime};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const FRESHNESS: Duration = Duration::from_millis(100);

/// Default timeout for synchronous single-frame fetches.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(3000);

/// Polls the active streams' last-frame cache.
pub struct FrameFetcher<'a> {
    runtime: &'a dyn StreamRuntime,
    clock: &'a dyn Clock,
    streams: Vec<StreamId>,
}

impl<'a> FrameFetcher<'a> {
    pub fn new(runtime: &'a dyn StreamRuntime, clock: &'a dyn Clock, streams: Vec<StreamId>) -> Self {
        Self {
            runtime,
            clock,
            streams,
        }
    }

    /// Return the first frame on any watched stream whose arrival is within
    /// 100 ms of now, polling at a 10 ms cadence.
    pub fn fetch_depth_frame(&self, timeout: Duration) -> Result<VideoFrame> {
        poll_until(self.clock, POLL_INTERVAL, timeout, || {
            let now = self.clock.now();
            self.streams.iter().find_map(|&stream| {
                let fresh = self
                    .runtime
                    .last_frame_at(stream)
                    .is_some_and(|at| now.duration_since(at) < FRESHNESS);
                if fresh {
                    self.runtime.last_frame(stream)
                } else {
                    None
                }
            })
        })
        .ok_or(CalibrationError::Timeout(
            timeout.as_millis() as u64,
            "depth frame",
        ))
    }
}
