//! Frame types, per-stream queues and the last-frame cache.
//!
//! The capture side (an external thread owned by the stream runtime) feeds
//! both a bounded queue, consumed during harvesting, and a single-slot
//! cache polled by `fetch_depth_frame`.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use super::{PixelFormat, StreamId};

/// A single decoded frame from one stream.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub stream: StreamId,
    pub format: PixelFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Raw pixel data. Z16 is little-endian u16 per pixel, Y8 one byte per
    /// pixel, RGB8 three bytes per pixel.
    pub data: Bytes,
    /// Firmware frame counter, when the stream carries the metadata.
    pub frame_counter: Option<i64>,
    /// Host arrival timestamp.
    pub arrived: Instant,
}

impl VideoFrame {
    /// Depth value at `(x, y)` for a Z16 frame, zero outside the image.
    pub fn depth_at(&self, x: u32, y: u32) -> u16 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        let idx = ((y * self.width + x) * 2) as usize;
        if idx + 1 >= self.data.len() {
            return 0;
        }
        u16::from_le_bytes([self.data[idx], self.data[idx + 1]])
    }

    /// Intensity at `(x, y)` for a Y8 frame, zero outside the image.
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        self.data
            .get((y * self.width + x) as usize)
            .copied()
            .unwrap_or(0)
    }
}

/// Producer half of a per-stream frame queue.
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<VideoFrame>,
}

impl FrameSender {
    /// Enqueue a frame, dropping the oldest pending frame when full so the
    /// producer never blocks the capture thread.
    pub fn push(&self, frame: VideoFrame, rx: &FrameReceiver) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let _ = rx.rx.try_recv();
                let _ = self.tx.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Consumer half of a per-stream frame queue.
#[derive(Clone)]
pub struct FrameReceiver {
    rx: Receiver<VideoFrame>,
}

impl FrameReceiver {
    /// Block until a frame arrives. `None` means the producer shut down;
    /// callers treat it as "no frame" and keep retrying.
    pub fn wait_for_frame(&self) -> Option<VideoFrame> {
        self.rx.recv().ok()
    }

    /// Non-blocking variant used by drain loops.
    pub fn try_frame(&self) -> Option<VideoFrame> {
        self.rx.try_recv().ok()
    }
}

/// Create a bounded frame queue.
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = bounded(capacity);
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Single-slot cache holding the most recent frame of a stream, plus its
/// arrival instant for freshness checks.
#[derive(Clone, Default)]
pub struct LastFrameCache {
    slot: Arc<Mutex<Option<VideoFrame>>>,
}

impl LastFrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: VideoFrame) {
        *self.slot.lock() = Some(frame);
    }

    pub fn latest(&self) -> Option<VideoFrame> {
        self.slot.lock().clone()
    }

    pub fn arrived_at(&self) -> Option<Instant> {
        self.slot.lock().as_ref().map(|f| f.arrived)
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_frame(values: &[u16], width: u32, height: u32) -> VideoFrame {
        let mut data = Vec::with_capacity(values.len() * 2);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        VideoFrame {
            stream: 0,
            format: PixelFormat::Z16,
            width,
            height,
            data: Bytes::from(data),
            frame_counter: None,
            arrived: Instant::now(),
        }
    }

    #[test]
    fn depth_decoding_is_little_endian() {
        let frame = depth_frame(&[0, 1000, 0, 65535], 2, 2);
        assert_eq!(frame.depth_at(1, 0), 1000);
        assert_eq!(frame.depth_at(1, 1), 65535);
        assert_eq!(frame.depth_at(5, 5), 0);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (tx, rx) = frame_queue(2);
        for counter in 0..4 {
            let mut frame = depth_frame(&[0], 1, 1);
            frame.frame_counter = Some(counter);
            tx.push(frame, &rx);
        }
        let first = rx.wait_for_frame().unwrap();
        assert_eq!(first.frame_counter, Some(2));
    }

    #[test]
    fn cache_returns_latest() {
        let cache = LastFrameCache::new();
        assert!(cache.latest().is_none());
        cache.publish(depth_frame(&[7], 1, 1));
        assert_eq!(cache.latest().unwrap().depth_at(0, 0), 7);
    }
}
