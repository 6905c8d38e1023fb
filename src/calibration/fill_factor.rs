//! Fill-factor statistics fed to the host-assisted on-chip routine.
//!
//! Each firmware frame-counter tick gets one slot holding the percentage
//! (×10000) of valid depth pixels inside the sampling window. Ticks the
//! host missed stay zero and are repaired before upload.

use crate::error::{CalibrationError, Result};
use crate::stream::frames::VideoFrame;

/// Fixed capacity of the firmware-side table.
pub const TABLE_CAPACITY: usize = 256;

/// Pixel window the sampler counts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleWindow {
    pub x0: u32,
    pub y0: u32,
    pub width: u32,
    pub rows: u32,
}

impl SampleWindow {
    /// Central fifth-of-frame window used by the intrinsic scan.
    pub fn center(frame_width: u32, frame_height: u32) -> Self {
        let roi_w = frame_width / 5;
        let roi_h = frame_height / 5;
        Self {
            x0: 2 * roi_w,
            y0: 2 * roi_h,
            width: roi_w,
            rows: roi_h,
        }
    }

    /// Five-row band used by the focal-length scan; `scan_location` 1 moves
    /// the band to the bottom of the central window.
    pub fn focal_band(frame_width: u32, frame_height: u32, scan_location: u32) -> Self {
        let roi_w = frame_width / 5;
        let roi_h = frame_height / 5;
        let mut y0 = 2 * roi_h;
        if scan_location == 1 {
            y0 += roi_h - 5;
        }
        Self {
            x0: 2 * roi_w,
            y0,
            width: roi_w,
            rows: 5,
        }
    }

    pub fn area(&self) -> u32 {
        self.width * self.rows
    }
}

/// Count valid depth pixels in the window and normalize to 0..=10000.
pub fn sample_fill_factor(frame: &VideoFrame, window: SampleWindow) -> u16 {
    let mut valid = 0u32;
    for y in window.y0..window.y0 + window.rows {
        for x in window.x0..window.x0 + window.width {
            if frame.depth_at(x, y) != 0 {
                valid += 1;
            }
        }
    }
    let ratio = valid as f32 / window.area() as f32;
    (ratio * 10000.0 + 0.5) as u16
}

/// Per-tick occupancy table indexed by the firmware frame counter.
#[derive(Debug, Clone)]
pub struct FillFactorTable {
    slots: [u16; TABLE_CAPACITY],
    len: usize,
}

impl FillFactorTable {
    /// A table expecting `len` counter ticks.
    pub fn new(len: usize) -> Self {
        Self {
            slots: [0; TABLE_CAPACITY],
            len: len.min(TABLE_CAPACITY),
        }
    }

    pub fn record(&mut self, tick: usize, value: u16) {
        if tick < self.len {
            self.slots[tick] = value;
        }
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.slots[..self.len]
    }

    /// Repair missed ticks so no zero entries remain: leading zeros copy
    /// the first sample, interior gaps interpolate linearly, trailing zeros
    /// extend the last sample. Fails when the whole table is empty.
    pub fn fill_missing_data(&mut self) -> Result<()> {
        fill_missing_data(&mut self.slots[..self.len])
    }
}

/// Gap repair over a raw slice; see [`FillFactorTable::fill_missing_data`].
pub fn fill_missing_data(data: &mut [u16]) -> Result<()> {
    let first = data
        .iter()
        .position(|&v| v != 0)
        .ok_or_else(|| {
            CalibrationError::InsufficientData(
                "There is not enough valid data in the fill-factor table".into(),
            )
        })?;

    let first_value = data[first];
    for slot in &mut data[..first] {
        *slot = first_value;
    }

    let mut i = first + 1;
    while i < data.len() {
        if data[i] != 0 {
            i += 1;
            continue;
        }
        let gap_start = i;
        let mut gap_end = i;
        while gap_end < data.len() && data[gap_end] == 0 {
            gap_end += 1;
        }

        if gap_end == data.len() {
            // Trailing run: extend the last known sample.
            let last = data[gap_start - 1];
            for slot in &mut data[gap_start..] {
                *slot = last;
            }
            break;
        }

        let prev = data[gap_start - 1] as f32;
        let next = data[gap_end] as f32;
        let span = (gap_end - gap_start + 1) as f32;
        for (step, idx) in (gap_start..gap_end).enumerate() {
            data[idx] = (prev + (next - prev) * (step as f32 + 1.0) / span + 0.5) as u16;
        }
        i = gap_end + 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PixelFormat;
    use bytes::Bytes;
    use std::time::Instant;

    #[test]
    fn all_zero_table_fails() {
        let mut data = [0u16; 16];
        assert!(fill_missing_data(&mut data).is_err());
    }

    #[test]
    fn leading_gap_copies_first_sample() {
        let mut data = [0, 0, 0, 4000, 5000];
        fill_missing_data(&mut data).unwrap();
        assert_eq!(data, [4000, 4000, 4000, 4000, 5000]);
    }

    #[test]
    fn interior_gap_interpolates_linearly() {
        let mut data = [1000, 0, 0, 0, 5000];
        fill_missing_data(&mut data).unwrap();
        assert_eq!(data, [1000, 2000, 3000, 4000, 5000]);
    }

    #[test]
    fn trailing_gap_extends_last_sample() {
        let mut data = [1000, 2000, 0, 0];
        fill_missing_data(&mut data).unwrap();
        assert_eq!(data, [1000, 2000, 2000, 2000]);
    }

    #[test]
    fn non_zero_entries_are_never_touched() {
        let mut data = [0, 700, 0, 900, 0, 0, 300, 0];
        let original = data;
        fill_missing_data(&mut data).unwrap();
        assert!(data.iter().all(|&v| v != 0));
        for (i, &v) in original.iter().enumerate() {
            if v != 0 {
                assert_eq!(data[i], v, "slot {i} changed");
            }
        }
    }

    #[test]
    fn sampler_counts_valid_pixels() {
        // 10x10 frame, left half valid.
        let mut raw = Vec::new();
        for _ in 0..10u32 {
            for x in 0..10u32 {
                let v: u16 = if x < 5 { 1200 } else { 0 };
                raw.extend_from_slice(&v.to_le_bytes());
            }
        }
        let frame = VideoFrame {
            stream: 0,
            format: PixelFormat::Z16,
            width: 10,
            height: 10,
            data: Bytes::from(raw),
            frame_counter: None,
            arrived: Instant::now(),
        };
        let window = SampleWindow {
            x0: 0,
            y0: 0,
            width: 10,
            rows: 10,
        };
        assert_eq!(sample_fill_factor(&frame, window), 5000);
    }

    #[test]
    fn table_records_within_bounds() {
        let mut table = FillFactorTable::new(4);
        table.record(0, 100);
        table.record(3, 400);
        table.record(10, 999);
        assert_eq!(table.as_slice(), &[100, 0, 0, 400]);
        table.fill_missing_data().unwrap();
        assert_eq!(table.as_slice(), &[100, 200, 300, 400]);
    }
}
