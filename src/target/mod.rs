//! Calibration-target detectors.
//!
//! Both detectors follow the same incremental contract: feed frames one at
//! a time, get [`DetectStatus::NeedMoreFrames`] for unusable frames,
//! [`DetectStatus::Progress`] while measurements accumulate, and
//! [`DetectStatus::Done`] once the frame budget is met. Results are
//! per-measurement medians, robust against single bad frames.

use crate::stream::frames::VideoFrame;

/// Incremental detection state reported per processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectStatus {
    /// Frame unusable (no target, low contrast); feed another one.
    NeedMoreFrames,
    /// Measurement extracted; more frames wanted.
    Progress,
    /// Enough measurements collected.
    Done,
}

/// Rectangle side lengths in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectSides {
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
}

impl RectSides {
    /// Width-to-height aspect ratio of the detected rectangle.
    pub fn aspect_ratio(&self) -> f32 {
        let vertical = self.left + self.right;
        if vertical > 0.1 {
            (self.top + self.bottom) / vertical
        } else {
            0.0
        }
    }
}

/// Minimum intensity spread for a frame to be considered lit.
const MIN_CONTRAST: u8 = 40;
/// Minimum accepted side length in pixels.
const MIN_SIDE_PX: f32 = 4.0;

fn median_of(mut values: Vec<f32>) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

/// Intensity statistics and binarization threshold for a Y8 frame.
fn luma_threshold(frame: &VideoFrame) -> Option<u8> {
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for &v in frame.data.iter() {
        min = min.min(v);
        max = max.max(v);
    }
    if max.saturating_sub(min) < MIN_CONTRAST {
        return None;
    }
    Some(min + (max - min) / 2)
}

/// Corner positions of the bright target blob: the extreme points along
/// the two image diagonals.
fn bright_corners(frame: &VideoFrame, threshold: u8) -> Option<[[f32; 2]; 4]> {
    let mut top_left: Option<(i64, u32, u32)> = None;
    let mut bottom_right: Option<(i64, u32, u32)> = None;
    let mut top_right: Option<(i64, u32, u32)> = None;
    let mut bottom_left: Option<(i64, u32, u32)> = None;
    let mut bright = 0u64;

    for y in 0..frame.height {
        for x in 0..frame.width {
            if frame.luma_at(x, y) < threshold {
                continue;
            }
            bright += 1;
            let sum = x as i64 + y as i64;
            let diff = x as i64 - y as i64;
            if top_left.map_or(true, |(s, _, _)| sum < s) {
                top_left = Some((sum, x, y));
            }
            if bottom_right.map_or(true, |(s, _, _)| sum > s) {
                bottom_right = Some((sum, x, y));
            }
            if top_right.map_or(true, |(d, _, _)| diff > d) {
                top_right = Some((diff, x, y));
            }
            if bottom_left.map_or(true, |(d, _, _)| diff < d) {
                bottom_left = Some((diff, x, y));
            }
        }
    }

    let total = (frame.width * frame.height) as u64;
    // A target fills a meaningful but not overwhelming part of the image.
    if bright < total / 100 || bright > total * 9 / 10 {
        return None;
    }

    let as_point = |c: Option<(i64, u32, u32)>| c.map(|(_, x, y)| [x as f32, y as f32]);
    Some([
        as_point(top_left)?,
        as_point(top_right)?,
        as_point(bottom_left)?,
        as_point(bottom_right)?,
    ])
}

fn distance(a: [f32; 2], b: [f32; 2]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    (dx * dx + dy * dy).sqrt()
}

/// Measure the target rectangle's sides in one intensity frame.
fn measure_rectangle(frame: &VideoFrame) -> Option<RectSides> {
    let threshold = luma_threshold(frame)?;
    let [tl, tr, bl, br] = bright_corners(frame, threshold)?;

    let sides = RectSides {
        top: distance(tl, tr),
        bottom: distance(bl, br),
        left: distance(tl, bl),
        right: distance(tr, br),
    };

    let all_sane = [sides.top, sides.bottom, sides.left, sides.right]
        .iter()
        .all(|&s| s > MIN_SIDE_PX);
    all_sane.then_some(sides)
}

/// Accumulating target-rectangle detector.
pub struct RectDetector {
    tops: Vec<f32>,
    bottoms: Vec<f32>,
    lefts: Vec<f32>,
    rights: Vec<f32>,
}

impl RectDetector {
    /// Successful measurements required before `Done`.
    pub const FRAME_COUNT: usize = 25;

    pub fn new() -> Self {
        Self {
            tops: Vec::with_capacity(Self::FRAME_COUNT),
            bottoms: Vec::with_capacity(Self::FRAME_COUNT),
            lefts: Vec::with_capacity(Self::FRAME_COUNT),
            rights: Vec::with_capacity(Self::FRAME_COUNT),
        }
    }

    pub fn process(&mut self, frame: &VideoFrame) -> DetectStatus {
        let Some(sides) = measure_rectangle(frame) else {
            return DetectStatus::NeedMoreFrames;
        };
        self.tops.push(sides.top);
        self.bottoms.push(sides.bottom);
        self.lefts.push(sides.left);
        self.rights.push(sides.right);
        if self.tops.len() >= Self::FRAME_COUNT {
            DetectStatus::Done
        } else {
            DetectStatus::Progress
        }
    }

    /// Per-side medians over the accumulated measurements.
    pub fn sides(&self) -> Option<RectSides> {
        if self.tops.is_empty() {
            return None;
        }
        Some(RectSides {
            top: median_of(self.tops.clone()),
            bottom: median_of(self.bottoms.clone()),
            left: median_of(self.lefts.clone()),
            right: median_of(self.rights.clone()),
        })
    }
}

impl Default for RectDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulating detector for the four dark dots inside the target, ordered
/// top-left, top-right, bottom-left, bottom-right.
pub struct DotsDetector {
    samples: Vec<[[f32; 2]; 4]>,
}

impl DotsDetector {
    /// Successful measurements required before `Done`.
    pub const FRAME_COUNT: usize = 25;
    /// Minimum dark pixels per quadrant for a dot fix.
    const MIN_DOT_PIXELS: u32 = 4;

    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(Self::FRAME_COUNT),
        }
    }

    pub fn process(&mut self, frame: &VideoFrame) -> DetectStatus {
        let Some(centers) = Self::measure_dots(frame) else {
            return DetectStatus::NeedMoreFrames;
        };
        self.samples.push(centers);
        if self.samples.len() >= Self::FRAME_COUNT {
            DetectStatus::Done
        } else {
            DetectStatus::Progress
        }
    }

    /// Median dot centers over the accumulated measurements.
    pub fn centers(&self) -> Option<[[f32; 2]; 4]> {
        if self.samples.is_empty() {
            return None;
        }
        let mut result = [[0.0f32; 2]; 4];
        for (dot, slot) in result.iter_mut().enumerate() {
            for (axis, value) in slot.iter_mut().enumerate() {
                *value = median_of(self.samples.iter().map(|s| s[dot][axis]).collect());
            }
        }
        Some(result)
    }

    /// Locate dark dot centroids in the four quadrants of the bright
    /// target region.
    fn measure_dots(frame: &VideoFrame) -> Option<[[f32; 2]; 4]> {
        let threshold = luma_threshold(frame)?;
        let [tl, tr, bl, br] = bright_corners(frame, threshold)?;

        let min_x = tl[0].min(bl[0]) as u32;
        let max_x = tr[0].max(br[0]) as u32;
        let min_y = tl[1].min(tr[1]) as u32;
        let max_y = bl[1].max(br[1]) as u32;
        if max_x <= min_x + 1 || max_y <= min_y + 1 {
            return None;
        }

        let mid_x = (min_x + max_x) / 2;
        let mid_y = (min_y + max_y) / 2;
        let quadrants = [
            (min_x, mid_x, min_y, mid_y), // top-left
            (mid_x, max_x, min_y, mid_y), // top-right
            (min_x, mid_x, mid_y, max_y), // bottom-left
            (mid_x, max_x, mid_y, max_y), // bottom-right
        ];

        let mut centers = [[0.0f32; 2]; 4];
        for (slot, &(x0, x1, y0, y1)) in centers.iter_mut().zip(quadrants.iter()) {
            let mut count = 0u32;
            let mut sum_x = 0.0f64;
            let mut sum_y = 0.0f64;
            for y in y0..=y1 {
                for x in x0..=x1 {
                    if frame.luma_at(x, y) < threshold {
                        count += 1;
                        sum_x += x as f64;
                        sum_y += y as f64;
                    }
                }
            }
            if count < Self::MIN_DOT_PIXELS {
                return None;
            }
            *slot = [
                (sum_x / count as f64) as f32,
                (sum_y / count as f64) as f32,
            ];
        }
        Some(centers)
    }
}

impl Default for DotsDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PixelFormat;
    use bytes::Bytes;
    use std::time::Instant;

    fn intensity_frame(width: u32, height: u32, paint: impl Fn(u32, u32) -> u8) -> VideoFrame {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(paint(x, y));
            }
        }
        VideoFrame {
            stream: 0,
            format: PixelFormat::Y8,
            width,
            height,
            data: Bytes::from(data),
            frame_counter: None,
            arrived: Instant::now(),
        }
    }

    /// Bright rectangle on dark background, optionally with four dark dots.
    fn target_frame(dots: bool) -> VideoFrame {
        intensity_frame(160, 120, |x, y| {
            let inside = (40..120).contains(&x) && (30..90).contains(&y);
            if !inside {
                return 10;
            }
            if dots {
                let dot = |cx: u32, cy: u32| {
                    x.abs_diff(cx) <= 2 && y.abs_diff(cy) <= 2
                };
                if dot(55, 45) || dot(105, 45) || dot(55, 75) || dot(105, 75) {
                    return 15;
                }
            }
            220
        })
    }

    #[test]
    fn rectangle_sides_match_synthetic_target() {
        let mut detector = RectDetector::new();
        let frame = target_frame(false);
        for i in 0..RectDetector::FRAME_COUNT {
            let status = detector.process(&frame);
            if i + 1 < RectDetector::FRAME_COUNT {
                assert_eq!(status, DetectStatus::Progress);
            } else {
                assert_eq!(status, DetectStatus::Done);
            }
        }
        let sides = detector.sides().unwrap();
        // 40..120 exclusive -> 79 px span, 30..90 -> 59 px span.
        assert!((sides.top - 79.0).abs() < 1.5, "top {}", sides.top);
        assert!((sides.bottom - 79.0).abs() < 1.5);
        assert!((sides.left - 59.0).abs() < 1.5);
        assert!((sides.right - 59.0).abs() < 1.5);
    }

    #[test]
    fn flat_frame_needs_more_frames() {
        let mut detector = RectDetector::new();
        let frame = intensity_frame(64, 48, |_, _| 128);
        assert_eq!(detector.process(&frame), DetectStatus::NeedMoreFrames);
        assert!(detector.sides().is_none());
    }

    #[test]
    fn dots_are_located_in_quadrants() {
        let mut detector = DotsDetector::new();
        let frame = target_frame(true);
        for _ in 0..DotsDetector::FRAME_COUNT {
            detector.process(&frame);
        }
        let centers = detector.centers().unwrap();
        let expected = [[55.0, 45.0], [105.0, 45.0], [55.0, 75.0], [105.0, 75.0]];
        for (got, want) in centers.iter().zip(expected.iter()) {
            assert!((got[0] - want[0]).abs() < 1.0, "{got:?} vs {want:?}");
            assert!((got[1] - want[1]).abs() < 1.0, "{got:?} vs {want:?}");
        }
    }

    #[test]
    fn aspect_ratio_of_wide_target() {
        let sides = RectSides {
            top: 80.0,
            bottom: 80.0,
            left: 40.0,
            right: 40.0,
        };
        assert!((sides.aspect_ratio() - 2.0).abs() < 1e-6);
    }
}
