//! End-to-end session runs against mock collaborators: a synthetic flat
//! wall, a scripted firmware protocol and an in-memory device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use depthcam_calibrator::calibration::{
    Action, CalibrationEngine, CalibrationSession, Collaborators,
};
use depthcam_calibrator::camera::{CameraIntrinsics, Extrinsics};
use depthcam_calibrator::clock::system_clock;
use depthcam_calibrator::config::MemoryConfigStore;
use depthcam_calibrator::device::{
    CalibrationProtocol, CameraInfo, DebugProtocol, DeviceControl, DeviceOption,
    FocalLengthOutcome, ProgressFn,
};
use depthcam_calibrator::error::Result;
use depthcam_calibrator::stream::frames::{frame_queue, FrameReceiver, VideoFrame};
use depthcam_calibrator::stream::select::{StreamConfigurator, StreamPlan};
use depthcam_calibrator::stream::{
    DirectInvoker, PixelFormat, SensorKind, SensorSelection, StreamId, StreamRuntime,
};

const FRAME_WIDTH: u32 = 320;
const FRAME_HEIGHT: u32 = 240;
const WALL_DEPTH_MM: u16 = 1000;

/// Device with emitter + thermal options and fixed descriptors.
struct MockDevice {
    options: Mutex<HashMap<DeviceOption, f32>>,
}

impl MockDevice {
    fn new() -> Self {
        let mut options = HashMap::new();
        options.insert(DeviceOption::EmitterEnabled, 1.0);
        options.insert(DeviceOption::ThermalCompensation, 1.0);
        Self {
            options: Mutex::new(options),
        }
    }
}

impl DeviceControl for MockDevice {
    fn supports_option(&self, option: DeviceOption) -> bool {
        self.options.lock().contains_key(&option)
    }

    fn get_option(&self, option: DeviceOption) -> Result<f32> {
        Ok(*self.options.lock().get(&option).unwrap_or(&0.0))
    }

    fn set_option(&self, option: DeviceOption, value: f32) -> Result<()> {
        self.options.lock().insert(option, value);
        Ok(())
    }

    fn camera_info(&self, info: CameraInfo) -> Option<String> {
        match info {
            CameraInfo::SerialNumber => Some("0123456789".into()),
            CameraInfo::ProductId => Some("0B07".into()),
            CameraInfo::UsbTypeDescriptor => Some("3.2".into()),
        }
    }
}

/// Firmware protocol double. The on-chip scan-only call resets the shared
/// frame counter the way firmware restarts its frame numbering when a
/// calibration phase begins.
struct MockProtocol {
    frame_counter: Arc<AtomicI64>,
    applied_tables: Mutex<Vec<Vec<u8>>>,
    received_json: Mutex<Vec<String>>,
    persisted: AtomicBool,
}

impl MockProtocol {
    fn new(frame_counter: Arc<AtomicI64>) -> Self {
        Self {
            frame_counter,
            applied_tables: Mutex::new(Vec::new()),
            received_json: Mutex::new(Vec::new()),
            persisted: AtomicBool::new(false),
        }
    }

    fn new_table() -> Vec<u8> {
        vec![0xA5; 512]
    }
}

impl CalibrationProtocol for MockProtocol {
    fn calibration_table(&self) -> Result<Vec<u8>> {
        Ok(vec![0x5A; 512])
    }

    fn set_calibration_table(&self, table: &[u8]) -> Result<()> {
        self.applied_tables.lock().push(table.to_vec());
        Ok(())
    }

    fn write_calibration(&self) -> Result<()> {
        self.persisted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn run_on_chip_calibration(
        &self,
        json: &str,
        progress: ProgressFn,
        _timeout: Duration,
    ) -> Result<(Vec<u8>, f32)> {
        self.received_json.lock().push(json.to_string());
        let doc: Value = serde_json::from_str(json).unwrap();

        if doc.get("step count v3").is_some() {
            // Host statistics upload completes the calibration.
            progress(100.0);
            return Ok((Self::new_table(), 0.22));
        }

        if doc["host assistance"].as_i64() == Some(1) {
            // Scan-only kick-off: firmware restarts its frame numbering.
            self.frame_counter.store(0, Ordering::SeqCst);
            return Ok((Vec::new(), 0.0));
        }

        progress(100.0);
        Ok((Self::new_table(), 0.22))
    }

    fn run_tare_calibration(
        &self,
        _ground_truth_mm: f32,
        json: &str,
        progress: ProgressFn,
        _timeout: Duration,
    ) -> Result<(Vec<u8>, [f32; 2])> {
        self.received_json.lock().push(json.to_string());
        progress(100.0);
        Ok((Self::new_table(), [0.001, -0.002]))
    }

    fn run_focal_length_calibration(
        &self,
        _left: &[VideoFrame],
        _right: &[VideoFrame],
        _target_width_mm: f32,
        _target_height_mm: f32,
        _adjust_both_sides: bool,
        progress: ProgressFn,
    ) -> Result<FocalLengthOutcome> {
        progress(100.0);
        Ok(FocalLengthOutcome {
            table: Self::new_table(),
            ratio: 0.5,
            tilt_angle: 0.1,
        })
    }

    fn run_uv_map_calibration(
        &self,
        _left: &[VideoFrame],
        _color: &[VideoFrame],
        _depth: &[VideoFrame],
        _py_px_only: bool,
        progress: ProgressFn,
    ) -> Result<(Vec<u8>, [f32; 4])> {
        progress(100.0);
        Ok((Self::new_table(), [0.1, 0.1, 0.1, 0.1]))
    }
}

impl DebugProtocol for MockProtocol {
    fn send_and_receive(&self, _command: &[u8]) -> Result<Vec<u8>> {
        Ok(0i32.to_le_bytes().to_vec())
    }
}

/// Stream runtime serving a synthetic flat wall on every stream, with a
/// monotonically increasing firmware frame counter.
struct MockRuntime {
    frame_counter: Arc<AtomicI64>,
    streaming: Mutex<HashMap<SensorKind, SensorSelection>>,
    /// Allowed (width, height, fps) combinations; empty allows everything.
    allowed: Vec<(u32, u32, u32)>,
    fps_values: Vec<u32>,
}

impl MockRuntime {
    fn new(frame_counter: Arc<AtomicI64>) -> Self {
        Self {
            frame_counter,
            streaming: Mutex::new(HashMap::new()),
            allowed: Vec::new(),
            fps_values: vec![30, 60, 90],
        }
    }

    fn restricted(allowed: Vec<(u32, u32, u32)>, fps_values: Vec<u32>) -> Self {
        Self {
            frame_counter: Arc::new(AtomicI64::new(0)),
            streaming: Mutex::new(HashMap::new()),
            allowed,
            fps_values,
        }
    }

    fn wall_frame(&self, stream: StreamId) -> VideoFrame {
        let counter = self.frame_counter.fetch_add(1, Ordering::SeqCst);
        let mut data = Vec::with_capacity((FRAME_WIDTH * FRAME_HEIGHT * 2) as usize);
        for _ in 0..FRAME_WIDTH * FRAME_HEIGHT {
            data.extend_from_slice(&WALL_DEPTH_MM.to_le_bytes());
        }
        VideoFrame {
            stream,
            format: PixelFormat::Z16,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            data: Bytes::from(data),
            frame_counter: Some(counter),
            arrived: Instant::now(),
        }
    }
}

impl StreamRuntime for MockRuntime {
    fn formats(&self, sensor: SensorKind) -> Vec<(StreamId, Vec<PixelFormat>)> {
        match sensor {
            SensorKind::Depth => vec![
                (0, vec![PixelFormat::Z16]),
                (1, vec![PixelFormat::Y8]),
                (2, vec![PixelFormat::Y8]),
            ],
            SensorKind::Color => vec![(3, vec![PixelFormat::Rgb8])],
        }
    }

    fn supported_resolutions(&self, _sensor: SensorKind) -> Vec<(u32, u32)> {
        vec![(1280, 720), (848, 480), (640, 480), (320, 240), (256, 144)]
    }

    fn supported_fps(&self, _sensor: SensorKind) -> Vec<u32> {
        self.fps_values.clone()
    }

    fn is_supported(&self, _sensor: SensorKind, selection: &SensorSelection) -> bool {
        self.allowed.is_empty()
            || self
                .allowed
                .contains(&(selection.width, selection.height, selection.fps))
    }

    fn play(&self, sensor: SensorKind, selection: &SensorSelection) -> Result<()> {
        self.streaming.lock().insert(sensor, selection.clone());
        Ok(())
    }

    fn stop(&self, sensor: SensorKind) {
        self.streaming.lock().remove(&sensor);
    }

    fn selection(&self, sensor: SensorKind) -> Option<SensorSelection> {
        self.streaming.lock().get(&sensor).cloned()
    }

    fn is_streaming(&self, sensor: SensorKind) -> bool {
        self.streaming.lock().contains_key(&sensor)
    }

    fn last_frame_at(&self, _stream: StreamId) -> Option<Instant> {
        Some(Instant::now())
    }

    fn last_frame(&self, stream: StreamId) -> Option<VideoFrame> {
        Some(self.wall_frame(stream))
    }

    fn frame_queue(&self, _stream: StreamId) -> FrameReceiver {
        // Queue-based harvesting is not exercised by these scenarios.
        frame_queue(1).1
    }

    fn intrinsics(&self, _stream: StreamId) -> Option<CameraIntrinsics> {
        Some(CameraIntrinsics {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            fx: 200.0,
            fy: 200.0,
            ppx: FRAME_WIDTH as f32 / 2.0,
            ppy: FRAME_HEIGHT as f32 / 2.0,
        })
    }

    fn extrinsics(&self, _from: StreamId, _to: StreamId) -> Option<Extrinsics> {
        Some(Extrinsics::IDENTITY)
    }

    fn depth_unit_mm(&self) -> f32 {
        1.0
    }

    fn stereo_baseline_mm(&self) -> f32 {
        50.0
    }
}

struct Rig {
    engine: CalibrationEngine,
    device: Arc<MockDevice>,
    protocol: Arc<MockProtocol>,
}

fn rig() -> Rig {
    let counter = Arc::new(AtomicI64::new(0));
    let device = Arc::new(MockDevice::new());
    let protocol = Arc::new(MockProtocol::new(counter.clone()));
    let runtime = Arc::new(MockRuntime::new(counter));

    let links = Collaborators {
        device: device.clone(),
        protocol: protocol.clone(),
        runtime,
        invoker: Arc::new(DirectInvoker),
        config: Arc::new(MemoryConfigStore::new()),
        clock: system_clock(),
    };

    Rig {
        engine: CalibrationEngine::new(links),
        device,
        protocol,
    }
}

#[test]
fn on_chip_session_runs_to_done_and_restores_options() {
    let rig = rig();

    let mut session = CalibrationSession::new(Action::OnChip);
    session.params.speed = 2;
    assert_eq!(session.params.total_frames(), 256);

    let handle = rig.engine.start(session).expect("worker spawn");

    let mut observed = Vec::new();
    while !handle.progress.is_done() {
        observed.push(handle.progress.progress());
        std::thread::sleep(Duration::from_millis(2));
    }
    observed.push(handle.progress.progress());

    assert!(
        observed.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {observed:?}"
    );
    assert_eq!(*observed.last().unwrap(), 100);
    assert!(!handle.progress.is_failed());

    let (session, result) = handle.join();
    result.expect("session should succeed");

    assert_eq!(session.health_1, Some(0.22));
    assert_eq!(session.new_table, MockProtocol::new_table());

    // A perfect synthetic wall: full fill, negligible noise.
    let before = session.metrics_before.expect("before metrics");
    let after = session.metrics_after.expect("after metrics");
    assert!((before.fill_rate - 100.0).abs() < 0.1);
    assert!(before.rms_percent < 0.1);
    assert!((after.fill_rate - 100.0).abs() < 0.1);

    // The candidate table was applied before the after-metrics capture.
    let applied = rig.protocol.applied_tables.lock();
    assert_eq!(applied.last().unwrap(), &MockProtocol::new_table());

    // Emitter and thermal compensation are back at their pre-session
    // values, even though the run overrode them.
    assert_eq!(
        rig.device.get_option(DeviceOption::EmitterEnabled).unwrap(),
        1.0
    );
    assert_eq!(
        rig.device
            .get_option(DeviceOption::ThermalCompensation)
            .unwrap(),
        1.0
    );
}

#[test]
fn host_assisted_scan_uploads_fill_factors() {
    let rig = rig();

    let mut session = CalibrationSession::new(Action::OnChip);
    session.params.speed = 0; // 60-frame budget keeps the scan short
    session.host_assistance = true;

    let handle = rig.engine.start(session).expect("worker spawn");
    let (session, result) = handle.join();
    result.expect("host-assisted session should succeed");
    assert_eq!(session.health_1, Some(0.22));

    let received = rig.protocol.received_json.lock();
    // First document: scan-only kick-off.
    let kick_off: Value = serde_json::from_str(&received[0]).unwrap();
    assert_eq!(kick_off["calib type"], 0);
    assert_eq!(kick_off["host assistance"], 1);

    // Second document: the repaired fill-factor table, one slot per tick.
    let upload: Value = serde_json::from_str(&received[1]).unwrap();
    assert_eq!(upload["host assistance"], 2);
    assert_eq!(upload["step count v3"], 60);
    for tick in 0..60 {
        let key = format!("fill factor {tick}");
        let value = upload[key.as_str()]
            .as_i64()
            .unwrap_or_else(|| panic!("missing fill factor {tick}"));
        assert!(value > 0, "tick {tick} left unrepaired");
    }
}

#[test]
fn unsupported_fps_falls_back_to_alternate_fps() {
    let runtime = MockRuntime::restricted(
        vec![(1280, 720, 30), (640, 480, 30), (640, 480, 60)],
        vec![30, 60],
    );
    let clock = system_clock();
    let invoker = DirectInvoker;
    let configurator = StreamConfigurator::new(&runtime, &invoker, &*clock);

    let active = configurator
        .start(StreamPlan::Depth, 1280, 720, 90)
        .expect("negotiation should succeed");
    assert_eq!(
        (active.depth.width, active.depth.height, active.depth.fps),
        (1280, 720, 30)
    );
}

#[test]
fn unsupported_resolution_falls_back_to_vga() {
    let runtime = MockRuntime::restricted(vec![(640, 480, 30)], vec![30, 60]);
    let clock = system_clock();
    let invoker = DirectInvoker;
    let configurator = StreamConfigurator::new(&runtime, &invoker, &*clock);

    let active = configurator
        .start(StreamPlan::Depth, 960, 540, 90)
        .expect("negotiation should succeed");
    assert_eq!(
        (active.depth.width, active.depth.height, active.depth.fps),
        (640, 480, 30)
    );
}
