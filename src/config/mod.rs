//! Persisted configuration store.
//!
//! Narrow get/set contract used for target dimensions, the measured tare
//! ground truth, and the per-device last-calibration timestamp. The JSON
//! file implementation is the default; embedders can supply their own
//! store.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Well-known configuration keys.
pub mod keys {
    /// Calibration target rectangle width, millimeters.
    pub const TARGET_WIDTH: &str = "calibration.target-width";
    /// Calibration target rectangle height, millimeters.
    pub const TARGET_HEIGHT: &str = "calibration.target-height";
    /// Measured tare ground-truth distance, millimeters.
    pub const GROUND_TRUTH: &str = "calibration.ground-truth";
    /// Prefix of the per-serial last-calibration timestamp.
    pub const LAST_CALIB_PREFIX: &str = "calibration.last-used";
}

/// Default target rectangle width, millimeters.
pub const DEFAULT_TARGET_WIDTH_MM: f32 = 175.0;
/// Default target rectangle height, millimeters.
pub const DEFAULT_TARGET_HEIGHT_MM: f32 = 100.0;
/// Default tare ground truth, millimeters.
pub const DEFAULT_GROUND_TRUTH_MM: f32 = 1200.0;

/// Key/value configuration persistence.
pub trait ConfigStore: Send + Sync {
    fn get_f32(&self, key: &str, default: f32) -> f32;
    fn set_f32(&self, key: &str, value: f32);
    fn get_i64(&self, key: &str, default: i64) -> i64;
    fn set_i64(&self, key: &str, value: i64);
}

/// JSON-file backed store, written through on every set.
pub struct JsonConfigStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonConfigStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Map<String, Value>>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open the store at the platform default location.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("depthcam-calibrator");
        std::fs::create_dir_all(&dir)?;
        Self::open(dir.join("config.json"))
    }

    fn flush(&self, values: &Map<String, Value>) {
        match serde_json::to_string_pretty(values) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    log::warn!("failed to write config {}: {e}", self.path.display());
                }
            }
            Err(e) => log::warn!("failed to serialize config: {e}"),
        }
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.flush(&values);
    }
}

impl ConfigStore for JsonConfigStore {
    fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.values
            .lock()
            .get(key)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    fn set_f32(&self, key: &str, value: f32) {
        self.set(key, Value::from(value as f64));
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .lock()
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    fn set_i64(&self, key: &str, value: i64) {
        self.set(key, Value::from(value));
    }
}

/// In-memory store for tests and embedders without persistence.
#[derive(Default)]
pub struct MemoryConfigStore {
    values: Mutex<Map<String, Value>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.values
            .lock()
            .get(key)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    fn set_f32(&self, key: &str, value: f32) {
        self.values.lock().insert(key.into(), Value::from(value as f64));
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .lock()
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    fn set_i64(&self, key: &str, value: i64) {
        self.values.lock().insert(key.into(), Value::from(value));
    }
}
