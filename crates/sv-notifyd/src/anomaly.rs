use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const BASELINES_FILE: &str = "baselines.json";
const MODEL_STATE_FILE: &str = "model_state.json";
/// Flush to disk every N training updates.
const SAVE_EVERY: u32 = 50;
const MODEL_VERSION: &str = "baseline-v1";

// ---------------------------------------------------------------------------
// LatencyStats — Welford streaming mean/variance
// ---------------------------------------------------------------------------

/// Streaming mean/variance over observed samples (Welford's algorithm),
/// plus min/max extremes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl LatencyStats {
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);

        self.min_value = Some(self.min_value.map_or(x, |m| m.min(x)));
        self.max_value = Some(self.max_value.map_or(x, |m| m.max(x)));
    }

    /// Sample variance; zero until two samples exist.
    pub fn variance(&self) -> f64 {
        if self.count >= 2 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

// ---------------------------------------------------------------------------
// RatioStat — running fraction
// ---------------------------------------------------------------------------

/// Running fraction over observed samples. Packet loss only needs the
/// long-run average; variance and extremes would be noise on a percentage
/// series, so this carries a count and a mean and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatioStat {
    pub count: u64,
    pub mean: f64,
}

impl RatioStat {
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        self.mean += (x - self.mean) / self.count as f64;
    }
}

// ---------------------------------------------------------------------------
// DeviceStats
// ---------------------------------------------------------------------------

/// Per-device baseline state, updated from every health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStats {
    pub device_ip: String,
    #[serde(default)]
    pub latency: LatencyStats,
    #[serde(default)]
    pub packet_loss: RatioStat,
    #[serde(default)]
    pub total_checks: u64,
    #[serde(default)]
    pub successful_checks: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceStats {
    pub fn new(device_ip: impl Into<String>) -> Self {
        Self {
            device_ip: device_ip.into(),
            latency: LatencyStats::default(),
            packet_loss: RatioStat::default(),
            total_checks: 0,
            successful_checks: 0,
            consecutive_failures: 0,
            last_seen: None,
        }
    }

    pub fn update_check(
        &mut self,
        success: bool,
        latency_ms: Option<f64>,
        packet_loss: Option<f64>,
        check_time: DateTime<Utc>,
    ) {
        self.total_checks += 1;
        if success {
            self.successful_checks += 1;
            self.consecutive_failures = 0;
            self.last_seen = Some(check_time);
        } else {
            self.consecutive_failures += 1;
        }

        if let Some(latency) = latency_ms {
            self.latency.update(latency);
        }
        if let Some(loss) = packet_loss {
            self.packet_loss.update(loss);
        }
    }

    /// Availability percentage over all observed checks.
    pub fn availability(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.successful_checks as f64 / self.total_checks as f64 * 100.0
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline / status views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DeviceBaseline {
    pub device_ip: String,
    pub avg_latency_ms: f64,
    pub latency_std_dev: f64,
    pub avg_packet_loss: f64,
    pub availability_percent: f64,
    pub total_checks: u64,
    pub consecutive_failures: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model_version: String,
    pub devices_tracked: usize,
    pub total_checks: u64,
    pub last_saved: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ModelState {
    model_version: String,
    last_saved: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// AnomalyDetector
// ---------------------------------------------------------------------------

/// Online per-device baseline maintenance.
///
/// `train` folds one health check into the device's streaming statistics;
/// state is periodically flushed to JSON and reloaded at startup so
/// baselines survive restarts. No inference policy lives here — consumers
/// read the baseline and decide their own thresholds.
pub struct AnomalyDetector {
    data_dir: PathBuf,
    devices: Mutex<HashMap<String, DeviceStats>>,
    state: Mutex<ModelState>,
    updates_since_save: AtomicU32,
}

impl AnomalyDetector {
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let devices: HashMap<String, DeviceStats> =
            load_json(&data_dir.join(BASELINES_FILE)).unwrap_or_default();
        let state: ModelState = load_json(&data_dir.join(MODEL_STATE_FILE)).unwrap_or(ModelState {
            model_version: MODEL_VERSION.to_string(),
            last_saved: None,
        });
        info!(devices = devices.len(), "anomaly baselines loaded");
        Self {
            data_dir,
            devices: Mutex::new(devices),
            state: Mutex::new(state),
            updates_since_save: AtomicU32::new(0),
        }
    }

    /// Fold one check into the device's baseline.
    pub fn train(
        &self,
        device_ip: &str,
        success: bool,
        latency_ms: Option<f64>,
        packet_loss: Option<f64>,
        check_time: DateTime<Utc>,
    ) {
        {
            let mut devices = self.devices.lock().unwrap();
            devices
                .entry(device_ip.to_string())
                .or_insert_with(|| DeviceStats::new(device_ip))
                .update_check(success, latency_ms, packet_loss, check_time);
        }

        let updates = self.updates_since_save.fetch_add(1, Ordering::Relaxed) + 1;
        if updates >= SAVE_EVERY {
            self.updates_since_save.store(0, Ordering::Relaxed);
            self.save_state();
        }
    }

    pub fn device_baseline(&self, device_ip: &str) -> Option<DeviceBaseline> {
        let devices = self.devices.lock().unwrap();
        devices.get(device_ip).map(|stats| DeviceBaseline {
            device_ip: stats.device_ip.clone(),
            avg_latency_ms: stats.latency.mean,
            latency_std_dev: stats.latency.std_dev(),
            avg_packet_loss: stats.packet_loss.mean,
            availability_percent: stats.availability(),
            total_checks: stats.total_checks,
            consecutive_failures: stats.consecutive_failures,
            last_seen: stats.last_seen,
        })
    }

    pub fn model_status(&self) -> ModelStatus {
        let devices = self.devices.lock().unwrap();
        let state = self.state.lock().unwrap();
        ModelStatus {
            model_version: if state.model_version.is_empty() {
                MODEL_VERSION.to_string()
            } else {
                state.model_version.clone()
            },
            devices_tracked: devices.len(),
            total_checks: devices.values().map(|d| d.total_checks).sum(),
            last_saved: state.last_saved,
        }
    }

    pub fn consecutive_failures(&self, device_ip: &str) -> u32 {
        self.devices
            .lock()
            .unwrap()
            .get(device_ip)
            .map(|d| d.consecutive_failures)
            .unwrap_or(0)
    }

    /// Flush baselines and model metadata. Write failures are logged only.
    pub fn save_state(&self) {
        let devices = self.devices.lock().unwrap().clone();
        save_json(&self.data_dir.join(BASELINES_FILE), &devices);

        let state = {
            let mut state = self.state.lock().unwrap();
            state.model_version = MODEL_VERSION.to_string();
            state.last_saved = Some(Utc::now());
            state.clone()
        };
        save_json(&self.data_dir.join(MODEL_STATE_FILE), &state);
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file did not parse");
            None
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload =
            serde_json::to_string(value).map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(path, payload)
    };
    if let Err(e) = write() {
        error!(path = %path.display(), error = %e, "failed to persist model state");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sv-notifyd-anomaly-{tag}-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn welford_mean_and_extremes() {
        let mut stats = LatencyStats::default();
        stats.update(10.0);
        stats.update(20.0);
        stats.update(30.0);

        assert_eq!(stats.count, 3);
        assert!((stats.mean - 20.0).abs() < 1e-9);
        assert_eq!(stats.min_value, Some(10.0));
        assert_eq!(stats.max_value, Some(30.0));
    }

    #[test]
    fn welford_variance_matches_closed_form() {
        let samples = [4.0, 7.0, 13.0, 16.0];
        let mut stats = LatencyStats::default();
        for s in samples {
            stats.update(s);
        }
        // Closed-form sample variance of [4, 7, 13, 16] is 30.
        assert!((stats.variance() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn variance_is_zero_for_fewer_than_two_samples() {
        let mut stats = LatencyStats::default();
        assert_eq!(stats.variance(), 0.0);
        stats.update(10.0);
        assert_eq!(stats.variance(), 0.0);
        stats.update(20.0);
        assert!(stats.variance() > 0.0);
    }

    #[test]
    fn stats_serialize_round_trip() {
        let mut stats = LatencyStats::default();
        stats.update(10.0);
        stats.update(20.0);
        let json = serde_json::to_string(&stats).unwrap();
        let back: LatencyStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }

    #[test]
    fn ratio_stat_tracks_the_running_mean_only() {
        let mut ratio = RatioStat::default();
        ratio.update(0.0);
        ratio.update(50.0);
        ratio.update(100.0);

        assert_eq!(ratio.count, 3);
        assert!((ratio.mean - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ratio_stat_round_trips_and_reads_old_welford_shape() {
        let mut ratio = RatioStat::default();
        ratio.update(12.5);
        let json = serde_json::to_string(&ratio).unwrap();
        let back: RatioStat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ratio);

        // Baselines persisted before the ratio type carried the full
        // Welford shape; the extra fields are ignored on load.
        let legacy = r#"{"count": 4, "mean": 2.5, "m2": 1.0, "min_value": 0.0, "max_value": 5.0}"#;
        let migrated: RatioStat = serde_json::from_str(legacy).unwrap();
        assert_eq!(migrated.count, 4);
        assert!((migrated.mean - 2.5).abs() < 1e-9);
    }

    #[test]
    fn device_check_updates_counters_and_failures() {
        let mut stats = DeviceStats::new("192.168.1.1");
        let now = Utc::now();

        stats.update_check(true, Some(10.0), Some(0.0), now);
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.successful_checks, 1);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.last_seen, Some(now));

        stats.update_check(false, None, None, now);
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.successful_checks, 1);
        assert_eq!(stats.consecutive_failures, 1);

        stats.update_check(true, Some(12.0), None, now);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn availability_percentage() {
        let mut stats = DeviceStats::new("192.168.1.1");
        assert_eq!(stats.availability(), 0.0);

        let now = Utc::now();
        stats.update_check(true, Some(10.0), Some(0.0), now);
        stats.update_check(true, Some(10.0), Some(0.0), now);
        stats.update_check(false, None, None, now);

        assert!((stats.availability() - 66.666).abs() < 0.1);
    }

    #[test]
    fn train_tracks_devices_and_baseline() {
        let detector = AnomalyDetector::load(temp_dir("train"));
        let now = Utc::now();

        detector.train("192.168.1.1", true, Some(10.0), Some(0.0), now);
        detector.train("192.168.1.1", true, Some(20.0), Some(0.0), now);

        let baseline = detector.device_baseline("192.168.1.1").unwrap();
        assert_eq!(baseline.device_ip, "192.168.1.1");
        assert!((baseline.avg_latency_ms - 15.0).abs() < 1e-9);
        assert_eq!(baseline.total_checks, 2);
        assert!(detector.device_baseline("10.0.0.1").is_none());
    }

    #[test]
    fn model_status_reports_version_and_count() {
        let detector = AnomalyDetector::load(temp_dir("status"));
        let status = detector.model_status();
        assert_eq!(status.model_version, MODEL_VERSION);
        assert_eq!(status.devices_tracked, 0);

        detector.train("192.168.1.1", true, Some(5.0), None, Utc::now());
        assert_eq!(detector.model_status().devices_tracked, 1);
    }

    #[test]
    fn baselines_survive_restart() {
        let dir = temp_dir("persist");
        {
            let detector = AnomalyDetector::load(&dir);
            detector.train("192.168.1.1", true, Some(10.0), Some(1.0), Utc::now());
            detector.save_state();
        }
        let reloaded = AnomalyDetector::load(&dir);
        let baseline = reloaded.device_baseline("192.168.1.1").unwrap();
        assert_eq!(baseline.total_checks, 1);
        assert!(reloaded.model_status().last_saved.is_some());
    }
}
