use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_DB_PATH: &str = "motion_hub.db";
const DEFAULT_ALLOWED_NETWORKS: &[&str] = &["127.0.0.1", "localhost", "192.168.", "10.0.", "172.16."];
const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 5;
const DEFAULT_MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_FRAME_DIMENSION: u32 = 4096;
const DEFAULT_MIN_CONTOUR_AREA: u32 = 500;
const DEFAULT_MOTION_THRESHOLD: f32 = 0.02;
const DEFAULT_COOLDOWN_SECS: u64 = 5;
const DEFAULT_HISTORY_FRAMES: u32 = 500;
const DEFAULT_VARIANCE_THRESHOLD: f32 = 50.0;
const DEFAULT_BLUR_RADIUS: u32 = 2;
const DEFAULT_REFERENCE_EVERY_N: u64 = 30;
const DEFAULT_VIEWER_QUEUE_DEPTH: usize = 64;
const DEFAULT_ALERT_WAIT_MS: u64 = 250;

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    listen_addr: Option<String>,
    db_path: Option<String>,
    admission: Option<AdmissionConfigFile>,
    detection: Option<DetectionConfigFile>,
    sampling: Option<SamplingConfigFile>,
    viewers: Option<ViewerConfigFile>,
    storage: Option<StorageConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct AdmissionConfigFile {
    allowed_networks: Option<Vec<String>>,
    max_connections_per_ip: Option<usize>,
    max_frame_bytes: Option<usize>,
    max_frame_dimension: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    enabled: Option<bool>,
    min_contour_area: Option<u32>,
    motion_threshold: Option<f32>,
    cooldown_secs: Option<u64>,
    learning_rate: Option<f32>,
    variance_threshold: Option<f32>,
    blur_radius: Option<u32>,
    discard_model_on_stop: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    reference_every_n: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ViewerConfigFile {
    queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    alert_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: String,
    pub db_path: String,
    pub admission: AdmissionSettings,
    pub detection: DetectionSettings,
    /// Every Nth accepted frame of a device is stored as a reference frame. 0 disables.
    pub reference_every_n: u64,
    pub viewer_queue_depth: usize,
    /// How long an alert waits for its stored id before it is broadcast without one.
    pub alert_persist_wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub allowed_networks: Vec<String>,
    pub max_connections_per_ip: usize,
    pub max_frame_bytes: usize,
    pub max_frame_dimension: u32,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            allowed_networks: DEFAULT_ALLOWED_NETWORKS
                .iter()
                .map(|n| n.to_string())
                .collect(),
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_frame_dimension: DEFAULT_MAX_FRAME_DIMENSION,
        }
    }
}

/// Detection and alert-governance settings.
///
/// The pipeline reads one snapshot of these per frame via [`SettingsHandle`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub enabled: bool,
    /// Regions smaller than this (in pixels) are discarded.
    pub min_contour_area: u32,
    /// Motion fraction that must be exceeded before an alert is dispatched.
    pub motion_threshold: f32,
    pub cooldown: Duration,
    /// Background learning rate. Applied to new models only.
    pub learning_rate: f32,
    /// Squared deviation, in units of per-pixel variance, marking a pixel as foreground.
    pub variance_threshold: f32,
    pub blur_radius: u32,
    pub discard_model_on_stop: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_contour_area: DEFAULT_MIN_CONTOUR_AREA,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            learning_rate: 1.0 / DEFAULT_HISTORY_FRAMES as f32,
            variance_threshold: DEFAULT_VARIANCE_THRESHOLD,
            blur_radius: DEFAULT_BLUR_RADIUS,
            discard_model_on_stop: false,
        }
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.motion_threshold > 0.0 && self.motion_threshold <= 1.0) {
            return Err(anyhow!("motion_threshold must be in (0, 1]"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(anyhow!("learning_rate must be in (0, 1]"));
        }
        if self.variance_threshold <= 0.0 {
            return Err(anyhow!("variance_threshold must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            admission: AdmissionSettings::default(),
            detection: DetectionSettings::default(),
            reference_every_n: DEFAULT_REFERENCE_EVERY_N,
            viewer_queue_depth: DEFAULT_VIEWER_QUEUE_DEPTH,
            alert_persist_wait: Duration::from_millis(DEFAULT_ALERT_WAIT_MS),
        }
    }
}

impl HubConfig {
    /// Load from `MOTION_HUB_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MOTION_HUB_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HubConfigFile) -> Self {
        let defaults = HubConfig::default();
        let admission_file = file.admission.unwrap_or_default();
        let detection_file = file.detection.unwrap_or_default();
        let admission = AdmissionSettings {
            allowed_networks: admission_file
                .allowed_networks
                .unwrap_or(defaults.admission.allowed_networks),
            max_connections_per_ip: admission_file
                .max_connections_per_ip
                .unwrap_or(defaults.admission.max_connections_per_ip),
            max_frame_bytes: admission_file
                .max_frame_bytes
                .unwrap_or(defaults.admission.max_frame_bytes),
            max_frame_dimension: admission_file
                .max_frame_dimension
                .unwrap_or(defaults.admission.max_frame_dimension),
        };
        let detection = DetectionSettings {
            enabled: detection_file.enabled.unwrap_or(defaults.detection.enabled),
            min_contour_area: detection_file
                .min_contour_area
                .unwrap_or(defaults.detection.min_contour_area),
            motion_threshold: detection_file
                .motion_threshold
                .unwrap_or(defaults.detection.motion_threshold),
            cooldown: detection_file
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.detection.cooldown),
            learning_rate: detection_file
                .learning_rate
                .unwrap_or(defaults.detection.learning_rate),
            variance_threshold: detection_file
                .variance_threshold
                .unwrap_or(defaults.detection.variance_threshold),
            blur_radius: detection_file
                .blur_radius
                .unwrap_or(defaults.detection.blur_radius),
            discard_model_on_stop: detection_file
                .discard_model_on_stop
                .unwrap_or(defaults.detection.discard_model_on_stop),
        };
        Self {
            listen_addr: file.listen_addr.unwrap_or(defaults.listen_addr),
            db_path: file.db_path.unwrap_or(defaults.db_path),
            admission,
            detection,
            reference_every_n: file
                .sampling
                .and_then(|s| s.reference_every_n)
                .unwrap_or(defaults.reference_every_n),
            viewer_queue_depth: file
                .viewers
                .and_then(|v| v.queue_depth)
                .unwrap_or(defaults.viewer_queue_depth),
            alert_persist_wait: file
                .storage
                .and_then(|s| s.alert_wait_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.alert_persist_wait),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("MOTION_HUB_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("MOTION_HUB_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(networks) = std::env::var("MOTION_HUB_ALLOWED_NETWORKS") {
            let parsed = split_csv(&networks);
            if !parsed.is_empty() {
                self.admission.allowed_networks = parsed;
            }
        }
        if let Some(max) = env_parse::<usize>("MOTION_HUB_MAX_CONNECTIONS_PER_IP")? {
            self.admission.max_connections_per_ip = max;
        }
        if let Some(bytes) = env_parse::<usize>("MOTION_HUB_MAX_FRAME_BYTES")? {
            self.admission.max_frame_bytes = bytes;
        }
        if let Some(enabled) = env_parse::<bool>("MOTION_HUB_MOTION_ENABLED")? {
            self.detection.enabled = enabled;
        }
        if let Some(threshold) = env_parse::<f32>("MOTION_HUB_MOTION_THRESHOLD")? {
            self.detection.motion_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("MOTION_HUB_COOLDOWN_SECS")? {
            self.detection.cooldown = Duration::from_secs(secs);
        }
        if let Some(area) = env_parse::<u32>("MOTION_HUB_MIN_CONTOUR_AREA")? {
            self.detection.min_contour_area = area;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.admission.allowed_networks = self
            .admission
            .allowed_networks
            .iter()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        if self.admission.allowed_networks.is_empty() {
            return Err(anyhow!("allowed_networks must not be empty"));
        }
        if self.admission.max_connections_per_ip == 0 {
            return Err(anyhow!("max_connections_per_ip must be greater than zero"));
        }
        if self.admission.max_frame_bytes == 0 {
            return Err(anyhow!("max_frame_bytes must be greater than zero"));
        }
        if self.admission.max_frame_dimension == 0 {
            return Err(anyhow!("max_frame_dimension must be greater than zero"));
        }
        if self.viewer_queue_depth == 0 {
            return Err(anyhow!("viewer queue_depth must be greater than zero"));
        }
        self.detection.validate()
    }
}

/// Shared, atomically-swapped detection settings.
///
/// Readers take an `Arc` snapshot; writers replace the whole snapshot, so a
/// frame in flight never observes a half-applied change.
#[derive(Debug)]
pub struct SettingsHandle {
    current: RwLock<Arc<DetectionSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: DetectionSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn snapshot(&self) -> Arc<DetectionSettings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` to a copy of the current settings and publish it if valid.
    pub fn update(&self, change: impl FnOnce(&mut DetectionSettings)) -> Result<Arc<DetectionSettings>> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        change(&mut next);
        next.validate()?;
        let next = Arc::new(next);
        *guard = next.clone();
        Ok(next)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<Arc<DetectionSettings>> {
        self.update(|s| s.enabled = enabled)
    }
}

fn read_config_file(path: &Path) -> Result<HubConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        _ => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
