use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{TrackerBackend, TrackerConfig};
use crate::ingest::{Backoff, DeviceConfig};
use crate::pipeline::PipelineSettings;
use crate::transport::MqttSettings;
use crate::EpochMillis;

const DEFAULT_DB_PATH: &str = "occupancy.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8810";
const DEFAULT_CAMERA_URL: &str = "stub://doorway";
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 16_000;
const DEFAULT_LINE_Y: f32 = 250.0;
const DEFAULT_DEBOUNCE_MS: EpochMillis = 3_000;
const DEFAULT_TRACK_TTL_MS: EpochMillis = 30_000;
const DEFAULT_MAX_TRACKS: usize = 4096;
const DEFAULT_MAX_CAPACITY: u64 = 50;
const DEFAULT_MQTT_CLIENT_ID: &str = "occupancyd";
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "occupancy";
const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Deserialize, Default)]
struct OccupancydConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    counting: Option<CountingConfigFile>,
    alerts: Option<AlertsConfigFile>,
    tracker: Option<TrackerConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CountingConfigFile {
    line_y: Option<f32>,
    debounce_ms: Option<EpochMillis>,
    track_ttl_ms: Option<EpochMillis>,
    max_tracks: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    max_capacity: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    backend: Option<TrackerBackend>,
    replay_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OccupancydConfig {
    pub db_path: String,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub camera: CameraSettings,
    pub counting: CountingSettings,
    /// Zero disables capacity alerts.
    pub max_capacity: u64,
    pub tracker: TrackerConfig,
    /// `None` when no broker is configured; notifications then go to the log.
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CountingSettings {
    pub line_y: f32,
    pub debounce_ms: EpochMillis,
    pub track_ttl_ms: EpochMillis,
    pub max_tracks: usize,
}

impl OccupancydConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OCCUPANCY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: OccupancydConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let counting = file.counting.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();

        let mqtt = mqtt.broker_addr.map(|broker_addr| MqttSettings {
            broker_addr,
            client_id: mqtt
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            topic_prefix: mqtt
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            username: mqtt.username,
            password: mqtt.password,
        });

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            api_token_path: api.token_path,
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                backoff_initial: Duration::from_millis(
                    camera
                        .backoff_initial_ms
                        .unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
                ),
                backoff_max: Duration::from_millis(
                    camera.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
                ),
                max_attempts: camera.max_attempts,
            },
            counting: CountingSettings {
                line_y: counting.line_y.unwrap_or(DEFAULT_LINE_Y),
                debounce_ms: counting.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
                track_ttl_ms: counting.track_ttl_ms.unwrap_or(DEFAULT_TRACK_TTL_MS),
                max_tracks: counting.max_tracks.unwrap_or(DEFAULT_MAX_TRACKS),
            },
            max_capacity: file
                .alerts
                .and_then(|alerts| alerts.max_capacity)
                .unwrap_or(DEFAULT_MAX_CAPACITY),
            tracker: TrackerConfig {
                backend: tracker.backend.unwrap_or_default(),
                replay_path: tracker.replay_path,
            },
            mqtt,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("OCCUPANCY_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_string("OCCUPANCY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = env_string("OCCUPANCY_API_TOKEN_PATH") {
            self.api_token_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_string("OCCUPANCY_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(line_y) = env_string("OCCUPANCY_LINE_Y") {
            self.counting.line_y = line_y
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_LINE_Y must be a number of pixels"))?;
        }
        if let Some(debounce) = env_string("OCCUPANCY_DEBOUNCE_MS") {
            self.counting.debounce_ms = debounce
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_DEBOUNCE_MS must be an integer number of ms"))?;
        }
        if let Some(capacity) = env_string("OCCUPANCY_MAX_CAPACITY") {
            self.max_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_MAX_CAPACITY must be a non-negative integer"))?;
        }
        if let Some(broker_addr) = env_string("OCCUPANCY_MQTT_BROKER") {
            match &mut self.mqtt {
                Some(mqtt) => mqtt.broker_addr = broker_addr,
                None => {
                    self.mqtt = Some(MqttSettings {
                        broker_addr,
                        client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                        topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                        username: None,
                        password: None,
                    })
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.target_fps == 0 {
            return Err(anyhow!("camera.target_fps must be greater than zero"));
        }
        if camera.width == 0 || camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if camera.backoff_initial.is_zero() {
            return Err(anyhow!("camera.backoff_initial_ms must be greater than zero"));
        }
        if camera.backoff_max < camera.backoff_initial {
            return Err(anyhow!(
                "camera.backoff_max_ms must not be smaller than backoff_initial_ms"
            ));
        }

        let counting = &self.counting;
        if !(counting.line_y > 0.0 && counting.line_y < camera.height as f32) {
            return Err(anyhow!(
                "counting.line_y must lie inside the frame (0 < line_y < {})",
                camera.height
            ));
        }
        if counting.debounce_ms <= 0 {
            return Err(anyhow!("counting.debounce_ms must be greater than zero"));
        }
        if counting.max_tracks == 0 {
            return Err(anyhow!("counting.max_tracks must be greater than zero"));
        }
        if counting.track_ttl_ms < counting.debounce_ms {
            return Err(anyhow!(
                "counting.track_ttl_ms must be at least the debounce window"
            ));
        }

        if self.tracker.backend == TrackerBackend::Replay && self.tracker.replay_path.is_none() {
            return Err(anyhow!("tracker.replay_path is required for the replay backend"));
        }

        if let Some(mqtt) = &self.mqtt {
            validate_topic_prefix(&mqtt.topic_prefix)?;
            if mqtt.client_id.trim().is_empty() {
                return Err(anyhow!("mqtt.client_id must not be empty"));
            }
        }
        Ok(())
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            url: self.camera.url.clone(),
            target_fps: self.camera.target_fps,
            width: self.camera.width,
            height: self.camera.height,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.camera.backoff_initial, self.camera.backoff_max)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            line_y: self.counting.line_y,
            debounce_ms: self.counting.debounce_ms,
            track_ttl_ms: self.counting.track_ttl_ms,
            max_tracks: self.counting.max_tracks,
            max_capacity: self.max_capacity,
            frame_interval: Duration::from_millis(1000 / u64::from(self.camera.target_fps.max(1))),
            width: self.camera.width,
            height: self.camera.height,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            ..PipelineSettings::default()
        }
    }
}

/// Topic prefixes are slash-separated segments of `[A-Za-z0-9_-]`, so no
/// wildcard or empty level can leak into a publish topic.
pub fn validate_topic_prefix(prefix: &str) -> Result<()> {
    let pattern = Regex::new(r"^[A-Za-z0-9_-]+(/[A-Za-z0-9_-]+)*$")?;
    if !pattern.is_match(prefix) {
        return Err(anyhow!("invalid mqtt topic prefix '{}'", prefix));
    }
    Ok(())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<OccupancydConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> OccupancydConfig {
        OccupancydConfig::from_file(OccupancydConfigFile::default())
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let cfg = defaults();
        cfg.validate()?;
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.camera.max_attempts, None);
        assert!(cfg.mqtt.is_none());
        assert_eq!(cfg.pipeline_settings().frame_interval, Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn line_outside_frame_is_rejected() {
        let mut cfg = defaults();
        cfg.counting.line_y = cfg.camera.height as f32;
        assert!(cfg.validate().is_err());
        cfg.counting.line_y = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_bounds_are_checked() {
        let mut cfg = defaults();
        cfg.camera.backoff_max = Duration::from_millis(500);
        assert!(cfg.validate().is_err());
        cfg.camera.backoff_initial = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ttl_shorter_than_debounce_is_rejected() {
        let mut cfg = defaults();
        cfg.counting.track_ttl_ms = cfg.counting.debounce_ms - 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn replay_backend_needs_a_path() {
        let mut cfg = defaults();
        cfg.tracker.backend = TrackerBackend::Replay;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn topic_prefix_rules() {
        assert!(validate_topic_prefix("occupancy").is_ok());
        assert!(validate_topic_prefix("site-1/door_a").is_ok());
        assert!(validate_topic_prefix("").is_err());
        assert!(validate_topic_prefix("door/#").is_err());
        assert!(validate_topic_prefix("door//a").is_err());
        assert!(validate_topic_prefix("/door").is_err());
    }
}
