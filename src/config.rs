use crate::model::Sensitivity;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub recording: RecordingConfig,
    pub streaming: StreamingConfig,
    pub notifications: NotificationConfig,
    pub reaper: ReaperConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub ffmpeg_binary: String,

    /// YAML catalog holding `feeds:` and `settings:`, maintained by the CRUD layer
    pub catalog_path: PathBuf,
    /// JSON-lines activity log
    pub activity_log: PathBuf,

    /// Upper bound for graceful termination before SIGKILL
    pub kill_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7000".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            catalog_path: PathBuf::from("nvr-catalog.yaml"),
            activity_log: PathBuf::from("activity.jsonl"),
            kill_grace_ms: 2000,
        }
    }
}

impl ServerConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Scene-change thresholds per sensitivity level.
///
/// Lower means more sensitive. These are tuning values, not derived constants.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub very_low: f64,
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            very_low: 0.15,
            low: 0.05,
            medium: 0.015,
            high: 0.002,
        }
    }
}

impl Thresholds {
    pub fn for_level(&self, level: Sensitivity) -> f64 {
        match level {
            Sensitivity::VeryLow => self.very_low,
            Sensitivity::Low => self.low,
            Sensitivity::Medium => self.medium,
            Sensitivity::High => self.high,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub reconcile_interval_secs: u64,
    pub stale_after_secs: u64,
    pub restart_cooldown_secs: u64,
    pub thresholds: Thresholds,
    /// Detector frame rate
    pub frame_rate: u32,
    /// Detector frame width, height follows the aspect ratio
    pub scale_width: u32,
    /// Substring that marks a frame which passed the scene-change filter
    pub marker: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            stale_after_secs: 120,
            restart_cooldown_secs: 10,
            thresholds: Thresholds::default(),
            frame_rate: 1,
            scale_width: 320,
            marker: "pts_time".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecordingConfig {
    pub root: PathBuf,
    pub segment_secs: u64,
    pub reconcile_interval_secs: u64,
    pub stale_after_secs: u64,
    pub restart_cooldown_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./recordings"),
            segment_secs: 1800,
            reconcile_interval_secs: 60,
            stale_after_secs: 120,
            restart_cooldown_secs: 10,
            cleanup_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamingConfig {
    pub restart_cooldown_secs: u64,
    pub bitrate: String,
    pub frame_rate: u32,
    /// Outbound frames queued per viewer before chunks are dropped
    pub viewer_queue: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            restart_cooldown_secs: 3,
            bitrate: "1000k".to_string(),
            frame_rate: 25,
            viewer_queue: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    /// Processing lock is held this long after acquisition
    pub grace_secs: u64,
    pub snapshot_timeout_secs: u64,
    pub temp_dir: PathBuf,
    pub sender: String,
    /// Sendmail-compatible command; `{smtp_host}`, `{smtp_port}`, `{smtp_user}`
    /// and `{from}` are substituted. The password is exported as `NVR_SMTP_PASS`.
    pub mail_command: Vec<String>,
    /// Upper bound for handing one message to the mail command
    pub mail_timeout_secs: u64,
    pub activity_retention_hours: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            grace_secs: 5,
            snapshot_timeout_secs: 15,
            temp_dir: PathBuf::from("./temp"),
            sender: "NVR System <no-reply@nvr.local>".to_string(),
            mail_command: [
                "msmtp",
                "--host={smtp_host}",
                "--port={smtp_port}",
                "--auth=on",
                "--tls=on",
                "--user={smtp_user}",
                "--passwordeval=echo \"$NVR_SMTP_PASS\"",
                "--from={from}",
                "-t",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            mail_timeout_secs: 30,
            activity_retention_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    pub min_age_secs: u64,
    /// Process name fragment identifying supervised children
    pub signature: String,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            min_age_secs: 60,
            signature: "ffmpeg".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// Routing component config file (mediamtx.yml)
    pub config_path: PathBuf,
    pub rtsp_base: String,
    pub reload_command: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_path: PathBuf::from("/app/server/mediamtx.yml"),
            rtsp_base: "rtsp://mediamtx:8554".to_string(),
            reload_command: vec![
                "docker".to_string(),
                "restart".to_string(),
                "mediamtx".to_string(),
            ],
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
