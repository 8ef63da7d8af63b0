use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// A configured camera or file source.
///
/// Supervisors only ever hold a snapshot of this record, refreshed on every
/// reconcile pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    /// `rtsp://...` or `file://...`
    pub source: String,
    /// Opaque per-feed settings owned by the CRUD layer.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Motion detector scene-change sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Sensitivity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "very_low" => Ok(Self::VeryLow),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(anyhow::anyhow!("unknown sensitivity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    /// Disarmed: motion is logged but no email goes out.
    Home,
    #[default]
    Away,
}

/// Activity log entry tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Motion,
    Email,
    Error,
}

/// Mail transport parameters, present only when SMTP host and recipient are set.
#[derive(Debug, Clone, PartialEq)]
pub struct MailTransport {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub recipient: String,
}

/// Typed system settings.
///
/// Defaults are applied once here; consumers never fall back on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub motion_sensitivity: Sensitivity,
    pub notification_interval: Duration,
    pub recording_retention: Duration,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub notification_email: Option<String>,
    pub system_mode: SystemMode,
}

const DEFAULT_NOTIFICATION_MINUTES: u64 = 15;
const DEFAULT_RETENTION_HOURS: u64 = 24;
const DEFAULT_SMTP_PORT: u16 = 587;

impl Default for Settings {
    fn default() -> Self {
        Self {
            motion_sensitivity: Sensitivity::default(),
            notification_interval: Duration::from_secs(DEFAULT_NOTIFICATION_MINUTES * 60),
            recording_retention: Duration::from_secs(DEFAULT_RETENTION_HOURS * 3600),
            smtp_host: None,
            smtp_port: DEFAULT_SMTP_PORT,
            smtp_user: None,
            smtp_pass: None,
            notification_email: None,
            system_mode: SystemMode::default(),
        }
    }
}

impl Settings {
    /// Build settings from the raw key/value rows of the settings table.
    ///
    /// Unknown keys are ignored, unparsable values keep their default.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let raw: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().trim().to_string()))
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let mut settings = Settings::default();

        if let Some(level) = raw.get("motion_sensitivity") {
            settings.motion_sensitivity = level.parse().unwrap_or_default();
        }
        if let Some(minutes) = raw.get("notification_interval").and_then(|v| v.parse::<u64>().ok()) {
            if let Some(interval) = scaled("notification_interval", minutes, 60) {
                settings.notification_interval = interval;
            }
        }
        if let Some(hours) = raw.get("recording_retention").and_then(|v| v.parse::<u64>().ok()) {
            if let Some(retention) = scaled("recording_retention", hours, 3600) {
                settings.recording_retention = retention;
            }
        }
        if let Some(port) = raw.get("smtp_port").and_then(|v| v.parse::<u16>().ok()) {
            settings.smtp_port = port;
        }
        settings.smtp_host = raw.get("smtp_host").cloned();
        settings.smtp_user = raw.get("smtp_user").cloned();
        settings.smtp_pass = raw.get("smtp_pass").cloned();
        settings.notification_email = raw.get("notification_email").cloned();
        if raw.get("system_mode").map(String::as_str) == Some("home") {
            settings.system_mode = SystemMode::Home;
        }

        settings
    }

    pub fn mail_transport(&self) -> Option<MailTransport> {
        let host = self.smtp_host.clone()?;
        let recipient = self.notification_email.clone()?;
        Some(MailTransport {
            host,
            port: self.smtp_port,
            user: self.smtp_user.clone(),
            pass: self.smtp_pass.clone(),
            recipient,
        })
    }
}

/// `value` units of `unit_secs` each, or `None` when that does not fit.
fn scaled(key: &str, value: u64, unit_secs: u64) -> Option<Duration> {
    let secs = value.checked_mul(unit_secs);
    if secs.is_none() {
        warn!("Setting {} = {} is out of range, using the default", key, value);
    }
    secs.map(Duration::from_secs)
}
