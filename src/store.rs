use crate::model::{ActivityKind, Feed, Settings};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Persistence collaborator. Supervisors only read feeds and settings; the
/// CRUD layer owns writes to them.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_feeds(&self) -> anyhow::Result<Vec<Feed>>;

    async fn feed(&self, id: i64) -> anyhow::Result<Option<Feed>> {
        Ok(self.list_feeds().await?.into_iter().find(|f| f.id == id))
    }

    async fn settings(&self) -> anyhow::Result<Settings>;

    async fn record_activity(
        &self,
        feed_id: i64,
        kind: ActivityKind,
        message: &str,
    ) -> anyhow::Result<()>;

    /// Drops activity entries older than `max_age`, returns how many went.
    async fn prune_activity(&self, max_age: Duration) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub feed_id: i64,
    pub kind: ActivityKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct Catalog {
    #[serde(default)]
    feeds: Vec<Feed>,
    #[serde(default)]
    settings: BTreeMap<String, serde_yaml::Value>,
}

/// YAML catalog + JSON-lines activity log.
///
/// The catalog is re-read on every call so reconcile passes see edits made by
/// the CRUD layer without a restart.
pub struct FileStore {
    catalog_path: PathBuf,
    activity_path: PathBuf,
    activity_lock: Mutex<()>,
}

impl FileStore {
    /// Opens the store, failing when the catalog cannot be read or parsed.
    pub async fn open(catalog_path: &Path, activity_path: &Path) -> anyhow::Result<Self> {
        let store = Self {
            catalog_path: catalog_path.to_path_buf(),
            activity_path: activity_path.to_path_buf(),
            activity_lock: Mutex::new(()),
        };
        store.load().await?;
        if let Some(dir) = activity_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        Ok(store)
    }

    async fn load(&self) -> anyhow::Result<Catalog> {
        let content = fs::read_to_string(&self.catalog_path)
            .await
            .with_context(|| format!("failed to read catalog {:?}", self.catalog_path))?;
        if content.trim().is_empty() {
            return Ok(Catalog::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse catalog {:?}", self.catalog_path))
    }

    pub async fn read_activity(&self) -> anyhow::Result<Vec<ActivityEntry>> {
        let content = match fs::read_to_string(&self.activity_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Store for FileStore {
    async fn list_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        Ok(self.load().await?.feeds)
    }

    async fn settings(&self) -> anyhow::Result<Settings> {
        let catalog = self.load().await?;
        Ok(Settings::from_pairs(catalog.settings.iter().filter_map(
            |(key, value)| scalar_to_string(value).map(|v| (key.clone(), v)),
        )))
    }

    async fn record_activity(
        &self,
        feed_id: i64,
        kind: ActivityKind,
        message: &str,
    ) -> anyhow::Result<()> {
        let entry = ActivityEntry {
            feed_id,
            kind,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.activity_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.activity_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn prune_activity(&self, max_age: Duration) -> anyhow::Result<usize> {
        let _guard = self.activity_lock.lock().await;
        let entries = self.read_activity().await?;
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age)?;
        let (keep, dropped): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.created_at >= cutoff);
        if dropped.is_empty() {
            return Ok(0);
        }

        let mut content = String::new();
        for entry in &keep {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        let tmp = self.activity_path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.activity_path).await?;
        Ok(dropped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sensitivity;

    const CATALOG: &str = r#"
feeds:
  - id: 1
    name: Front
    source: rtsp://cam1
  - id: 2
    name: Garage
    source: file:///videos/garage.mp4
    settings:
      zone: left
settings:
  motion_sensitivity: high
  notification_interval: 5
  smtp_port: 2525
"#;

    async fn store(dir: &tempfile::TempDir) -> FileStore {
        let catalog = dir.path().join("catalog.yaml");
        std::fs::write(&catalog, CATALOG).unwrap();
        FileStore::open(&catalog, &dir.path().join("logs/activity.jsonl"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn catalog_feeds_and_typed_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;

        let feeds = store.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[1].settings["zone"], "left");
        assert_eq!(store.feed(2).await.unwrap().unwrap().name, "Garage");
        assert!(store.feed(9).await.unwrap().is_none());

        let settings = store.settings().await.unwrap();
        assert_eq!(settings.motion_sensitivity, Sensitivity::High);
        assert_eq!(settings.notification_interval, Duration::from_secs(300));
        assert_eq!(settings.smtp_port, 2525);
    }

    #[tokio::test]
    async fn missing_catalog_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileStore::open(
            &dir.path().join("absent.yaml"),
            &dir.path().join("activity.jsonl"),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn activity_is_appended_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;

        store
            .record_activity(1, ActivityKind::Motion, "Motion")
            .await
            .unwrap();
        store
            .record_activity(2, ActivityKind::Error, "Email failed")
            .await
            .unwrap();

        let entries = store.read_activity().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, ActivityKind::Error);

        assert_eq!(store.prune_activity(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.prune_activity(Duration::ZERO).await.unwrap(), 2);
        assert!(store.read_activity().await.unwrap().is_empty());
    }
}
