use crate::config::RecordingConfig;
use crate::model::{Feed, Settings};
use crate::process::Purpose;
use crate::resolver::ResolvedSource;
use crate::supervisor::{FeedSupervisor, Workload};
use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub type RecordingSupervisor = FeedSupervisor<SegmentRecorder>;

/// strftime pattern of segment file names, sortable by capture time
const SEGMENT_PATTERN: &str = "%Y-%m-%d_%H-%M-%S";
const SEGMENT_EXT: &str = "mp4";

/// Continuous recorder: stream-copies video into fixed-length segments under
/// `<root>/<feed_id>/`.
pub struct SegmentRecorder {
    config: RecordingConfig,
}

impl SegmentRecorder {
    pub fn new(config: RecordingConfig) -> Self {
        Self { config }
    }

    pub fn feed_dir(&self, feed_id: i64) -> PathBuf {
        self.config.root.join(feed_id.to_string())
    }
}

#[async_trait]
impl Workload for SegmentRecorder {
    const PURPOSE: Purpose = Purpose::Recording;
    const LABEL: &'static str = "Recorder";

    async fn prepare(
        &self,
        feed: &Feed,
        _settings: &Settings,
        source: &ResolvedSource,
    ) -> anyhow::Result<Vec<String>> {
        let dir = self.feed_dir(feed.id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create recording dir {:?}", dir))?;

        let output = dir.join(format!("{}.{}", SEGMENT_PATTERN, SEGMENT_EXT));
        let mut args = source.input_args();
        args.push("-i".to_string());
        args.push(source.input());
        args.extend(
            [
                "-c:v",
                "copy",
                "-c:a",
                "aac",
                "-f",
                "segment",
                "-segment_time",
            ]
            .map(String::from),
        );
        args.push(self.config.segment_secs.to_string());
        args.extend(
            [
                "-segment_format",
                "mp4",
                "-reset_timestamps",
                "1",
                "-strftime",
                "1",
                "-movflags",
                "+faststart",
            ]
            .map(String::from),
        );
        args.push(output.to_string_lossy().into_owned());
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub filename: String,
    pub url: String,
    /// Capture start parsed from the file name, `None` when it does not parse
    pub timestamp: Option<NaiveDateTime>,
}

/// Lists a feed's segments, newest first. A feed without a directory has no
/// recordings.
pub async fn list_recordings(root: &Path, feed_id: i64) -> anyhow::Result<Vec<Recording>> {
    let dir = root.join(feed_id.to_string());
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("cannot list {:?}", dir)),
    };

    let mut recordings = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = filename.strip_suffix(".mp4") else {
            continue;
        };
        recordings.push(Recording {
            timestamp: NaiveDateTime::parse_from_str(stem, SEGMENT_PATTERN).ok(),
            url: format!("/recordings/{}/{}", feed_id, filename),
            filename,
        });
    }
    recordings.sort_by(|a, b| b.filename.cmp(&a.filename));
    Ok(recordings)
}

/// Deletes every file under `root` last modified more than `retention` before
/// `now`. Returns how many were removed.
pub async fn cleanup_old_recordings(
    root: &Path,
    retention: Duration,
    now: SystemTime,
) -> anyhow::Result<usize> {
    let root = root.to_path_buf();
    let cutoff = now
        .checked_sub(retention)
        .context("retention window reaches before the epoch")?;

    tokio::task::spawn_blocking(move || {
        let mut removed = 0;
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(modified)) => modified,
                _ => continue,
            };
            if modified >= cutoff {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Deleted old recording {:?}", entry.path());
                    removed += 1;
                }
                Err(e) => warn!("Failed to delete {:?}: {}", entry.path(), e),
            }
        }
        if removed > 0 {
            info!("Recording cleanup removed {} files", removed);
        }
        removed
    })
    .await
    .context("cleanup task panicked")
}
