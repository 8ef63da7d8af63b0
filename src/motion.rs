use crate::config::NotificationConfig;
use crate::model::{ActivityKind, Feed, Settings, SystemMode};
use crate::notify::{MailMessage, Mailer};
use crate::process::{LaunchRequest, Launcher, ProcessEvent, ProcessHandle, Purpose, Signal};
use crate::resolver::FeedResolver;
use crate::store::Store;
use chrono::{Local, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOutcome {
    /// Another event for this feed is still being handled
    Busy,
    /// Notification interval not yet elapsed
    CoolingDown,
    /// Activity entry written with this kind
    Notified(ActivityKind),
}

#[derive(Debug, Default)]
struct FeedLock {
    last_notification: Option<Instant>,
    processing: bool,
}

impl FeedLock {
    fn cooling_down(&self, cooldown: Duration, now: Instant) -> bool {
        self.last_notification
            .is_some_and(|last| now.saturating_duration_since(last) < cooldown)
    }
}

/// Motion event pipeline: debounce, cooldown, snapshot, notify, log.
///
/// The per-feed processing flag stays set for a grace period counted from
/// acquisition, so a burst of triggers from one physical event collapses
/// into a single notification.
pub struct MotionPipeline {
    store: Arc<dyn Store>,
    resolver: Arc<FeedResolver>,
    launcher: Arc<dyn Launcher>,
    mailer: Arc<dyn Mailer>,
    config: NotificationConfig,
    locks: Arc<Mutex<HashMap<i64, FeedLock>>>,
}

impl MotionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<FeedResolver>,
        launcher: Arc<dyn Launcher>,
        mailer: Arc<dyn Mailer>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            launcher,
            mailer,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_processing(&self, feed_id: i64) -> bool {
        self.locks
            .lock()
            .unwrap()
            .get(&feed_id)
            .is_some_and(|l| l.processing)
    }

    pub async fn handle(&self, feed: &Feed) -> MotionOutcome {
        if self.is_processing(feed.id) {
            trace!("[{}] motion ignored, event in progress", feed.name);
            return MotionOutcome::Busy;
        }

        let settings = match self.store.settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to read settings, using defaults: {}", e);
                Settings::default()
            }
        };
        let cooldown = settings.notification_interval;
        let now = Instant::now();

        // Fail fast before touching the lock.
        if self.cooling_down(feed.id, cooldown, now) {
            debug!("[{}] motion ignored, notification cooldown active", feed.name);
            return MotionOutcome::CoolingDown;
        }
        if let Err(outcome) = self.acquire(feed.id, cooldown, now) {
            return outcome;
        }
        // Grace counts from acquisition.
        self.release_at(feed.id, now + Duration::from_secs(self.config.grace_secs));

        info!("Motion detected on [{}], notifying", feed.name);
        let snapshot = self.capture_snapshot(feed).await;
        let kind = self.dispatch(feed, &settings, snapshot.as_deref()).await;

        if let Some(path) = snapshot {
            if let Err(e) = fs::remove_file(&path).await {
                debug!("Failed to remove snapshot {:?}: {}", path, e);
            }
        }

        MotionOutcome::Notified(kind)
    }

    /// Forgets the state of feeds that no longer exist.
    pub fn retain_feeds(&self, desired: &HashSet<i64>) {
        self.locks.lock().unwrap().retain(|id, _| desired.contains(id));
    }

    fn cooling_down(&self, feed_id: i64, cooldown: Duration, now: Instant) -> bool {
        self.locks
            .lock()
            .unwrap()
            .get(&feed_id)
            .is_some_and(|l| l.cooling_down(cooldown, now))
    }

    /// Sets the processing flag and stamps the notification time, re-checking
    /// both under the same lock.
    fn acquire(&self, feed_id: i64, cooldown: Duration, now: Instant) -> Result<(), MotionOutcome> {
        let mut locks = self.locks.lock().unwrap();
        let lock = locks.entry(feed_id).or_default();
        if lock.processing {
            return Err(MotionOutcome::Busy);
        }
        if lock.cooling_down(cooldown, now) {
            return Err(MotionOutcome::CoolingDown);
        }
        lock.processing = true;
        lock.last_notification = Some(now);
        Ok(())
    }

    fn release_at(&self, feed_id: i64, deadline: Instant) {
        let locks = self.locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(lock) = locks.lock().unwrap().get_mut(&feed_id) {
                lock.processing = false;
            }
        });
    }

    /// Best effort single frame grab. `None` on any failure.
    async fn capture_snapshot(&self, feed: &Feed) -> Option<PathBuf> {
        if let Err(e) = fs::create_dir_all(&self.config.temp_dir).await {
            warn!("Cannot create temp dir {:?}: {}", self.config.temp_dir, e);
            return None;
        }
        let path = self.config.temp_dir.join(format!(
            "snapshot-{}-{}.jpg",
            feed.id,
            Utc::now().timestamp_millis()
        ));

        let source = self.resolver.resolve(feed);
        let mut args = source.input_args();
        args.extend([
            "-i".to_string(),
            source.input(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "image2".to_string(),
            path.to_string_lossy().into_owned(),
        ]);

        let request = LaunchRequest {
            purpose: Purpose::Snapshot,
            label: format!("snapshot {}", feed.name),
            args,
            capture_output: false,
        };
        let ProcessHandle {
            control,
            mut events,
            ..
        } = match self.launcher.launch(request) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Snapshot capture failed for [{}]: {}", feed.name, e);
                return None;
            }
        };

        let finished = tokio::time::timeout(
            Duration::from_secs(self.config.snapshot_timeout_secs),
            async {
                while let Some(event) = events.recv().await {
                    match event {
                        ProcessEvent::Ended => return true,
                        ProcessEvent::Failed(reason) => {
                            warn!("Snapshot capture failed for [{}]: {}", feed.name, reason);
                            return false;
                        }
                        _ => {}
                    }
                }
                false
            },
        )
        .await;

        match finished {
            Ok(true) => match fs::try_exists(&path).await {
                Ok(true) => Some(path),
                _ => None,
            },
            Ok(false) => None,
            Err(_) => {
                warn!("Snapshot capture timed out for [{}]", feed.name);
                let _ = control.signal(Signal::Kill);
                None
            }
        }
    }

    async fn dispatch(&self, feed: &Feed, settings: &Settings, snapshot: Option<&Path>) -> ActivityKind {
        let (kind, message) = if settings.system_mode == SystemMode::Home {
            info!("System is in home mode, skipping email for [{}]", feed.name);
            (ActivityKind::Motion, "Motion")
        } else if let Some(transport) = settings.mail_transport() {
            let mail = MailMessage {
                from: self.config.sender.clone(),
                to: transport.recipient.clone(),
                subject: format!("Motion Detected: {}", feed.name),
                body: format!(
                    "Motion was detected on camera {} at {}.",
                    feed.name,
                    Local::now().format("%A, %B %-d, %Y at %-I:%M:%S %p")
                ),
                attachment: snapshot.map(Path::to_path_buf),
            };
            match self.mailer.send(&transport, &mail).await {
                Ok(()) => {
                    info!("Notification sent for [{}]", feed.name);
                    (ActivityKind::Email, "Motion")
                }
                Err(e) => {
                    error!("Failed to send notification for [{}]: {:#}", feed.name, e);
                    (ActivityKind::Error, "Email failed")
                }
            }
        } else {
            info!("SMTP settings not configured, skipping email");
            (ActivityKind::Motion, "Motion")
        };

        if let Err(e) = self.store.record_activity(feed.id, kind, message).await {
            warn!("Failed to record activity for [{}]: {}", feed.name, e);
        }
        kind
    }
}
