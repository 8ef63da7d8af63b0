use crate::config::AppConfig;
use crate::detector::{DetectionSupervisor, MotionDetector};
use crate::motion::MotionPipeline;
use crate::notify::{Mailer, SendmailMailer};
use crate::process::{FfmpegLauncher, Launcher};
use crate::proxy::{CommandReloader, ProxyReconciler, RouteReport, RoutingReloader};
use crate::reaper::{PidSource, ProcessTable, SysinfoProcessTable, ZombieReaper};
use crate::recorder::{self, Recording, RecordingSupervisor, SegmentRecorder};
use crate::resolver::FeedResolver;
use crate::store::{FileStore, Store};
use crate::stream::{StreamSupervisor, Viewer, ViewerFrame};
use crate::supervisor::{ReconcileReport, Timings};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 外部协作者，生产环境与测试中分别注入不同实现
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub launcher: Arc<dyn Launcher>,
    pub mailer: Arc<dyn Mailer>,
    pub reloader: Arc<dyn RoutingReloader>,
    pub process_table: Arc<dyn ProcessTable>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActivePids {
    pub detection: Vec<u32>,
    pub recording: Vec<u32>,
    pub streaming: Vec<u32>,
}

/// 服务门面：持有所有 supervisor，供 HTTP 层与后台任务调用
pub struct Engine {
    config: AppConfig,
    store: Arc<dyn Store>,
    resolver: Arc<FeedResolver>,
    detectors: Arc<DetectionSupervisor>,
    recorders: Arc<RecordingSupervisor>,
    streams: Arc<StreamSupervisor>,
    proxy: Option<ProxyReconciler>,
    reaper: ZombieReaper,
}

impl Engine {
    /// 构建生产环境的服务
    ///
    /// # 错误处理
    /// - 无法打开 feed 目录文件时返回错误（启动失败）
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let store = FileStore::open(&config.server.catalog_path, &config.server.activity_log).await?;
        let deps = Collaborators {
            store: Arc::new(store),
            launcher: Arc::new(FfmpegLauncher::new(config.server.ffmpeg_binary.clone())),
            mailer: Arc::new(SendmailMailer::new(
                config.notifications.mail_command.clone(),
                Duration::from_secs(config.notifications.mail_timeout_secs),
            )),
            reloader: Arc::new(CommandReloader::new(config.proxy.reload_command.clone())),
            process_table: Arc::new(SysinfoProcessTable::default()),
        };
        Ok(Self::new(config, deps))
    }

    pub fn new(config: AppConfig, deps: Collaborators) -> Self {
        let resolver = Arc::new(FeedResolver::new(
            config.proxy.enabled.then(|| config.proxy.rtsp_base.clone()),
        ));
        let kill_grace = config.server.kill_grace();

        let pipeline = Arc::new(MotionPipeline::new(
            deps.store.clone(),
            resolver.clone(),
            deps.launcher.clone(),
            deps.mailer,
            config.notifications.clone(),
        ));
        let detectors = Arc::new(DetectionSupervisor::new(
            MotionDetector::new(config.detection.clone(), pipeline),
            deps.store.clone(),
            resolver.clone(),
            deps.launcher.clone(),
            Timings {
                stale_after: Duration::from_secs(config.detection.stale_after_secs),
                restart_cooldown: Duration::from_secs(config.detection.restart_cooldown_secs),
                kill_grace,
            },
        ));
        let recorders = Arc::new(RecordingSupervisor::new(
            SegmentRecorder::new(config.recording.clone()),
            deps.store.clone(),
            resolver.clone(),
            deps.launcher.clone(),
            Timings {
                stale_after: Duration::from_secs(config.recording.stale_after_secs),
                restart_cooldown: Duration::from_secs(config.recording.restart_cooldown_secs),
                kill_grace,
            },
        ));
        let streams = Arc::new(StreamSupervisor::new(
            resolver.clone(),
            deps.launcher,
            config.streaming.clone(),
            kill_grace,
        ));

        let sources: Vec<Arc<dyn PidSource>> =
            vec![detectors.clone(), recorders.clone(), streams.clone()];
        let reaper = ZombieReaper::new(deps.process_table, sources, config.reaper.clone());
        let proxy = config
            .proxy
            .enabled
            .then(|| ProxyReconciler::new(config.proxy.config_path.clone(), deps.reloader));

        Self {
            config,
            store: deps.store,
            resolver,
            detectors,
            recorders,
            streams,
            proxy,
            reaper,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 启动顺序：同步代理路由 -> 首次 reconcile -> 立即执行一次进程回收
    pub async fn start(&self) {
        if let Err(e) = self.sync_routes().await {
            error!("Initial route sync failed: {:#}", e);
        }
        match self.refresh_detectors().await {
            Ok(report) => info!("Detection started for {} feeds", report.started.len()),
            Err(e) => error!("Initial detection reconcile failed: {:#}", e),
        }
        match self.refresh_recordings().await {
            Ok(report) => info!("Recording started for {} feeds", report.started.len()),
            Err(e) => error!("Initial recording reconcile failed: {:#}", e),
        }
        self.sweep_zombies().await;
    }

    pub async fn refresh_detectors(&self) -> anyhow::Result<ReconcileReport> {
        self.detectors.reconcile().await
    }

    pub async fn refresh_recordings(&self) -> anyhow::Result<ReconcileReport> {
        self.recorders.reconcile().await
    }

    /// 例如灵敏度修改后，所有检测进程需要用新参数重启
    pub async fn restart_all_detectors(&self) -> anyhow::Result<ReconcileReport> {
        info!("Restarting all detectors");
        self.detectors.restart_all().await
    }

    pub async fn stop_all_detectors(&self) {
        self.detectors.stop_all().await;
    }

    pub async fn stop_all_streams(&self) {
        self.streams.stop_all().await;
    }

    pub async fn list_recordings(&self, feed_id: i64) -> anyhow::Result<Vec<Recording>> {
        recorder::list_recordings(&self.config.recording.root, feed_id).await
    }

    /// Resolves a recording file, refusing anything that is not a plain name.
    pub fn recording_path(&self, feed_id: i64, file_name: &str) -> Option<PathBuf> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(
                self.config
                    .recording
                    .root
                    .join(feed_id.to_string())
                    .join(file_name),
            ),
            _ => None,
        }
    }

    /// 为一个实时观看连接创建有界队列
    pub fn viewer_channel(&self) -> (Viewer, mpsc::Receiver<ViewerFrame>) {
        Viewer::channel(self.streams.viewer_queue())
    }

    pub async fn subscribe_live(&self, address: &str, viewer: Viewer) -> anyhow::Result<()> {
        self.streams.subscribe(address, viewer).await
    }

    pub async fn unsubscribe_live(&self, address: &str, viewer_id: u64) {
        self.streams.unsubscribe(address, viewer_id).await;
    }

    pub fn active_pids(&self) -> ActivePids {
        ActivePids {
            detection: self.detectors.active_pids(),
            recording: self.recorders.active_pids(),
            streaming: self.streams.active_pids(),
        }
    }

    /// Refreshes the resolver's route map and heals the routing config.
    /// `None` when the proxy is disabled.
    pub async fn sync_routes(&self) -> anyhow::Result<Option<RouteReport>> {
        let feeds = self.store.list_feeds().await?;
        self.resolver.prime(&feeds);
        match &self.proxy {
            Some(proxy) => Ok(Some(proxy.reconcile(&feeds).await?)),
            None => Ok(None),
        }
    }

    /// 周期检测任务：先修复代理路由（外部修改或启动时失败），再 reconcile
    pub async fn detection_pass(&self) -> anyhow::Result<ReconcileReport> {
        if let Err(e) = self.sync_routes().await {
            warn!("Route sync failed: {:#}", e);
        }
        self.refresh_detectors().await
    }

    /// CRUD 层在 feed 增删改之后调用
    pub async fn feeds_changed(&self) -> anyhow::Result<()> {
        if let Err(e) = self.sync_routes().await {
            // Retried on the next change or restart.
            warn!("Route sync failed: {:#}", e);
        }
        self.refresh_detectors().await?;
        self.refresh_recordings().await?;
        Ok(())
    }

    /// 清理过期录像与活动日志
    pub async fn housekeeping(&self) {
        let retention = match self.store.settings().await {
            Ok(settings) => settings.recording_retention,
            Err(e) => {
                warn!("Failed to read settings for cleanup, using defaults: {}", e);
                crate::model::Settings::default().recording_retention
            }
        };
        if let Err(e) =
            recorder::cleanup_old_recordings(&self.config.recording.root, retention, SystemTime::now()).await
        {
            error!("Recording cleanup failed: {:#}", e);
        }

        let activity_age =
            Duration::from_secs(self.config.notifications.activity_retention_hours.saturating_mul(3600));
        match self.store.prune_activity(activity_age).await {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} activity entries", n),
            Err(e) => error!("Activity prune failed: {:#}", e),
        }
    }

    pub async fn sweep_zombies(&self) -> Vec<u32> {
        self.reaper.sweep().await
    }

    pub fn session_counts(&self) -> serde_json::Value {
        serde_json::json!({
            "detection": self.detectors.session_count(),
            "recording": self.recorders.session_count(),
            "streaming": self.streams.session_count(),
        })
    }

    /// 优雅关闭：先断开实时观看，再停止检测与录像进程
    pub async fn shutdown(&self) {
        self.streams.stop_all().await;
        tokio::join!(self.detectors.stop_all(), self.recorders.stop_all());
        info!("All supervised processes stopped");
    }
}
