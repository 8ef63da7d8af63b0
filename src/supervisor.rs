use crate::cooldown::CooldownGate;
use crate::engine::Engine;
use crate::model::{Feed, Settings};
use crate::process::{LaunchRequest, Launcher, ProcessEvent, ProcessHandle, Purpose, Signal};
use crate::resolver::{FeedResolver, ResolvedSource};
use crate::state::SessionRegistry;
use crate::store::Store;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a per-feed supervisor runs for each feed.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    const PURPOSE: Purpose;
    /// Log prefix, e.g. `Detector`
    const LABEL: &'static str;

    /// Builds the ffmpeg arguments for one feed. May touch the filesystem.
    async fn prepare(
        &self,
        feed: &Feed,
        settings: &Settings,
        source: &ResolvedSource,
    ) -> anyhow::Result<Vec<String>>;

    /// Called for every stderr line of a running session. Must not block.
    fn on_diagnostic(&self, _feed: &Feed, _line: &str) {}

    /// Drops per-feed state of feeds outside `desired`.
    fn retain_feeds(&self, _desired: &HashSet<i64>) {}
}

#[derive(Debug, Clone)]
pub struct Timings {
    pub stale_after: Duration,
    pub restart_cooldown: Duration,
    pub kill_grace: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Feeds no longer in the desired set
    pub stopped: Vec<i64>,
    /// Sessions killed for silence
    pub stale: Vec<i64>,
    pub started: Vec<i64>,
    pub cooling_down: Vec<i64>,
    pub failed: Vec<i64>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !(self.stopped.is_empty()
            && self.stale.is_empty()
            && self.started.is_empty()
            && self.failed.is_empty())
    }
}

/// Keeps exactly one process per desired feed running.
pub struct FeedSupervisor<W: Workload> {
    workload: W,
    store: Arc<dyn Store>,
    resolver: Arc<FeedResolver>,
    launcher: Arc<dyn Launcher>,
    sessions: SessionRegistry<i64>,
    cooldown: CooldownGate<i64>,
    /// 同一时间只允许一次 reconcile
    pass: tokio::sync::Mutex<()>,
    timings: Timings,
}

impl<W: Workload> FeedSupervisor<W> {
    pub fn new(
        workload: W,
        store: Arc<dyn Store>,
        resolver: Arc<FeedResolver>,
        launcher: Arc<dyn Launcher>,
        timings: Timings,
    ) -> Self {
        Self {
            workload,
            store,
            resolver,
            launcher,
            sessions: SessionRegistry::new(),
            cooldown: CooldownGate::new(),
            pass: tokio::sync::Mutex::new(()),
            timings,
        }
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    pub fn active_pids(&self) -> Vec<u32> {
        self.sessions.pids()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_running(&self, feed_id: i64) -> bool {
        self.sessions.contains(&feed_id)
    }

    /// 对比期望的 feed 集合与当前会话，停止多余的、杀掉卡死的、启动缺失的
    pub async fn reconcile(self: &Arc<Self>) -> anyhow::Result<ReconcileReport> {
        let _pass = self.pass.lock().await;

        let feeds = self.store.list_feeds().await?;
        let settings = match self.store.settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("{}: failed to read settings, using defaults: {}", W::LABEL, e);
                Settings::default()
            }
        };
        let desired: HashSet<i64> = feeds.iter().map(|f| f.id).collect();
        let mut report = ReconcileReport::default();
        self.workload.retain_feeds(&desired);
        self.cooldown.prune(self.timings.restart_cooldown, Instant::now());

        // --- 阶段 1: 停止已删除的 feed ---
        for id in self.sessions.keys() {
            if desired.contains(&id) {
                continue;
            }
            if let Some(session) = self.sessions.remove(&id) {
                info!("{}: feed {} removed, stopping pid {}", W::LABEL, id, session.control.pid());
                let grace = self.timings.kill_grace;
                tokio::spawn(async move {
                    session.control.terminate(grace).await;
                });
                report.stopped.push(id);
            }
        }

        // --- 阶段 2: 强制结束长时间无输出的进程 ---
        for id in self.sessions.stale_keys(self.timings.stale_after, Instant::now()) {
            if let Some(session) = self.sessions.remove(&id) {
                warn!(
                    "{}: feed {} silent for over {}s, killing pid {}",
                    W::LABEL,
                    id,
                    self.timings.stale_after.as_secs(),
                    session.control.pid()
                );
                if let Err(e) = session.control.signal(Signal::Kill) {
                    warn!("{}: kill of pid {} failed: {}", W::LABEL, session.control.pid(), e);
                }
                report.stale.push(id);
            }
        }

        // --- 阶段 3: 启动缺失的会话 ---
        for feed in &feeds {
            if self.sessions.contains(&feed.id) {
                continue;
            }
            if !self
                .cooldown
                .try_acquire(&feed.id, self.timings.restart_cooldown, Instant::now())
            {
                debug!("{}: [{}] in restart cooldown", W::LABEL, feed.name);
                report.cooling_down.push(feed.id);
                continue;
            }
            match self.start(feed, &settings).await {
                Ok(()) => report.started.push(feed.id),
                Err(e) => {
                    error!("{}: failed to start [{}]: {:#}", W::LABEL, feed.name, e);
                    report.failed.push(feed.id);
                }
            }
        }

        Ok(report)
    }

    async fn start(self: &Arc<Self>, feed: &Feed, settings: &Settings) -> anyhow::Result<()> {
        let source = self.resolver.resolve(feed);
        let args = self.workload.prepare(feed, settings, &source).await?;

        let handle = self.launcher.launch(LaunchRequest {
            purpose: W::PURPOSE,
            label: feed.name.clone(),
            args,
            capture_output: false,
        })?;
        let generation = match self.sessions.insert(feed.id, handle.control.clone(), ()) {
            Ok(generation) => generation,
            Err(e) => {
                let _ = handle.control.signal(Signal::Kill);
                return Err(e);
            }
        };

        info!("{}: started [{}] (pid {})", W::LABEL, feed.name, handle.pid);
        tokio::spawn(self.clone().monitor(feed.clone(), generation, handle));
        Ok(())
    }

    async fn monitor(self: Arc<Self>, feed: Feed, generation: u64, handle: ProcessHandle) {
        let ProcessHandle {
            control,
            mut events,
            ..
        } = handle;

        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Started { pid } => debug!("{}: [{}] pid {} up", W::LABEL, feed.name, pid),
                ProcessEvent::Diagnostic(line) => {
                    self.sessions.touch(&feed.id, generation);
                    self.workload.on_diagnostic(&feed, &line);
                }
                ProcessEvent::Ended => {
                    info!("{}: [{}] ended", W::LABEL, feed.name);
                    self.sessions.remove_generation(&feed.id, generation);
                    return;
                }
                ProcessEvent::Failed(reason) => {
                    error!("{}: [{}] failed: {}", W::LABEL, feed.name, reason);
                    // Make sure nothing is left behind.
                    let _ = control.signal(Signal::Kill);
                    self.sessions.remove_generation(&feed.id, generation);
                    return;
                }
            }
        }
        self.sessions.remove_generation(&feed.id, generation);
    }

    /// Graceful-then-forced termination of every session, in parallel.
    pub async fn stop_all(&self) {
        let _pass = self.pass.lock().await;
        let sessions = self.sessions.drain();
        if sessions.is_empty() {
            return;
        }

        info!("{}: stopping {} sessions", W::LABEL, sessions.len());
        let grace = self.timings.kill_grace;
        join_all(sessions.into_iter().map(|(id, session)| async move {
            let outcome = session.control.terminate(grace).await;
            debug!(feed_id = id, ?outcome, "{} session stopped", W::LABEL);
        }))
        .await;
    }

    /// Stops everything and starts again without waiting out cooldowns.
    pub async fn restart_all(self: &Arc<Self>) -> anyhow::Result<ReconcileReport> {
        self.stop_all().await;
        self.cooldown.clear();
        self.reconcile().await
    }
}

/// 一次性重新计时的周期任务：上一次执行结束后才开始计时，不会重叠
pub async fn periodic<F, Fut>(interval: Duration, shutdown: CancellationToken, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        task().await;
    }
}

fn log_pass(label: &str, result: anyhow::Result<ReconcileReport>) {
    match result {
        Ok(report) if report.changed() => info!(
            "{} reconcile: started {:?}, stopped {:?}, stale {:?}, failed {:?}",
            label, report.started, report.stopped, report.stale, report.failed
        ),
        Ok(_) => {}
        Err(e) => error!("{} reconcile failed: {:#}", label, e),
    }
}

/// 启动所有后台任务（检测/录像 reconcile、录像清理、进程回收）
///
/// 首次 reconcile 与回收由 [`Engine::start`] 完成，这些循环从一个间隔之后开始；
/// 录像清理在任务启动时立即执行一次
pub fn spawn_background(engine: Arc<Engine>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let config = engine.config().clone();
    let mut tasks = Vec::new();

    let e = engine.clone();
    tasks.push(tokio::spawn(periodic(
        Duration::from_secs(config.detection.reconcile_interval_secs),
        shutdown.clone(),
        move || {
            let e = e.clone();
            async move { log_pass("Detection", e.detection_pass().await) }
        },
    )));

    let e = engine.clone();
    tasks.push(tokio::spawn(periodic(
        Duration::from_secs(config.recording.reconcile_interval_secs),
        shutdown.clone(),
        move || {
            let e = e.clone();
            async move { log_pass("Recording", e.refresh_recordings().await) }
        },
    )));

    let e = engine.clone();
    let cleanup_interval = Duration::from_secs(config.recording.cleanup_interval_secs);
    let cleanup_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        // 清理任务启动时先执行一次
        e.housekeeping().await;
        periodic(cleanup_interval, cleanup_shutdown, move || {
            let e = e.clone();
            async move { e.housekeeping().await }
        })
        .await
    }));

    let e = engine;
    tasks.push(tokio::spawn(periodic(
        Duration::from_secs(config.reaper.interval_secs),
        shutdown,
        move || {
            let e = e.clone();
            async move {
                e.sweep_zombies().await;
            }
        },
    )));

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{feed, settle, FakeLauncher, MemoryStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Echo {
        lines: Mutex<Vec<String>>,
        retained: Mutex<Option<HashSet<i64>>>,
    }

    #[async_trait]
    impl Workload for Echo {
        const PURPOSE: Purpose = Purpose::Detection;
        const LABEL: &'static str = "Echo";

        async fn prepare(
            &self,
            _feed: &Feed,
            _settings: &Settings,
            source: &ResolvedSource,
        ) -> anyhow::Result<Vec<String>> {
            Ok(vec!["-i".to_string(), source.input()])
        }

        fn on_diagnostic(&self, _feed: &Feed, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn retain_feeds(&self, desired: &HashSet<i64>) {
            *self.retained.lock().unwrap() = Some(desired.clone());
        }
    }

    fn timings() -> Timings {
        Timings {
            stale_after: Duration::from_secs(120),
            restart_cooldown: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }

    fn rig(feeds: Vec<Feed>) -> (Arc<FeedSupervisor<Echo>>, Arc<MemoryStore>, Arc<FakeLauncher>) {
        let store = MemoryStore::new(feeds, Settings::default());
        let launcher = FakeLauncher::new();
        let supervisor = Arc::new(FeedSupervisor::new(
            Echo::default(),
            store.clone(),
            Arc::new(FeedResolver::new(None)),
            launcher.clone(),
            timings(),
        ));
        (supervisor, store, launcher)
    }

    fn two_feeds() -> Vec<Feed> {
        vec![feed(1, "Front", "rtsp://cam1"), feed(2, "Back", "rtsp://cam2")]
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_passes_keep_one_session_per_feed() {
        let (supervisor, _store, launcher) = rig(two_feeds());

        let report = supervisor.reconcile().await.unwrap();
        assert_eq!(report.started, vec![1, 2]);

        tokio::time::advance(Duration::from_secs(30)).await;
        let report = supervisor.reconcile().await.unwrap();
        assert!(!report.changed());
        assert_eq!(launcher.launched(Purpose::Detection).len(), 2);
        assert_eq!(supervisor.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_feed_is_terminated_and_dropped() {
        let (supervisor, store, launcher) = rig(two_feeds());
        supervisor.reconcile().await.unwrap();
        let back = launcher.launched(Purpose::Detection)[1].pid;

        store.set_feeds(vec![feed(1, "Front", "rtsp://cam1")]);
        let report = supervisor.reconcile().await.unwrap();
        settle().await;

        assert_eq!(report.stopped, vec![2]);
        assert!(!supervisor.is_running(2));
        assert!(supervisor.is_running(1));
        assert_eq!(launcher.signaller.signals_for(back), vec![Signal::Terminate]);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_feed_state_is_released() {
        let (supervisor, store, _launcher) = rig(two_feeds());
        supervisor.reconcile().await.unwrap();
        assert_eq!(supervisor.cooldown.len(), 2);

        store.set_feeds(vec![feed(1, "Front", "rtsp://cam1")]);
        tokio::time::advance(Duration::from_secs(10)).await;
        supervisor.reconcile().await.unwrap();

        assert_eq!(
            supervisor.workload().retained.lock().unwrap().clone(),
            Some(HashSet::from([1]))
        );
        assert_eq!(supervisor.cooldown.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_is_killed_and_restarted_in_the_same_pass() {
        let (supervisor, _store, launcher) = rig(vec![feed(1, "Front", "rtsp://cam1")]);
        supervisor.reconcile().await.unwrap();
        let first = launcher.last(Purpose::Detection).pid;

        tokio::time::advance(Duration::from_secs(121)).await;
        let report = supervisor.reconcile().await.unwrap();
        assert_eq!(report.stale, vec![1]);
        assert_eq!(report.started, vec![1]);
        assert_eq!(launcher.signaller.signals_for(first), vec![Signal::Kill]);

        // The killed session's failure must not evict its successor.
        settle().await;
        let second = launcher.last(Purpose::Detection).pid;
        assert_ne!(first, second);
        assert_eq!(supervisor.active_pids(), vec![second]);
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostic_output_keeps_a_session_fresh() {
        let (supervisor, _store, launcher) = rig(vec![feed(1, "Front", "rtsp://cam1")]);
        supervisor.reconcile().await.unwrap();
        let process = launcher.last(Purpose::Detection);

        tokio::time::advance(Duration::from_secs(100)).await;
        process.line("frame=  100 fps=1.0").await;
        settle().await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let report = supervisor.reconcile().await.unwrap();
        assert!(report.stale.is_empty());
        assert_eq!(
            supervisor.workload().lines.lock().unwrap().clone(),
            vec!["frame=  100 fps=1.0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_process_is_killed_dropped_and_retried_after_cooldown() {
        let (supervisor, _store, launcher) = rig(vec![feed(1, "Front", "rtsp://cam1")]);
        supervisor.reconcile().await.unwrap();
        let process = launcher.last(Purpose::Detection);

        process.emit(ProcessEvent::Failed("exited with 1".into())).await;
        settle().await;
        assert!(!supervisor.is_running(1));
        assert_eq!(launcher.signaller.signals_for(process.pid), vec![Signal::Kill]);

        let report = supervisor.reconcile().await.unwrap();
        assert_eq!(report.cooling_down, vec![1]);

        tokio::time::advance(Duration::from_secs(10)).await;
        let report = supervisor.reconcile().await.unwrap();
        assert_eq!(report.started, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_end_drops_the_session() {
        let (supervisor, _store, launcher) = rig(vec![feed(1, "Front", "rtsp://cam1")]);
        supervisor.reconcile().await.unwrap();

        launcher.last(Purpose::Detection).emit(ProcessEvent::Ended).await;
        settle().await;
        assert_eq!(supervisor.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failure_does_not_block_other_feeds() {
        let (supervisor, _store, launcher) = rig(two_feeds());
        launcher.refuse_spawns(true);
        let report = supervisor.reconcile().await.unwrap();
        assert_eq!(report.failed, vec![1, 2]);

        launcher.refuse_spawns(false);
        tokio::time::advance(Duration::from_secs(10)).await;
        let report = supervisor.reconcile().await.unwrap();
        assert_eq!(report.started, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_terminates_everything() {
        let (supervisor, _store, launcher) = rig(two_feeds());
        supervisor.reconcile().await.unwrap();

        supervisor.stop_all().await;
        assert_eq!(supervisor.session_count(), 0);
        for process in launcher.launched(Purpose::Detection) {
            assert_eq!(launcher.signaller.signals_for(process.pid), vec![Signal::Terminate]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_all_bypasses_cooldown() {
        let (supervisor, _store, launcher) = rig(two_feeds());
        supervisor.reconcile().await.unwrap();

        let report = supervisor.restart_all().await.unwrap();
        assert_eq!(report.started, vec![1, 2]);
        assert_eq!(launcher.launched(Purpose::Detection).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_after_each_interval_until_cancelled() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let c = count.clone();
        let task = tokio::spawn(periodic(Duration::from_secs(60), shutdown.clone(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }));

        settle().await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
