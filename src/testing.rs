use crate::config::AppConfig;
use crate::engine::{Collaborators, Engine};
use crate::model::{ActivityKind, Feed, MailTransport, Settings};
use crate::notify::{MailMessage, Mailer};
use crate::process::{
    LaunchRequest, Launcher, ProcessControl, ProcessEvent, ProcessHandle, Purpose, Signal,
    Signaller,
};
use crate::proxy::RoutingReloader;
use crate::reaper::{OsProcess, ProcessTable};
use crate::state::SharedState;
use crate::store::Store;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub fn feed(id: i64, name: &str, source: &str) -> Feed {
    Feed {
        id,
        name: name.to_string(),
        source: source.to_string(),
        settings: serde_json::Value::Null,
    }
}

/// Lets spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Polls `condition` until it holds. Needed when spawned work goes through
/// `tokio::fs`, which `settle` cannot wait for.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Default)]
pub struct FakeSignaller {
    sent: Mutex<Vec<(u32, Signal)>>,
    children: Mutex<HashMap<u32, (watch::Sender<bool>, mpsc::Sender<ProcessEvent>)>>,
}

impl FakeSignaller {
    pub fn sent(&self) -> Vec<(u32, Signal)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn signals_for(&self, pid: u32) -> Vec<Signal> {
        self.sent()
            .into_iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, s)| s)
            .collect()
    }
}

impl Signaller for FakeSignaller {
    /// Every signal ends the fake process, like ffmpeg does on SIGTERM.
    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((pid, signal));
        if let Some((exited, events)) = self.children.lock().unwrap().get(&pid) {
            exited.send_replace(true);
            let _ = events.try_send(ProcessEvent::Failed(format!("killed by {:?}", signal)));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeProcess {
    pub pid: u32,
    pub request: LaunchRequest,
    pub events: mpsc::Sender<ProcessEvent>,
    pub output: Option<mpsc::Sender<Bytes>>,
}

impl FakeProcess {
    pub async fn emit(&self, event: ProcessEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn line(&self, text: &str) {
        self.emit(ProcessEvent::Diagnostic(text.to_string())).await;
    }
}

pub struct FakeLauncher {
    pub signaller: Arc<FakeSignaller>,
    launched: Mutex<Vec<FakeProcess>>,
    next_pid: AtomicU32,
    refuse: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signaller: Arc::new(FakeSignaller::default()),
            launched: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1000),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn refuse_spawns(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn launched(&self, purpose: Purpose) -> Vec<FakeProcess> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.request.purpose == purpose)
            .cloned()
            .collect()
    }

    pub fn last(&self, purpose: Purpose) -> FakeProcess {
        self.launched(purpose)
            .pop()
            .expect("no process launched for purpose")
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, request: LaunchRequest) -> anyhow::Result<ProcessHandle> {
        if self.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("spawn refused");
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (exit_tx, exit_rx) = watch::channel(false);
        let (output_tx, output_rx) = if request.capture_output {
            let (tx, rx) = mpsc::channel(64);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let _ = events_tx.try_send(ProcessEvent::Started { pid });
        if request.purpose == Purpose::Snapshot {
            let _ = events_tx.try_send(ProcessEvent::Ended);
            exit_tx.send_replace(true);
        }

        self.signaller
            .children
            .lock()
            .unwrap()
            .insert(pid, (exit_tx, events_tx.clone()));
        self.launched.lock().unwrap().push(FakeProcess {
            pid,
            request,
            events: events_tx,
            output: output_tx,
        });

        Ok(ProcessHandle {
            pid,
            control: ProcessControl::new(pid, self.signaller.clone(), exit_rx),
            events: events_rx,
            output: output_rx,
        })
    }
}

pub struct MemoryStore {
    feeds: Mutex<Vec<Feed>>,
    settings: Mutex<Settings>,
    activity: Mutex<Vec<(i64, ActivityKind, String)>>,
    prunes: Mutex<Vec<Duration>>,
}

impl MemoryStore {
    pub fn new(feeds: Vec<Feed>, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            feeds: Mutex::new(feeds),
            settings: Mutex::new(settings),
            activity: Mutex::new(Vec::new()),
            prunes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_feeds(&self, feeds: Vec<Feed>) {
        *self.feeds.lock().unwrap() = feeds;
    }

    pub fn activity(&self) -> Vec<(i64, ActivityKind, String)> {
        self.activity.lock().unwrap().clone()
    }

    /// Max ages passed to `prune_activity`, in call order.
    pub fn prunes(&self) -> Vec<Duration> {
        self.prunes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        Ok(self.feeds.lock().unwrap().clone())
    }

    async fn settings(&self) -> anyhow::Result<Settings> {
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn record_activity(
        &self,
        feed_id: i64,
        kind: ActivityKind,
        message: &str,
    ) -> anyhow::Result<()> {
        self.activity
            .lock()
            .unwrap()
            .push((feed_id, kind, message.to_string()));
        Ok(())
    }

    async fn prune_activity(&self, max_age: Duration) -> anyhow::Result<usize> {
        self.prunes.lock().unwrap().push(max_age);
        Ok(0)
    }
}

#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<(MailTransport, MailMessage)>>,
    fail: AtomicBool,
}

impl FakeMailer {
    pub fn failing() -> Self {
        let mailer = Self::default();
        mailer.fail.store(true, Ordering::SeqCst);
        mailer
    }

    pub fn sent(&self) -> Vec<(MailTransport, MailMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, transport: &MailTransport, message: &MailMessage) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        self.sent
            .lock()
            .unwrap()
            .push((transport.clone(), message.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingReloader {
    pub reloads: AtomicUsize,
}

impl RoutingReloader for CountingReloader {
    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Process table of a host with no strays.
pub struct EmptyProcessTable;

#[async_trait]
impl ProcessTable for EmptyProcessTable {
    async fn matching(&self, _signature: &str) -> anyhow::Result<Vec<OsProcess>> {
        Ok(Vec::new())
    }

    fn kill(&self, _pid: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Engine over in-memory fakes with one feed (1, `rtsp://cam1`), the proxy
/// disabled and every directory under `temp`.
pub fn shared_engine(temp: &tempfile::TempDir, launcher: Arc<FakeLauncher>) -> SharedState {
    let mut config = AppConfig::default();
    config.proxy.enabled = false;
    config.recording.root = temp.path().join("recordings");
    config.notifications.temp_dir = temp.path().join("tmp");

    Arc::new(Engine::new(
        config,
        Collaborators {
            store: MemoryStore::new(vec![feed(1, "Front", "rtsp://cam1")], Settings::default()),
            launcher,
            mailer: Arc::new(FakeMailer::default()),
            reloader: Arc::new(CountingReloader::default()),
            process_table: Arc::new(EmptyProcessTable),
        },
    ))
}
