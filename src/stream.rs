use crate::config::StreamingConfig;
use crate::cooldown::CooldownGate;
use crate::process::{LaunchRequest, Launcher, ProcessEvent, ProcessHandle, Purpose, Signal};
use crate::resolver::{FeedResolver, ResolvedSource};
use crate::state::SessionRegistry;
use anyhow::bail;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_TRY_AGAIN: u16 = 1013;

static NEXT_VIEWER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerFrame {
    Chunk(Bytes),
    Close(u16),
}

/// One live-view connection as seen by the stream supervisor.
///
/// The queue is bounded: a viewer that cannot keep up loses chunks instead of
/// growing memory.
#[derive(Debug)]
pub struct Viewer {
    id: u64,
    tx: mpsc::Sender<ViewerFrame>,
}

impl Viewer {
    /// `capacity` chunks, plus one slot only the close frame may use.
    pub fn channel(capacity: usize) -> (Viewer, mpsc::Receiver<ViewerFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        let id = NEXT_VIEWER.fetch_add(1, Ordering::Relaxed);
        (Viewer { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// `false` once the connection side is gone.
    fn push(&self, chunk: Bytes) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        if self.tx.capacity() <= 1 {
            trace!("viewer {} not ready, chunk dropped", self.id);
            return true;
        }
        match self.tx.try_send(ViewerFrame::Chunk(chunk)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("viewer {} not ready, chunk dropped", self.id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self, code: u16) {
        if let Err(e) = self.tx.try_send(ViewerFrame::Close(code)) {
            debug!("viewer {} close {} not delivered: {}", self.id, code, e);
        }
    }
}

/// Builds the low-latency MPEG-TS transcode arguments (JSMpeg compatible).
fn stream_args(source: &ResolvedSource, config: &StreamingConfig) -> Vec<String> {
    let mut args = source.input_args();
    if source.is_rtsp() {
        args.extend(
            [
                "-analyzeduration",
                "100000",
                "-probesize",
                "100000",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
                "-strict",
                "experimental",
            ]
            .map(String::from),
        );
    }
    args.push("-i".to_string());
    args.push(source.input());
    args.extend(["-f", "mpegts", "-codec:v", "mpeg1video", "-b:v"].map(String::from));
    args.push(config.bitrate.clone());
    args.push("-r".to_string());
    args.push(config.frame_rate.to_string());
    args.extend(["-bf", "0", "-an", "-"].map(String::from));
    args
}

/// One transcode process per requested address, shared by all its viewers.
pub struct StreamSupervisor {
    resolver: Arc<FeedResolver>,
    launcher: Arc<dyn Launcher>,
    config: StreamingConfig,
    kill_grace: Duration,
    sessions: SessionRegistry<String, Vec<Viewer>>,
    cooldown: CooldownGate<String>,
    /// Serialises the join-or-start and leave-or-stop decisions
    membership: tokio::sync::Mutex<()>,
}

impl StreamSupervisor {
    pub fn new(
        resolver: Arc<FeedResolver>,
        launcher: Arc<dyn Launcher>,
        config: StreamingConfig,
        kill_grace: Duration,
    ) -> Self {
        Self {
            resolver,
            launcher,
            config,
            kill_grace,
            sessions: SessionRegistry::new(),
            cooldown: CooldownGate::new(),
            membership: tokio::sync::Mutex::new(()),
        }
    }

    pub fn viewer_queue(&self) -> usize {
        self.config.viewer_queue
    }

    pub fn active_pids(&self) -> Vec<u32> {
        self.sessions.pids()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn viewer_count(&self, address: &str) -> usize {
        self.sessions
            .with_session(&address.to_string(), |s| s.attached.len())
            .unwrap_or(0)
    }

    /// Joins the running session for `address` or starts one.
    pub async fn subscribe(self: &Arc<Self>, address: &str, viewer: Viewer) -> anyhow::Result<()> {
        let _membership = self.membership.lock().await;
        let key = address.to_string();

        let mut pending = Some(viewer);
        self.sessions
            .with_session(&key, |s| s.attached.extend(pending.take()));
        let Some(viewer) = pending else {
            debug!("Viewer joined running stream {}", address);
            return Ok(());
        };

        let window = Duration::from_secs(self.config.restart_cooldown_secs);
        let now = Instant::now();
        // Keys are client supplied addresses.
        self.cooldown.prune(window, now);
        if !self.cooldown.try_acquire(&key, window, now) {
            viewer.close(CLOSE_TRY_AGAIN);
            bail!("stream for {} restarted too recently", address);
        }

        let source = self.resolver.resolve_address(address);
        let handle = self.launcher.launch(LaunchRequest {
            purpose: Purpose::Stream,
            label: format!("live {}", address),
            args: stream_args(&source, &self.config),
            capture_output: true,
        })?;
        let control = handle.control.clone();
        let generation = match self.sessions.insert(key.clone(), control.clone(), vec![viewer]) {
            Ok(generation) => generation,
            Err(e) => {
                let _ = control.signal(Signal::Kill);
                return Err(e);
            }
        };

        info!("Live stream started for {} (pid {})", address, handle.pid);
        tokio::spawn(self.clone().pump(key, generation, handle));
        Ok(())
    }

    /// Removes a viewer; the last one out stops the process.
    pub async fn unsubscribe(&self, address: &str, viewer_id: u64) {
        let key = address.to_string();
        let session = {
            let _membership = self.membership.lock().await;
            let remaining = self.sessions.with_session(&key, |s| {
                s.attached.retain(|v| v.id != viewer_id);
                s.attached.len()
            });
            match remaining {
                Some(0) => self.sessions.remove(&key),
                _ => None,
            }
        };

        if let Some(session) = session {
            info!("No viewers left for {}, stopping stream", address);
            session.control.terminate(self.kill_grace).await;
        }
    }

    /// Closes every viewer with a normal closure and stops every process.
    pub async fn stop_all(&self) {
        let sessions = {
            let _membership = self.membership.lock().await;
            self.sessions.drain()
        };
        if sessions.is_empty() {
            return;
        }

        info!("Stopping {} live streams", sessions.len());
        let grace = self.kill_grace;
        join_all(sessions.into_iter().map(|(address, session)| async move {
            for viewer in &session.attached {
                viewer.close(CLOSE_NORMAL);
            }
            let outcome = session.control.terminate(grace).await;
            debug!(%address, ?outcome, "live stream stopped");
        }))
        .await;
    }

    async fn pump(self: Arc<Self>, key: String, generation: u64, handle: ProcessHandle) {
        let ProcessHandle {
            control,
            mut events,
            output,
            ..
        } = handle;
        let Some(mut output) = output else {
            warn!("Live stream for {} has no output pipe", key);
            return;
        };

        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(chunk) => {
                        if !self.fan_out(&key, generation, chunk) {
                            break;
                        }
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Some(ProcessEvent::Diagnostic(line)) => {
                        self.sessions.touch(&key, generation);
                        trace!("[live {}] {}", key, line);
                    }
                    Some(ProcessEvent::Started { .. }) => {}
                    Some(ProcessEvent::Failed(reason)) => {
                        warn!("Live stream for {} failed: {}", key, reason);
                        break;
                    }
                    Some(ProcessEvent::Ended) | None => break,
                },
            }
        }

        if let Some(session) = self.sessions.remove_generation(&key, generation) {
            info!(
                "Live stream for {} ended, closing {} viewers",
                key,
                session.attached.len()
            );
            for viewer in &session.attached {
                viewer.close(CLOSE_GOING_AWAY);
            }
            session.control.terminate(self.kill_grace).await;
        } else if !control.has_exited() {
            control.terminate(self.kill_grace).await;
        }
    }

    /// Sends a chunk to every viewer that can take it. Returns `false` when
    /// the session is gone or has nobody left to serve.
    fn fan_out(&self, key: &String, generation: u64, chunk: Bytes) -> bool {
        let remaining = self.sessions.with_generation(key, generation, |s| {
            s.last_activity = Instant::now();
            s.attached.retain(|viewer| viewer.push(chunk.clone()));
            s.attached.len()
        });
        match remaining {
            Some(0) => {
                debug!("All viewers of {} disconnected", key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}
