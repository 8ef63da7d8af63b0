use anyhow::{anyhow, bail, Context};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 256;
const OUTPUT_QUEUE: usize = 64;
/// Refuse to spawn below this much available memory (KB)
const MIN_AVAILABLE_KB: u64 = 5120;
const MAX_DIAGNOSTIC_LINE: usize = 8 * 1024;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Detection,
    Recording,
    Stream,
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub purpose: Purpose,
    /// Human readable owner, used in logs
    pub label: String,
    pub args: Vec<String>,
    /// Pipe stdout into [`ProcessHandle::output`]
    pub capture_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    Diagnostic(String),
    Ended,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Forced,
}

/// Delivers a signal to a PID.
pub trait Signaller: Send + Sync {
    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal as NixSignal};
        use nix::unistd::Pid;

        let sig = match signal {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        let raw = i32::try_from(pid).context("pid out of range")?;

        match kill(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(()),
            // Already gone
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(anyhow!("kill({}, {:?}) failed: {}", pid, sig, e)),
        }
    }
}

/// Clonable control side of a launched process.
#[derive(Clone)]
pub struct ProcessControl {
    pid: u32,
    signaller: Arc<dyn Signaller>,
    exited: watch::Receiver<bool>,
}

impl fmt::Debug for ProcessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessControl")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ProcessControl {
    pub fn new(pid: u32, signaller: Arc<dyn Signaller>, exited: watch::Receiver<bool>) -> Self {
        Self {
            pid,
            signaller,
            exited,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Signals the process by PID. A process already known to have exited is
    /// not signalled, its PID may have been reused.
    pub fn signal(&self, signal: Signal) -> anyhow::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.signaller.signal(self.pid, signal)
    }

    pub async fn wait_exit(&self) {
        let mut exited = self.exited.clone();
        // A dropped sender means the watcher task is gone, so is the child.
        let _ = exited.wait_for(|done| *done).await;
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and wait up to `grace` again.
    pub async fn terminate(&self, grace: Duration) -> Termination {
        if self.has_exited() {
            return Termination::AlreadyExited;
        }

        if let Err(e) = self.signal(Signal::Terminate) {
            warn!("SIGTERM to pid {} failed: {}", self.pid, e);
        }
        if tokio::time::timeout(grace, self.wait_exit()).await.is_ok() {
            return Termination::Graceful;
        }

        warn!(
            "Process {} ignored SIGTERM for {}ms, killing",
            self.pid,
            grace.as_millis()
        );
        if let Err(e) = self.signal(Signal::Kill) {
            warn!("SIGKILL to pid {} failed: {}", self.pid, e);
        }
        let _ = tokio::time::timeout(grace, self.wait_exit()).await;
        Termination::Forced
    }
}

/// A launched process. `pid` is captured at spawn time and echoed by the
/// first `Started` event.
pub struct ProcessHandle {
    pub pid: u32,
    pub control: ProcessControl,
    pub events: mpsc::Receiver<ProcessEvent>,
    pub output: Option<mpsc::Receiver<Bytes>>,
}

pub trait Launcher: Send + Sync {
    fn launch(&self, request: LaunchRequest) -> anyhow::Result<ProcessHandle>;
}

pub struct FfmpegLauncher {
    binary: String,
    signaller: Arc<dyn Signaller>,
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            signaller: Arc::new(NixSignaller),
        }
    }
}

impl Launcher for FfmpegLauncher {
    fn launch(&self, request: LaunchRequest) -> anyhow::Result<ProcessHandle> {
        ensure_memory_headroom()?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-nostdin").arg("-y");
        cmd.args(&request.args);

        cmd.stdin(Stdio::null());
        cmd.stdout(if request.capture_output {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {} for [{}]", self.binary, request.label))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("[{}] exited before a pid was assigned", request.label))?;

        debug!("[{}] {} {}", request.label, self.binary, request.args.join(" "));

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (exit_tx, exit_rx) = watch::channel(false);

        let output = match child.stdout.take() {
            Some(stdout) if request.capture_output => {
                let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
                tokio::spawn(pump_output(stdout, tx));
                Some(rx)
            }
            _ => None,
        };

        let stderr = child.stderr.take();
        tokio::spawn(watch_child(child, stderr, events_tx, exit_tx, request.label, pid));

        Ok(ProcessHandle {
            pid,
            control: ProcessControl::new(pid, self.signaller.clone(), exit_rx),
            events: events_rx,
            output,
        })
    }
}

fn ensure_memory_headroom() -> anyhow::Result<()> {
    match sys_info::mem_info() {
        Ok(mem) if mem.avail < MIN_AVAILABLE_KB => {
            bail!("Insufficient system memory ({} KB available)", mem.avail)
        }
        Ok(_) => Ok(()),
        Err(e) => {
            // Not fatal, the spawn itself will tell.
            warn!("Failed to check memory usage: {}", e);
            Ok(())
        }
    }
}

async fn watch_child(
    mut child: Child,
    stderr: Option<ChildStderr>,
    events: mpsc::Sender<ProcessEvent>,
    exited: watch::Sender<bool>,
    label: String,
    pid: u32,
) {
    let _ = events.send(ProcessEvent::Started { pid }).await;

    let diagnostics = stderr.map(|stderr| {
        let events = events.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, DiagnosticCodec);
            let mut forwarding = true;
            // Keep draining after the receiver is gone so the child never
            // blocks on a full stderr pipe.
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) if forwarding => {
                        if events.send(ProcessEvent::Diagnostic(line)).await.is_err() {
                            forwarding = false;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("stderr read failed for pid {}: {}", pid, e);
                        break;
                    }
                }
            }
        })
    });

    let status = child.wait().await;
    if let Some(task) = diagnostics {
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
    }
    exited.send_replace(true);

    let event = match status {
        Ok(status) if status.success() => {
            info!("[{}] process {} ended", label, pid);
            ProcessEvent::Ended
        }
        Ok(status) => ProcessEvent::Failed(format!("exited with {}", status)),
        Err(e) => ProcessEvent::Failed(format!("wait failed: {}", e)),
    };
    let _ = events.send(event).await;
}

async fn pump_output(stdout: ChildStdout, output: mpsc::Sender<Bytes>) {
    let mut chunks = ReaderStream::new(stdout);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                if output.send(bytes).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("stdout read failed: {}", e);
                break;
            }
        }
    }
}

/// Splits ffmpeg stderr into lines on `\n` or `\r` (progress lines end in `\r`).
#[derive(Debug, Default)]
pub struct DiagnosticCodec;

impl DiagnosticCodec {
    fn text(raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

impl Decoder for DiagnosticCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let Some(pos) = buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                if buf.len() > MAX_DIAGNOSTIC_LINE {
                    let raw = buf.split();
                    return Ok(Self::text(&raw));
                }
                return Ok(None);
            };
            let raw = buf.split_to(pos + 1);
            if let Some(text) = Self::text(&raw[..pos]) {
                return Ok(Some(text));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let raw = buf.split();
        Ok(Self::text(&raw))
    }
}
