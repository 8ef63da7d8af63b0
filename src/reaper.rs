use crate::config::ReaperConfig;
use crate::process::{NixSignaller, Signal, Signaller};
use crate::stream::StreamSupervisor;
use crate::supervisor::{FeedSupervisor, Workload};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessStatus, System, UpdateKind};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsProcess {
    pub pid: u32,
    pub age: Duration,
}

/// OS process enumeration and forced kill.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn matching(&self, signature: &str) -> anyhow::Result<Vec<OsProcess>>;
    fn kill(&self, pid: u32) -> anyhow::Result<()>;
}

/// Anything that owns supervised processes.
pub trait PidSource: Send + Sync {
    fn active_pids(&self) -> Vec<u32>;
}

impl<W: Workload> PidSource for FeedSupervisor<W> {
    fn active_pids(&self) -> Vec<u32> {
        FeedSupervisor::active_pids(self)
    }
}

impl PidSource for StreamSupervisor {
    fn active_pids(&self) -> Vec<u32> {
        StreamSupervisor::active_pids(self)
    }
}

#[derive(Default)]
pub struct SysinfoProcessTable {
    signaller: NixSignaller,
}

fn matches_signature(name: &str, cmd: &[String], signature: &str) -> bool {
    if name.contains(signature) {
        return true;
    }
    cmd.first()
        .and_then(|argv0| Path::new(argv0).file_name())
        .is_some_and(|file| file.to_string_lossy().contains(signature))
}

#[async_trait]
impl ProcessTable for SysinfoProcessTable {
    async fn matching(&self, signature: &str) -> anyhow::Result<Vec<OsProcess>> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            bail!("process enumeration is not supported on this platform");
        }
        let signature = signature.to_string();

        tokio::task::spawn_blocking(move || {
            let mut sys = System::new();
            sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

            sys.processes()
                .iter()
                .filter(|(_, process)| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
                .filter(|(_, process)| matches_signature(process.name(), process.cmd(), &signature))
                .map(|(pid, process)| OsProcess {
                    pid: pid.as_u32(),
                    age: Duration::from_secs(process.run_time()),
                })
                .collect()
        })
        .await
        .context("process enumeration panicked")
    }

    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        self.signaller.signal(pid, Signal::Kill)
    }
}

/// Kills signature-matching processes that no supervisor claims.
pub struct ZombieReaper {
    table: Arc<dyn ProcessTable>,
    sources: Vec<Arc<dyn PidSource>>,
    config: ReaperConfig,
    own_pid: u32,
}

impl ZombieReaper {
    pub fn new(table: Arc<dyn ProcessTable>, sources: Vec<Arc<dyn PidSource>>, config: ReaperConfig) -> Self {
        Self {
            table,
            sources,
            config,
            own_pid: std::process::id(),
        }
    }

    /// One sweep. Returns the PIDs that were killed; enumeration failures
    /// skip the sweep.
    pub async fn sweep(&self) -> Vec<u32> {
        let processes = match self.table.matching(&self.config.signature).await {
            Ok(processes) => processes,
            Err(e) => {
                warn!("Reaper: skipping sweep: {:#}", e);
                return Vec::new();
            }
        };

        let owned: HashSet<u32> = self
            .sources
            .iter()
            .flat_map(|source| source.active_pids())
            .collect();
        let min_age = Duration::from_secs(self.config.min_age_secs);

        let mut killed = Vec::new();
        for process in processes {
            if process.pid == self.own_pid || owned.contains(&process.pid) {
                continue;
            }
            if process.age < min_age {
                // Its owner may not have recorded the pid yet.
                debug!("Reaper: pid {} too young ({}s), sparing", process.pid, process.age.as_secs());
                continue;
            }
            warn!(
                "Reaper: killing orphaned {} pid {} (running {}s)",
                self.config.signature,
                process.pid,
                process.age.as_secs()
            );
            match self.table.kill(process.pid) {
                Ok(()) => killed.push(process.pid),
                Err(e) => warn!("Reaper: failed to kill pid {}: {}", process.pid, e),
            }
        }

        if !killed.is_empty() {
            info!("Reaper: killed {} orphaned processes", killed.len());
        }
        killed
    }
}
