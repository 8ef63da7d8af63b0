use crate::model::Feed;
use crate::resolver::route_key;
use anyhow::{anyhow, Context};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Restarts the routing component after its config changed. Fire-and-forget.
pub trait RoutingReloader: Send + Sync {
    fn reload(&self);
}

pub struct CommandReloader {
    command: Vec<String>,
}

impl CommandReloader {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl RoutingReloader for CommandReloader {
    fn reload(&self) {
        let Some((program, args)) = self.command.split_first() else {
            warn!("No routing reload command configured, skipping reload");
            return;
        };
        let program = program.clone();
        let args = args.to_vec();

        tokio::spawn(async move {
            let result = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await;
            match result {
                Ok(out) if out.status.success() => info!("Routing component reloaded"),
                Ok(out) => error!(
                    "Routing reload `{}` exited with {}: {}",
                    program,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                // Stale routes heal on the next pass.
                Err(e) => error!("Routing reload `{}` failed: {}", program, e),
            }
        });
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RouteReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl RouteReport {
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Keeps the `feed_<id>` paths of the routing config equal to the feed set.
///
/// Only this type writes the file. Changes are computed on a full parse and
/// written through a temp file + rename.
pub struct ProxyReconciler {
    config_path: PathBuf,
    reloader: Arc<dyn RoutingReloader>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ProxyReconciler {
    pub fn new(config_path: PathBuf, reloader: Arc<dyn RoutingReloader>) -> Self {
        Self {
            config_path,
            reloader,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn reconcile(&self, feeds: &[Feed]) -> anyhow::Result<RouteReport> {
        let _guard = self.write_lock.lock().await;

        let content = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("routing config {:?} not readable", self.config_path))?;
        let mut doc: Value = if content.trim().is_empty() {
            Value::Mapping(Mapping::new())
        } else {
            serde_yaml::from_str(&content).context("routing config is not valid YAML")?
        };

        let report = apply_routes(&mut doc, feeds)?;
        if !report.changed() {
            info!("Routing config in sync ({} feeds)", feeds.len());
            return Ok(report);
        }

        let rendered = serde_yaml::to_string(&doc)?;
        write_atomically(&self.config_path, &rendered).await?;
        info!(
            "Routing config healed: +{:?} ~{:?} -{:?}",
            report.added, report.updated, report.removed
        );
        self.reloader.reload();
        Ok(report)
    }
}

fn route_entry(source: &str) -> Value {
    let mut entry = Mapping::new();
    entry.insert("source".into(), source.into());
    entry.insert("sourceOnDemand".into(), false.into());
    Value::Mapping(entry)
}

fn route_is_current(entry: &Value, source: &str) -> bool {
    let eager = match entry.get("sourceOnDemand") {
        Some(Value::Bool(on_demand)) => !on_demand,
        // Hand-written YAML 1.1 style
        Some(Value::String(s)) => s == "no",
        _ => false,
    };
    eager && entry.get("source").and_then(Value::as_str) == Some(source)
}

/// Adds missing, refreshes stale and removes ghost `feed_*` paths in place.
pub fn apply_routes(doc: &mut Value, feeds: &[Feed]) -> anyhow::Result<RouteReport> {
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| anyhow!("routing config root is not a mapping"))?;
    if root.get("paths").map_or(true, Value::is_null) {
        root.insert("paths".into(), Value::Mapping(Mapping::new()));
    }
    let paths = root
        .get_mut("paths")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| anyhow!("`paths` in routing config is not a mapping"))?;

    let desired: BTreeMap<String, &Feed> = feeds.iter().map(|f| (route_key(f.id), f)).collect();
    let mut report = RouteReport::default();

    let ghosts: Vec<String> = paths
        .keys()
        .filter_map(Value::as_str)
        .filter(|key| key.starts_with("feed_") && !desired.contains_key(*key))
        .map(str::to_string)
        .collect();
    for key in ghosts {
        paths.remove(key.as_str());
        report.removed.push(key);
    }

    for (key, feed) in &desired {
        let current = paths
            .get(key.as_str())
            .map(|entry| route_is_current(entry, &feed.source));
        match current {
            Some(true) => {}
            Some(false) => {
                if let Some(entry) = paths.get_mut(key.as_str()) {
                    match entry.as_mapping_mut() {
                        Some(fields) => {
                            fields.insert("source".into(), feed.source.as_str().into());
                            fields.insert("sourceOnDemand".into(), false.into());
                        }
                        None => *entry = route_entry(&feed.source),
                    }
                }
                report.updated.push(key.clone());
            }
            None => {
                paths.insert(key.as_str().into(), route_entry(&feed.source));
                report.added.push(key.clone());
            }
        }
    }

    Ok(report)
}

async fn write_atomically(path: &Path, content: &str) -> anyhow::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("routing config path {:?} has no file name", path))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
