use crate::model::Feed;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Where a supervised process should read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Local file, looped and paced at real time
    File(PathBuf),
    /// Network address, possibly rewritten through the media proxy
    Network(String),
}

impl ResolvedSource {
    /// Value for ffmpeg's `-i`.
    pub fn input(&self) -> String {
        match self {
            ResolvedSource::File(path) => path.to_string_lossy().into_owned(),
            ResolvedSource::Network(address) => address.clone(),
        }
    }

    pub fn is_rtsp(&self) -> bool {
        matches!(self, ResolvedSource::Network(address) if address.starts_with("rtsp"))
    }

    /// Input options shared by every purpose: TCP transport for RTSP, endless
    /// real-time loop for files.
    pub fn input_args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            ResolvedSource::File(_) => &["-stream_loop", "-1", "-re"],
            ResolvedSource::Network(_) if self.is_rtsp() => &["-rtsp_transport", "tcp"],
            ResolvedSource::Network(_) => &[],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

pub fn route_key(feed_id: i64) -> String {
    format!("feed_{}", feed_id)
}

/// Decides the effective source of a feed.
///
/// With a proxy base configured, RTSP feeds are read through
/// `<base>/feed_<id>` and the original → proxied mapping is remembered so
/// live-view requests for the original address take the same route.
pub struct FeedResolver {
    proxy_base: Option<String>,
    routes: Mutex<HashMap<String, String>>,
}

impl FeedResolver {
    pub fn new(proxy_base: Option<String>) -> Self {
        Self {
            proxy_base: proxy_base.map(|base| base.trim_end_matches('/').to_string()),
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, feed: &Feed) -> ResolvedSource {
        if let Some(path) = strip_file_scheme(&feed.source) {
            return ResolvedSource::File(path);
        }
        if feed.source.starts_with("rtsp") {
            if let Some(proxied) = self.register(feed) {
                return ResolvedSource::Network(proxied);
            }
        }
        ResolvedSource::Network(feed.source.clone())
    }

    /// Resolves a raw address requested by a live viewer.
    pub fn resolve_address(&self, address: &str) -> ResolvedSource {
        if let Some(path) = strip_file_scheme(address) {
            return ResolvedSource::File(path);
        }
        match self.routes.lock().unwrap().get(address) {
            Some(proxied) => ResolvedSource::Network(proxied.clone()),
            None => ResolvedSource::Network(address.to_string()),
        }
    }

    /// Replaces the reverse map with the current feed set.
    pub fn prime(&self, feeds: &[Feed]) {
        let Some(base) = &self.proxy_base else {
            return;
        };
        let mut routes = self.routes.lock().unwrap();
        routes.clear();
        for feed in feeds.iter().filter(|f| f.source.starts_with("rtsp")) {
            routes.insert(feed.source.clone(), format!("{}/{}", base, route_key(feed.id)));
        }
    }

    pub fn proxied_for(&self, original: &str) -> Option<String> {
        self.routes.lock().unwrap().get(original).cloned()
    }

    fn register(&self, feed: &Feed) -> Option<String> {
        let base = self.proxy_base.as_ref()?;
        let proxied = format!("{}/{}", base, route_key(feed.id));
        self.routes
            .lock()
            .unwrap()
            .insert(feed.source.clone(), proxied.clone());
        Some(proxied)
    }
}

fn strip_file_scheme(address: &str) -> Option<PathBuf> {
    address.strip_prefix("file://").map(PathBuf::from)
}
