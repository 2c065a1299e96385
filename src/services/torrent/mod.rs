//! Torrent transport: a capability trait with a sidecar engine, a local daemon fallback,
//! and the client that drives one download through whichever engine is selected.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TorrentConfig;
use crate::errors::Result;

pub mod client;
pub mod daemon;
pub mod registry;
pub mod selecting;
pub mod sidecar;

pub use client::{TorrentClient, TorrentFinish, TorrentJob};
pub use daemon::DaemonEngine;
pub use registry::{ActiveTorrent, ActiveTorrentRegistry};
pub use selecting::SelectingEngine;
pub use sidecar::SidecarEngine;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TorrentStatus {
    pub info_hash: Option<String>,
    /// 0..=100
    pub progress: f64,
    pub total_done: u64,
    pub total_wanted: u64,
    pub download_rate: u64,
    pub eta: Option<i64>,
    pub peers: u32,
    pub seeds: u32,
    #[serde(deserialize_with = "state_text")]
    pub state: Option<String>,
    pub is_finished: bool,
    pub has_metadata: bool,
}

/// Engines report the session state either as a name or as a numeric code.
fn state_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => Some(text),
        Some(serde_json::Value::Number(code)) => Some(code.to_string()),
        _ => None,
    })
}

impl TorrentStatus {
    pub fn is_complete(&self) -> bool {
        self.is_finished || (self.total_wanted > 0 && self.total_done >= self.total_wanted)
    }

    pub fn percent(&self) -> f64 {
        if self.total_wanted > 0 {
            (self.total_done as f64 / self.total_wanted as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            self.progress.clamp(0.0, 100.0)
        }
    }

    pub fn eta_seconds(&self) -> Option<u64> {
        self.eta.filter(|value| *value >= 0).map(|value| value as u64)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineInfo {
    pub engine: &'static str,
    pub version: Option<String>,
}

#[async_trait]
pub trait TorrentEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent; concurrent callers share one startup attempt.
    async fn start(&self) -> Result<()>;
    async fn ping(&self) -> Result<EngineInfo>;
    /// Returns the info-hash of the added (or already known) torrent.
    async fn add(&self, source: &str, save_path: &Path) -> Result<String>;
    async fn status(&self, torrent_id: &str) -> Result<TorrentStatus>;
    async fn pause(&self, torrent_id: &str) -> Result<()>;
    async fn resume(&self, torrent_id: &str) -> Result<()>;
    async fn remove(&self, torrent_id: &str, delete_files: bool) -> Result<()>;
}

pub fn build_engine(config: &TorrentConfig) -> Arc<dyn TorrentEngine> {
    let primary: Arc<dyn TorrentEngine> = Arc::new(SidecarEngine::new(config.clone()));
    let fallback: Arc<dyn TorrentEngine> = Arc::new(DaemonEngine::new(config.clone()));
    Arc::new(SelectingEngine::new(
        primary,
        Some(fallback),
        config.allow_fallback,
    ))
}

pub fn is_magnet(source: &str) -> bool {
    source.trim_start().to_ascii_lowercase().starts_with("magnet:")
}

fn magnet_param<'a>(source: &'a str, key: &str) -> Vec<&'a str> {
    let query = match source.split_once('?') {
        Some((_, query)) => query,
        None => return Vec::new(),
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value)
        .collect()
}

/// Hex info-hash from a magnet's `xt=urn:btih:` field. Base32 hashes are not decoded.
pub fn info_hash_from_magnet(source: &str) -> Option<String> {
    if !is_magnet(source) {
        return None;
    }
    magnet_param(source, "xt").into_iter().find_map(|value| {
        let lower = value.to_ascii_lowercase();
        let hash = lower.strip_prefix("urn:btih:")?;
        if hash.len() == 40 && hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
            Some(hash.to_string())
        } else {
            None
        }
    })
}

/// Display name from the magnet `dn` parameter.
pub fn magnet_display_name(source: &str) -> Option<String> {
    if !is_magnet(source) {
        return None;
    }
    magnet_param(source, "dn").into_iter().find_map(|value| {
        let decoded = urlencoding::decode(&value.replace('+', " "))
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| value.to_string());
        let trimmed = decoded.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}
