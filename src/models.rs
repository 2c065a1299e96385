use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{LauncherError, Result};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Torrent,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Torrent => "torrent",
        }
    }
}

impl FromStr for TransportKind {
    type Err = LauncherError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(TransportKind::Http),
            "torrent" | "magnet" => Ok(TransportKind::Torrent),
            other => Err(LauncherError::Config(format!("unknown transport: {}", other))),
        }
    }
}

/// Persisted download lifecycle.
///
/// `Paused` only happens to torrent downloads and always returns to `Downloading`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Extracting,
    Completed,
    Error,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Extracting => "extracting",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Error | DownloadStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Downloading | Error | Cancelled),
            Downloading => matches!(next, Paused | Extracting | Completed | Error | Cancelled),
            Paused => matches!(next, Downloading | Error | Cancelled),
            Extracting => matches!(next, Completed | Error),
            Error | Cancelled => matches!(next, Pending),
            Completed => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = LauncherError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "paused" => Ok(DownloadStatus::Paused),
            "extracting" => Ok(DownloadStatus::Extracting),
            "completed" => Ok(DownloadStatus::Completed),
            "error" | "failed" => Ok(DownloadStatus::Error),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            other => Err(LauncherError::Config(format!("unknown download status: {}", other))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LocalGame {
    pub id: String,
    pub url: String,
    pub title: String,
    pub install_path: Option<String>,
    pub installed_version: Option<String>,
    pub executable_path: Option<String>,
    pub installed: bool,
    pub updated_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LocalDownload {
    pub id: String,
    pub game_id: String,
    pub transport: TransportKind,
    pub source_url: String,
    pub dest_path: String,
    pub install_path: Option<String>,
    pub info_hash: Option<String>,
    pub progress: f64,
    pub status: DownloadStatus,
    pub speed: String,
    pub eta: String,
    pub size: String,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct DownloadProgressUpdate {
    pub progress: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub size: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadSource {
    Http { url: String },
    /// Magnet URI or path to a local `.torrent` file.
    Torrent { source: String },
}

impl DownloadSource {
    pub fn transport(&self) -> TransportKind {
        match self {
            DownloadSource::Http { .. } => TransportKind::Http,
            DownloadSource::Torrent { .. } => TransportKind::Torrent,
        }
    }

    pub fn location(&self) -> &str {
        match self {
            DownloadSource::Http { url } => url,
            DownloadSource::Torrent { source } => source,
        }
    }

    /// Picks the transport from the shape of the location string.
    pub fn detect(location: &str) -> Self {
        let trimmed = location.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("magnet:") || lower.ends_with(".torrent") {
            DownloadSource::Torrent {
                source: trimmed.to_string(),
            }
        } else {
            DownloadSource::Http {
                url: trimmed.to_string(),
            }
        }
    }
}

/// A request waiting for, or holding, a download slot.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadRequest {
    pub id: String,
    pub game_url: String,
    pub source: DownloadSource,
    pub title: String,
    pub version: Option<String>,
    pub auto_extract: bool,
    pub download_id: Option<String>,
    pub dest_override: Option<PathBuf>,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i64,
}

impl DownloadRequest {
    pub fn new(game_url: impl Into<String>, source: DownloadSource, title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            game_url: game_url.into(),
            source,
            title: title.into(),
            version: None,
            auto_extract: true,
            download_id: None,
            dest_override: None,
            enqueued_at: Utc::now(),
            priority: 10,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Downloading,
    Paused,
    Extracting,
    Finalizing,
}

/// One tick of progress for a running job. Percentages never go backwards within a phase.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProgressEvent {
    pub queue_id: String,
    pub phase: JobPhase,
    pub percent: f64,
    pub speed_bps: u64,
    pub eta_seconds: Option<u64>,
    pub peers: Option<u32>,
    pub seeds: Option<u32>,
    pub info_hash: Option<String>,
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(queue_id: impl Into<String>, phase: JobPhase, percent: f64) -> Self {
        Self {
            queue_id: queue_id.into(),
            phase,
            percent: percent.clamp(0.0, 100.0),
            speed_bps: 0,
            eta_seconds: None,
            peers: None,
            seeds: None,
            info_hash: None,
            detail: None,
        }
    }
}

/// How a job left its download slot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Installed {
        download_id: String,
        install_path: PathBuf,
        executable: Option<PathBuf>,
    },
    /// Download finished and auto-extract was off.
    Downloaded {
        download_id: String,
        path: PathBuf,
    },
    /// Released its slot for a swapped-in job; the scheduler re-queues it.
    Suspended { download_id: String },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueEntrySummary {
    pub id: String,
    pub game_url: String,
    pub title: String,
    pub transport: TransportKind,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub paused: bool,
}

impl QueueEntrySummary {
    pub fn from_request(request: &DownloadRequest, paused: bool) -> Self {
        Self {
            id: request.id.clone(),
            game_url: request.game_url.clone(),
            title: request.title.clone(),
            transport: request.source.transport(),
            priority: request.priority,
            enqueued_at: request.enqueued_at,
            paused,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct QueueStatus {
    pub active: Vec<QueueEntrySummary>,
    pub queued: Vec<QueueEntrySummary>,
    pub max_parallel: usize,
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let value = bytes as f64;
    if value >= TB {
        format!("{:.2} TB", value / TB)
    } else if value >= GB {
        format!("{:.2} GB", value / GB)
    } else if value >= MB {
        format!("{:.0} MB", value / MB)
    } else if value >= KB {
        format!("{:.0} KB", value / KB)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_speed(bps: u64) -> String {
    format!("{}/s", format_bytes(bps))
}

pub fn format_eta(seconds: u64) -> String {
    if seconds >= 3600 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds >= 60 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}
