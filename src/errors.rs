use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Torrent engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Torrent engine protocol error: {0}")]
    Protocol(String),
    #[error("Torrent engine error: {message}")]
    Engine { message: String, code: Option<i64> },
    #[error("Torrent engine exited: {0}")]
    EngineExited(String),
    #[error("Extraction failed for {archive}: {detail}")]
    Extraction { archive: String, detail: String },
    #[error("Extraction stalled: no progress for {}s", .0.as_secs())]
    StalledTimeout(Duration),
    #[error("Extraction exceeded time limit of {}s", .0.as_secs())]
    HardTimeout(Duration),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Already queued or downloading: {0}")]
    Duplicate(String),
}

pub type Result<T> = std::result::Result<T, LauncherError>;

/// Coarse error classes shown to the user instead of the raw error text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    DiskSpace,
    Permission,
    MissingFile,
    Network,
    Extraction,
    Engine,
    Timeout,
    Cancelled,
    Unknown,
}

// ENOSPC on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on windows.
const DISK_FULL_OS_CODES: [i32; 3] = [28, 112, 39];

fn classify_io(err: &io::Error) -> ErrorCategory {
    if let Some(code) = err.raw_os_error() {
        if DISK_FULL_OS_CODES.contains(&code) {
            return ErrorCategory::DiskSpace;
        }
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
        io::ErrorKind::NotFound => ErrorCategory::MissingFile,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::TimedOut => ErrorCategory::Network,
        _ => classify_text(&err.to_string()),
    }
}

fn classify_text(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no space left")
        || lower.contains("disk full")
        || lower.contains("not enough space")
        || lower.contains("insufficient disk")
    {
        ErrorCategory::DiskSpace
    } else if lower.contains("permission denied") || lower.contains("access is denied") {
        ErrorCategory::Permission
    } else if lower.contains("no such file")
        || lower.contains("cannot find the file")
        || lower.contains("not found")
    {
        ErrorCategory::MissingFile
    } else if lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("dns")
        || lower.contains("network")
    {
        ErrorCategory::Network
    } else {
        ErrorCategory::Unknown
    }
}

impl LauncherError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LauncherError::Network(_) | LauncherError::Http(_) => ErrorCategory::Network,
            LauncherError::Io(err) => classify_io(err),
            LauncherError::NotFound(_) => ErrorCategory::MissingFile,
            LauncherError::EngineUnavailable(_)
            | LauncherError::Protocol(_)
            | LauncherError::EngineExited(_) => ErrorCategory::Engine,
            LauncherError::Engine { message, .. } => match classify_text(message) {
                ErrorCategory::Unknown => ErrorCategory::Engine,
                other => other,
            },
            LauncherError::Extraction { detail, .. } => match classify_text(detail) {
                ErrorCategory::DiskSpace => ErrorCategory::DiskSpace,
                ErrorCategory::Permission => ErrorCategory::Permission,
                _ => ErrorCategory::Extraction,
            },
            LauncherError::StalledTimeout(_) | LauncherError::HardTimeout(_) => {
                ErrorCategory::Timeout
            }
            LauncherError::Cancelled => ErrorCategory::Cancelled,
            LauncherError::Database(_)
            | LauncherError::Serde(_)
            | LauncherError::Config(_)
            | LauncherError::Duplicate(_) => classify_text(&self.to_string()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LauncherError::Cancelled)
    }

    /// Message stored on the download row; the raw error goes to the log.
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::DiskSpace => "Not enough disk space to finish the download".to_string(),
            ErrorCategory::Permission => {
                "Permission denied while writing game files; check the install folder".to_string()
            }
            ErrorCategory::MissingFile => format!("A required file is missing: {}", self),
            ErrorCategory::Network => {
                "Network error while downloading; check your connection and retry".to_string()
            }
            ErrorCategory::Extraction => match self {
                LauncherError::Extraction { archive, .. } => {
                    format!("Failed to extract {}", archive)
                }
                other => format!("Extraction failed: {}", other),
            },
            ErrorCategory::Engine => format!("Torrent engine failure: {}", self),
            ErrorCategory::Timeout => format!("Extraction timed out: {}", self),
            ErrorCategory::Cancelled => "Download cancelled".to_string(),
            ErrorCategory::Unknown => self.to_string(),
        }
    }
}
