use serde::Serialize;
use tokio::sync::broadcast;

use crate::errors::{ErrorCategory, LauncherError};
use crate::models::{DownloadRequest, ProgressEvent, QueueStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum LauncherEvent {
    QueueStatus(QueueStatus),
    DownloadProgress(ProgressEvent),
    DownloadComplete(DownloadCompletePayload),
    DownloadError(DownloadErrorPayload),
}

#[derive(Serialize, Clone, Debug)]
pub struct DownloadCompletePayload {
    pub queue_id: String,
    pub game_url: String,
    pub title: String,
    pub install_path: Option<String>,
    pub executable: Option<String>,
}

#[derive(Serialize, Clone, Debug)]
pub struct DownloadErrorPayload {
    pub queue_id: String,
    pub game_url: String,
    pub title: String,
    pub message: String,
    pub category: ErrorCategory,
}

/// Fire-and-forget fan-out to whoever is listening (UI bridge, CLI, tests).
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<LauncherEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LauncherEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: LauncherEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn queue_status(&self, status: QueueStatus) {
        self.emit(LauncherEvent::QueueStatus(status));
    }

    pub fn progress(&self, event: ProgressEvent) {
        self.emit(LauncherEvent::DownloadProgress(event));
    }

    pub fn download_complete(
        &self,
        request: &DownloadRequest,
        install_path: Option<String>,
        executable: Option<String>,
    ) {
        self.emit(LauncherEvent::DownloadComplete(DownloadCompletePayload {
            queue_id: request.id.clone(),
            game_url: request.game_url.clone(),
            title: request.title.clone(),
            install_path,
            executable,
        }));
    }

    pub fn download_error(&self, request: &DownloadRequest, error: &LauncherError) {
        self.emit(LauncherEvent::DownloadError(DownloadErrorPayload {
            queue_id: request.id.clone(),
            game_url: request.game_url.clone(),
            title: request.title.clone(),
            message: error.user_message(),
            category: error.category(),
        }));
    }
}
