use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::{LauncherConfig, ProgressPersistConfig};
use crate::db::queries::{DownloadQueries, GameQueries};
use crate::db::Database;
use crate::errors::{LauncherError, Result};
use crate::models::{
    format_bytes, format_eta, format_speed, DownloadProgressUpdate, DownloadRequest,
    DownloadSource, DownloadStatus, JobOutcome, JobPhase, LocalDownload, LocalGame,
    ProgressEvent,
};
use crate::services::archive_extractor::{ArchiveExtractor, ExtractProgress};
use crate::services::extraction_supervisor::ExtractionSupervisor;
use crate::services::http_download::{HttpDownloader, HttpFinish, HttpJob};
use crate::services::install_normalizer::InstallNormalizer;
use crate::services::job_control::ControlReceiver;
use crate::services::notifier::Notifier;
use crate::services::torrent::{build_engine, magnet_display_name, TorrentClient, TorrentFinish, TorrentJob};
use crate::services::update_worker::{ExtractionTask, WorkerReport};
use crate::utils::file::{
    clear_install_marker, read_install_marker, remove_path_best_effort, write_install_marker,
    InstallMarker, InstallMarkerKind,
};
use crate::utils::paths::{resolve_downloads_dir, resolve_games_dir, sanitize_dir_name};

/// Runs one admitted request to completion. The scheduler owns admission; implementors
/// own everything after it.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        request: DownloadRequest,
        progress: mpsc::Sender<ProgressEvent>,
        control: ControlReceiver,
    ) -> Result<JobOutcome>;

    /// Called when `run` never returned (the job task panicked).
    fn abandon(&self, _request: &DownloadRequest, _error: &LauncherError) {}
}

/// Decides which progress ticks are written to the store; the first 100% always is.
pub(crate) struct ProgressThrottle {
    config: ProgressPersistConfig,
    last_written: Option<(Instant, f64)>,
}

impl ProgressThrottle {
    pub(crate) fn new(config: ProgressPersistConfig) -> Self {
        Self {
            config,
            last_written: None,
        }
    }

    pub(crate) fn should_write(&mut self, percent: f64, now: Instant) -> bool {
        let write = match self.last_written {
            None => true,
            Some((_, last)) if percent >= 100.0 => last < 100.0,
            Some((at, last)) => {
                now.duration_since(at) >= self.config.min_interval
                    && percent - last >= self.config.min_delta
            }
        };
        if write {
            self.last_written = Some((now, percent));
        }
        write
    }
}

enum Transfer {
    Finished { payload: PathBuf, total_bytes: u64 },
    Suspended,
}

#[derive(Clone)]
pub struct DownloadPipeline {
    db: Database,
    http: HttpDownloader,
    torrents: TorrentClient,
    supervisor: ExtractionSupervisor,
    notifier: Notifier,
    config: LauncherConfig,
}

impl DownloadPipeline {
    pub fn new(db: Database, notifier: Notifier, config: LauncherConfig) -> Result<Self> {
        let engine = build_engine(&config.torrent);
        let torrents = TorrentClient::new(engine, &config.torrent);
        Self::with_torrents(db, notifier, config, torrents)
    }

    pub fn with_torrents(
        db: Database,
        notifier: Notifier,
        config: LauncherConfig,
        torrents: TorrentClient,
    ) -> Result<Self> {
        let supervisor = ExtractionSupervisor::new(
            ArchiveExtractor::new(config.extractor.clone()),
            InstallNormalizer::new(config.normalize.clone()),
            config.supervisor.clone(),
        );
        Ok(Self {
            db,
            http: HttpDownloader::new(&config.http)?,
            torrents,
            supervisor,
            notifier,
            config,
        })
    }

    pub fn torrents(&self) -> &TorrentClient {
        &self.torrents
    }

    fn display_title(request: &DownloadRequest) -> String {
        let title = request.title.trim();
        if !title.is_empty() {
            return title.to_string();
        }
        magnet_display_name(request.source.location()).unwrap_or_else(|| "game".to_string())
    }

    fn ensure_game(&self, request: &DownloadRequest) -> Result<LocalGame> {
        if let Some(game) = self.db.get_game_by_url(&request.game_url)? {
            return Ok(game);
        }
        let game = LocalGame {
            id: uuid::Uuid::new_v4().to_string(),
            url: request.game_url.clone(),
            title: Self::display_title(request),
            install_path: None,
            installed_version: None,
            executable_path: None,
            installed: false,
            updated_at: Utc::now().timestamp(),
        };
        self.db.upsert_game(&game)?;
        self.db
            .get_game_by_url(&request.game_url)?
            .ok_or_else(|| LauncherError::NotFound(format!("game {}", request.game_url)))
    }

    fn existing_row(&self, request: &DownloadRequest) -> Result<Option<LocalDownload>> {
        match request.download_id.as_deref() {
            Some(id) => self.db.get_download(id),
            None => Ok(self
                .db
                .get_download_by_source(request.source.location())?
                .filter(|row| row.status != DownloadStatus::Completed)),
        }
    }

    /// Reuses the row named by the request, or an unfinished row for the same source.
    fn prepare_row(&self, request: &DownloadRequest, game: &LocalGame) -> Result<LocalDownload> {
        if let Some(row) = self.existing_row(request)? {
            if row.status.is_terminal() {
                self.db
                    .update_download_status(&row.id, DownloadStatus::Pending, None)?;
            }
            tracing::info!("reusing download row {} ({})", row.id, row.status);
            return self
                .db
                .get_download(&row.id)?
                .ok_or_else(|| LauncherError::NotFound(format!("download {}", row.id)));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let staging = match &request.dest_override {
            Some(dir) => dir.clone(),
            None => resolve_downloads_dir(&self.db).join(&id),
        };
        let install = resolve_games_dir(&self.db).join(sanitize_dir_name(&game.title));
        let now = Utc::now().timestamp();
        let row = LocalDownload {
            id,
            game_id: game.id.clone(),
            transport: request.source.transport(),
            source_url: request.source.location().to_string(),
            dest_path: staging.to_string_lossy().to_string(),
            install_path: Some(install.to_string_lossy().to_string()),
            info_hash: crate::services::torrent::info_hash_from_magnet(request.source.location()),
            progress: 0.0,
            status: DownloadStatus::Pending,
            speed: String::new(),
            eta: String::new(),
            size: String::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.db.create_download(&row)?;
        Ok(row)
    }

    fn set_status(&self, row: &LocalDownload, status: DownloadStatus, message: Option<&str>) {
        let current = self
            .db
            .get_download(&row.id)
            .ok()
            .flatten()
            .map(|row| row.status)
            .unwrap_or(row.status);
        if !current.can_transition_to(status) {
            tracing::debug!("download {}: unusual transition {} -> {}", row.id, current, status);
        }
        if let Err(err) = self.db.update_download_status(&row.id, status, message) {
            tracing::error!("failed to persist status {} for {}: {}", status, row.id, err);
        }
    }

    /// Persists and forwards progress until `events` closes.
    async fn pump_progress(
        &self,
        row: &LocalDownload,
        mut events: mpsc::Receiver<ProgressEvent>,
        forward: &mpsc::Sender<ProgressEvent>,
    ) {
        let mut throttle = ProgressThrottle::new(self.config.progress.clone());
        let mut known_hash = row.info_hash.clone();
        let mut best = 0.0f64;

        while let Some(mut event) = events.recv().await {
            if let Some(hash) = event.info_hash.as_deref() {
                if known_hash.as_deref() != Some(hash) {
                    if let Err(err) = self.db.set_download_info_hash(&row.id, hash) {
                        tracing::warn!("failed to store info hash for {}: {}", row.id, err);
                    }
                    known_hash = Some(hash.to_string());
                }
            }

            if event.phase == JobPhase::Paused {
                event.percent = best;
                self.set_status(row, DownloadStatus::Paused, None);
                let _ = forward.send(event).await;
                continue;
            }
            if event.phase == JobPhase::Downloading {
                // The first tick after a pause flips the row back.
                let paused = self
                    .db
                    .get_download(&row.id)
                    .ok()
                    .flatten()
                    .map(|current| current.status == DownloadStatus::Paused)
                    .unwrap_or(false);
                if paused {
                    self.set_status(row, DownloadStatus::Downloading, None);
                }
            }

            best = best.max(event.percent);
            event.percent = best;
            if throttle.should_write(best, Instant::now()) {
                let update = DownloadProgressUpdate {
                    progress: best,
                    speed: Some(format_speed(event.speed_bps)),
                    eta: event.eta_seconds.map(format_eta),
                    size: None,
                };
                if let Err(err) = self.db.update_download_progress(&row.id, &update) {
                    tracing::warn!("failed to persist progress for {}: {}", row.id, err);
                }
            }
            let _ = forward.send(event).await;
        }
    }

    async fn transfer(
        &self,
        request: &DownloadRequest,
        row: &LocalDownload,
        progress: &mpsc::Sender<ProgressEvent>,
        mut control: ControlReceiver,
    ) -> Result<Transfer> {
        let staging = PathBuf::from(&row.dest_path);
        let (tx, rx) = mpsc::channel::<ProgressEvent>(64);

        let transport = async move {
            let result = match &request.source {
                DownloadSource::Http { url } => {
                    let job = HttpJob {
                        queue_id: request.id.clone(),
                        url: url.clone(),
                        dest_dir: staging.clone(),
                    };
                    self.http
                        .download(&job, &tx, &mut control)
                        .await
                        .map(|finish| match finish {
                            HttpFinish::Completed { path, total_bytes } => Transfer::Finished {
                                payload: path,
                                total_bytes,
                            },
                            HttpFinish::Suspended => Transfer::Suspended,
                        })
                }
                DownloadSource::Torrent { source } => {
                    let job = TorrentJob {
                        queue_id: request.id.clone(),
                        source: source.clone(),
                        save_path: staging.clone(),
                        aliases: vec![row.id.clone(), request.id.clone(), request.game_url.clone()],
                        known_info_hash: row.info_hash.clone(),
                    };
                    self.torrents
                        .download_torrent(job, &tx, &mut control)
                        .await
                        .map(|finish| match finish {
                            TorrentFinish::Completed { total_bytes, .. } => Transfer::Finished {
                                payload: staging.clone(),
                                total_bytes,
                            },
                            TorrentFinish::Suspended { .. } => Transfer::Suspended,
                        })
                }
            };
            drop(tx);
            result
        };

        let (result, ()) = tokio::join!(transport, self.pump_progress(row, rx, progress));
        result
    }

    async fn extract(
        &self,
        request: &DownloadRequest,
        row: &LocalDownload,
        payload: PathBuf,
        install_dir: &Path,
        progress: &mpsc::Sender<ProgressEvent>,
    ) -> Result<Option<PathBuf>> {
        let marker = InstallMarker {
            kind: InstallMarkerKind::Install,
            download_id: Some(row.id.clone()),
            archive: payload
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            started_at: Utc::now().timestamp(),
        };
        tokio::fs::create_dir_all(install_dir).await?;
        if let Err(err) = write_install_marker(install_dir, &marker) {
            tracing::warn!("failed to write install marker: {}", err);
        }

        let (tx, mut rx) = mpsc::channel::<ExtractProgress>(64);
        let task = ExtractionTask::Install {
            source: payload,
            install_dir: install_dir.to_path_buf(),
            password: None,
            keep_archives: self.config.keep_archives,
        };
        let supervised = self.supervisor.run(task, tx);
        let forward = async {
            let mut throttle = ProgressThrottle::new(self.config.progress.clone());
            while let Some(update) = rx.recv().await {
                if throttle.should_write(update.percent, Instant::now()) {
                    let _ = self.db.update_download_progress(
                        &row.id,
                        &DownloadProgressUpdate {
                            progress: update.percent,
                            speed: None,
                            eta: update.eta_seconds.map(format_eta),
                            size: None,
                        },
                    );
                }
                let mut event = ProgressEvent::new(request.id.clone(), JobPhase::Extracting, update.percent);
                event.eta_seconds = update.eta_seconds;
                let _ = progress.send(event).await;
            }
        };
        let (result, ()) = tokio::join!(supervised, forward);
        clear_install_marker(install_dir);
        Ok(result?.executable)
    }

    fn mark_failed(&self, row: &LocalDownload, error: &LauncherError) {
        if error.is_cancelled() {
            tracing::info!("download {} cancelled", row.id);
            self.set_status(row, DownloadStatus::Cancelled, None);
        } else {
            tracing::error!("download {} failed: {}", row.id, error);
            self.set_status(row, DownloadStatus::Error, Some(&error.user_message()));
        }
    }

    fn fail(&self, request: &DownloadRequest, row: &LocalDownload, error: LauncherError) -> LauncherError {
        self.mark_failed(row, &error);
        self.notifier.download_error(request, &error);
        error
    }

    /// Failure without a row in hand: whatever row already exists for the request is marked.
    fn fail_detached(&self, request: &DownloadRequest, error: &LauncherError) {
        match self.existing_row(request) {
            Ok(Some(row)) => self.mark_failed(&row, error),
            Ok(None) => tracing::error!("{} failed before a download row existed: {}", request.title, error),
            Err(lookup) => tracing::error!(
                "{} failed ({}); its download row could not be read: {}",
                request.title,
                error,
                lookup
            ),
        }
        self.notifier.download_error(request, error);
    }

    async fn execute(
        &self,
        request: &DownloadRequest,
        row: &LocalDownload,
        game: &LocalGame,
        progress: &mpsc::Sender<ProgressEvent>,
        control: ControlReceiver,
    ) -> Result<JobOutcome> {
        self.set_status(row, DownloadStatus::Downloading, None);
        let (payload, total_bytes) = match self.transfer(request, row, progress, control).await? {
            Transfer::Suspended => {
                self.set_status(row, DownloadStatus::Paused, None);
                tracing::info!("download {} suspended", row.id);
                return Ok(JobOutcome::Suspended {
                    download_id: row.id.clone(),
                });
            }
            Transfer::Finished {
                payload,
                total_bytes,
            } => (payload, total_bytes),
        };

        self.db.update_download_progress(
            &row.id,
            &DownloadProgressUpdate {
                progress: 100.0,
                speed: Some(String::new()),
                eta: Some(String::new()),
                size: Some(format_bytes(total_bytes)),
            },
        )?;

        if !request.auto_extract {
            self.set_status(row, DownloadStatus::Completed, None);
            self.notifier.download_complete(request, None, None);
            return Ok(JobOutcome::Downloaded {
                download_id: row.id.clone(),
                path: payload,
            });
        }

        self.set_status(row, DownloadStatus::Extracting, None);
        let install_dir = row
            .install_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| resolve_games_dir(&self.db).join(sanitize_dir_name(&game.title)));
        let executable = self
            .extract(request, row, payload, &install_dir, progress)
            .await?;

        let install_text = install_dir.to_string_lossy().to_string();
        let exe_text = executable
            .as_ref()
            .map(|path| path.to_string_lossy().to_string());
        self.db.mark_game_installed(
            &game.id,
            request.version.as_deref(),
            &install_text,
            exe_text.as_deref(),
        )?;
        self.set_status(row, DownloadStatus::Completed, None);
        self.notifier
            .download_complete(request, Some(install_text), exe_text);
        self.db.remove_download(&row.id)?;

        let staging = PathBuf::from(&row.dest_path);
        if !self.config.keep_archives && staging != install_dir && staging.is_dir() {
            remove_path_best_effort(&staging);
        }

        tracing::info!("installed {} into {}", game.title, install_dir.display());
        Ok(JobOutcome::Installed {
            download_id: row.id.clone(),
            install_path: install_dir,
            executable,
        })
    }
}

impl DownloadPipeline {
    /// Applies update archives dropped inside an existing install. When `game_url` names a
    /// known game, its executable is kept unless it vanished, and the row is refreshed.
    pub async fn apply_update(
        &self,
        install_dir: &Path,
        game_url: Option<&str>,
        progress: mpsc::Sender<ExtractProgress>,
    ) -> Result<WorkerReport> {
        let game = match game_url {
            Some(url) => self.db.get_game_by_url(url)?,
            None => None,
        };
        let known_executable = game
            .as_ref()
            .and_then(|game| game.executable_path.as_ref())
            .map(PathBuf::from);

        let marker = InstallMarker {
            kind: InstallMarkerKind::Update,
            download_id: None,
            archive: None,
            started_at: Utc::now().timestamp(),
        };
        if let Err(err) = write_install_marker(install_dir, &marker) {
            tracing::warn!("failed to write update marker: {}", err);
        }
        let task = ExtractionTask::Update {
            install_dir: install_dir.to_path_buf(),
            known_executable,
            password: None,
        };
        let result = self.supervisor.run(task, progress).await;
        clear_install_marker(install_dir);
        let report = result?;

        if let Some(game) = game {
            let exe_text = report
                .executable
                .as_ref()
                .map(|path| path.to_string_lossy().to_string());
            self.db.mark_game_installed(
                &game.id,
                None,
                &install_dir.to_string_lossy(),
                exe_text.as_deref(),
            )?;
        }
        tracing::info!(
            "update applied in {} ({} archive(s))",
            install_dir.display(),
            report.extracted.len()
        );
        Ok(report)
    }
}

#[async_trait]
impl JobRunner for DownloadPipeline {
    async fn run(
        &self,
        request: DownloadRequest,
        progress: mpsc::Sender<ProgressEvent>,
        control: ControlReceiver,
    ) -> Result<JobOutcome> {
        let prepared = self
            .ensure_game(&request)
            .and_then(|game| self.prepare_row(&request, &game).map(|row| (game, row)));
        let (game, row) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.fail_detached(&request, &err);
                return Err(err);
            }
        };

        match self.execute(&request, &row, &game, &progress, control).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(&request, &row, err)),
        }
    }

    fn abandon(&self, request: &DownloadRequest, error: &LauncherError) {
        self.fail_detached(request, error);
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    pub interrupted: Vec<String>,
    pub stale_markers: Vec<PathBuf>,
}

/// Rows a previous process left mid-flight become `error`; paused rows stay resumable.
pub fn recover_interrupted_downloads(db: &Database) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for row in db.list_active_downloads()? {
        if let Some(install) = row.install_path.as_deref().map(Path::new) {
            if let Some(marker) = read_install_marker(install) {
                tracing::warn!(
                    "stale {:?} marker at {} (archive {:?})",
                    marker.kind,
                    install.display(),
                    marker.archive
                );
                report.stale_markers.push(install.to_path_buf());
            }
        }
        if matches!(
            row.status,
            DownloadStatus::Pending | DownloadStatus::Downloading | DownloadStatus::Extracting
        ) {
            db.update_download_status(&row.id, DownloadStatus::Error, Some("Interrupted"))?;
            tracing::info!("marked interrupted download {} ({})", row.id, row.status);
            report.interrupted.push(row.id);
        }
    }
    Ok(report)
}
