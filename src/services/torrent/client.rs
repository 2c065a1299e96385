use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::TorrentConfig;
use crate::errors::{LauncherError, Result};
use crate::models::{JobPhase, ProgressEvent};
use crate::services::job_control::{ControlReceiver, JobControl};
use crate::services::torrent::{ActiveTorrentRegistry, TorrentEngine, TorrentStatus};

#[derive(Clone, Debug)]
pub struct TorrentJob {
    pub queue_id: String,
    /// Magnet URI or local `.torrent` path.
    pub source: String,
    pub save_path: PathBuf,
    /// Extra names the session can be found by (persisted row id, game url).
    pub aliases: Vec<String>,
    /// Set when resuming a row whose session was already created once.
    pub known_info_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TorrentFinish {
    Completed { info_hash: String, total_bytes: u64 },
    /// Paused in the engine and handed back to the scheduler.
    Suspended { info_hash: String },
}

#[derive(Clone)]
pub struct TorrentClient {
    engine: Arc<dyn TorrentEngine>,
    registry: Arc<ActiveTorrentRegistry>,
    poll_interval: Duration,
    max_status_failures: usize,
}

impl TorrentClient {
    pub fn new(engine: Arc<dyn TorrentEngine>, config: &TorrentConfig) -> Self {
        Self {
            engine,
            registry: Arc::new(ActiveTorrentRegistry::new()),
            poll_interval: config.poll_interval,
            max_status_failures: config.max_status_failures.max(1),
        }
    }

    pub fn engine(&self) -> &Arc<dyn TorrentEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ActiveTorrentRegistry> {
        &self.registry
    }

    /// Drives one torrent from add to finished, polling the engine on a fixed interval.
    pub async fn download_torrent(
        &self,
        job: TorrentJob,
        progress: &mpsc::Sender<ProgressEvent>,
        control: &mut ControlReceiver,
    ) -> Result<TorrentFinish> {
        let mut aliases = job.aliases.clone();
        aliases.extend(job.known_info_hash.clone());
        let session = self.registry.register(&job.source, &aliases)?;

        let outcome = self.drive(session, &job, progress, control).await;
        self.registry.unregister(session);
        outcome
    }

    async fn attach(&self, job: &TorrentJob) -> Result<String> {
        if let Some(hash) = job.known_info_hash.as_deref() {
            match self.engine.resume(hash).await {
                Ok(()) => {
                    tracing::info!("resumed torrent session {}", hash);
                    return Ok(hash.to_ascii_lowercase());
                }
                Err(err) => tracing::debug!("resume of {} failed ({}); adding again", hash, err),
            }
        }
        tokio::fs::create_dir_all(&job.save_path).await?;
        let hash = self.engine.add(&job.source, &job.save_path).await?;
        tracing::info!("torrent added: {} -> {}", hash, job.save_path.display());
        Ok(hash)
    }

    async fn drive(
        &self,
        session: u64,
        job: &TorrentJob,
        progress: &mpsc::Sender<ProgressEvent>,
        control: &mut ControlReceiver,
    ) -> Result<TorrentFinish> {
        if *control.borrow() == JobControl::Cancelled {
            return Err(LauncherError::Cancelled);
        }

        let info_hash = self.attach(job).await?;
        self.registry.set_info_hash(session, &info_hash)?;

        let mut best = 0.0_f64;
        let mut failures = 0usize;
        let mut paused = false;

        loop {
            // cancel_torrent() drops the session from the registry.
            if self.registry.get(session).is_none() {
                return Err(LauncherError::Cancelled);
            }

            let state = *control.borrow_and_update();
            match state {
                JobControl::Cancelled => {
                    self.remove_session(&info_hash).await;
                    return Err(LauncherError::Cancelled);
                }
                JobControl::Suspended => {
                    self.pause_session(session, &info_hash).await;
                    return Ok(TorrentFinish::Suspended { info_hash });
                }
                JobControl::Paused => {
                    if !paused {
                        self.pause_session(session, &info_hash).await;
                        paused = true;
                        let mut event = ProgressEvent::new(&job.queue_id, JobPhase::Paused, best);
                        event.info_hash = Some(info_hash.clone());
                        let _ = progress.send(event).await;
                    }
                    if control.changed().await.is_err() {
                        return Err(LauncherError::Cancelled);
                    }
                    continue;
                }
                JobControl::Running => {
                    if paused {
                        self.resume_session(session, &info_hash).await;
                        paused = false;
                    }
                }
            }

            // pause_torrent() holds the session without touching the job's control.
            let held = self.registry.get(session).map(|entry| entry.paused).unwrap_or(false);
            if held {
                if !self.idle(control).await {
                    return Err(LauncherError::Cancelled);
                }
                continue;
            }

            match self.engine.status(&info_hash).await {
                Ok(status) => {
                    failures = 0;
                    if let Some(reported) = status.info_hash.as_deref() {
                        if !reported.eq_ignore_ascii_case(&info_hash) {
                            let _ = self.registry.add_alias(session, reported);
                        }
                    }

                    let complete = status.is_complete();
                    best = if complete { 100.0 } else { status.percent().max(best) };
                    let _ = progress
                        .send(progress_event(&job.queue_id, &info_hash, &status, best))
                        .await;

                    if complete {
                        // Stop seeding; the payload is ours now.
                        if let Err(err) = self.engine.pause(&info_hash).await {
                            tracing::warn!("pause after completion failed for {}: {}", info_hash, err);
                        }
                        return Ok(TorrentFinish::Completed {
                            info_hash,
                            total_bytes: status.total_wanted,
                        });
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        "torrent status failed for {} ({}/{}): {}",
                        info_hash,
                        failures,
                        self.max_status_failures,
                        err
                    );
                    if failures >= self.max_status_failures {
                        return Err(err);
                    }
                    if matches!(err, LauncherError::EngineExited(_)) {
                        // A restarted agent has no sessions; re-adding resumes from disk.
                        if let Err(add_err) = self.engine.add(&job.source, &job.save_path).await {
                            tracing::warn!("re-add after engine exit failed: {}", add_err);
                        }
                    }
                }
            }

            if !self.idle(control).await {
                self.pause_session(session, &info_hash).await;
                return Err(LauncherError::Cancelled);
            }
        }
    }

    /// Waits one poll interval or until the control changes. False once the sender is gone.
    async fn idle(&self, control: &mut ControlReceiver) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => true,
            changed = control.changed() => changed.is_ok(),
        }
    }

    async fn pause_session(&self, session: u64, info_hash: &str) {
        self.registry.set_paused(session, true);
        if let Err(err) = self.engine.pause(info_hash).await {
            tracing::warn!("torrent pause failed for {}: {}", info_hash, err);
        }
    }

    async fn resume_session(&self, session: u64, info_hash: &str) {
        self.registry.set_paused(session, false);
        if let Err(err) = self.engine.resume(info_hash).await {
            tracing::warn!("torrent resume failed for {}: {}", info_hash, err);
        }
    }

    async fn remove_session(&self, info_hash: &str) {
        if let Err(err) = self.engine.remove(info_hash, true).await {
            tracing::warn!("torrent remove failed for {}: {}", info_hash, err);
        }
    }

    pub async fn pause_torrent(&self, alias: &str) -> Result<()> {
        let entry = self
            .registry
            .lookup(alias)
            .ok_or_else(|| LauncherError::NotFound(format!("no active torrent for {}", alias)))?;
        match entry.info_hash.as_deref() {
            Some(hash) => self.pause_session(entry.id, hash).await,
            None => {
                self.registry.set_paused(entry.id, true);
            }
        }
        Ok(())
    }

    pub async fn resume_torrent(&self, alias: &str) -> Result<()> {
        let entry = self
            .registry
            .lookup(alias)
            .ok_or_else(|| LauncherError::NotFound(format!("no active torrent for {}", alias)))?;
        match entry.info_hash.as_deref() {
            Some(hash) => self.resume_session(entry.id, hash).await,
            None => {
                self.registry.set_paused(entry.id, false);
            }
        }
        Ok(())
    }

    /// Unregisters first so the polling loop stops even if the engine call fails.
    pub async fn cancel_torrent(&self, alias: &str) -> Result<()> {
        let entry = self
            .registry
            .lookup(alias)
            .ok_or_else(|| LauncherError::NotFound(format!("no active torrent for {}", alias)))?;
        self.registry.unregister(entry.id);
        if let Some(hash) = entry.info_hash.as_deref() {
            self.remove_session(hash).await;
        }
        Ok(())
    }
}

fn progress_event(queue_id: &str, info_hash: &str, status: &TorrentStatus, percent: f64) -> ProgressEvent {
    let mut event = ProgressEvent::new(queue_id, JobPhase::Downloading, percent);
    event.speed_bps = status.download_rate;
    event.eta_seconds = status.eta_seconds();
    event.peers = Some(status.peers);
    event.seeds = Some(status.seeds);
    event.info_hash = Some(info_hash.to_string());
    event.detail = status.state.clone();
    event
}
