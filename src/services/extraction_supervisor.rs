use std::future::Future;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::config::SupervisorConfig;
use crate::errors::{LauncherError, Result};
use crate::services::archive_extractor::{ArchiveExtractor, ExtractProgress};
use crate::services::install_normalizer::InstallNormalizer;
use crate::services::update_worker::{
    ExtractionTask, ExtractionWorker, WorkerFailure, WorkerMessage, WorkerReport,
};

const MAILBOX_CAPACITY: usize = 64;

/// Owns the lifetime of extraction workers: stall and hard-ceiling timeouts, abort on
/// breach, restart after a crash.
#[derive(Clone)]
pub struct ExtractionSupervisor {
    worker: ExtractionWorker,
    config: SupervisorConfig,
}

impl ExtractionSupervisor {
    pub fn new(
        extractor: ArchiveExtractor,
        normalizer: InstallNormalizer,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            worker: ExtractionWorker::new(extractor, normalizer),
            config,
        }
    }

    pub async fn run(
        &self,
        task: ExtractionTask,
        progress: mpsc::Sender<ExtractProgress>,
    ) -> Result<WorkerReport> {
        let worker = self.worker.clone();
        self.supervise(
            move |mailbox| worker.clone().run(task.clone(), mailbox),
            progress,
        )
        .await
    }

    /// Spawns a worker from `spawn` and follows its mailbox until a terminal message.
    pub async fn supervise<F, Fut>(
        &self,
        spawn: F,
        progress: mpsc::Sender<ExtractProgress>,
    ) -> Result<WorkerReport>
    where
        F: Fn(mpsc::Sender<WorkerMessage>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + self.config.hard_timeout;
        let mut restarts = 0u32;
        let mut best = 0.0f64;

        loop {
            let (mailbox, mut inbox) = mpsc::channel(MAILBOX_CAPACITY);
            let handle = tokio::spawn(spawn(mailbox));

            let outcome = loop {
                let next = tokio::select! {
                    received = timeout(self.config.stall_timeout, inbox.recv()) => received,
                    _ = tokio::time::sleep_until(deadline) => {
                        handle.abort();
                        let _ = handle.await;
                        tracing::error!("extraction worker hit the hard time limit; aborted");
                        return Err(LauncherError::HardTimeout(self.config.hard_timeout));
                    }
                };
                match next {
                    Err(_) => {
                        handle.abort();
                        let _ = handle.await;
                        tracing::error!(
                            "extraction worker silent for {}s; aborted",
                            self.config.stall_timeout.as_secs()
                        );
                        return Err(LauncherError::StalledTimeout(self.config.stall_timeout));
                    }
                    Ok(Some(WorkerMessage::Progress(update))) => {
                        let percent = update.percent.clamp(0.0, 100.0);
                        if percent > best {
                            best = percent;
                            let _ = progress
                                .send(ExtractProgress {
                                    percent,
                                    eta_seconds: update.eta_seconds,
                                })
                                .await;
                        }
                    }
                    Ok(Some(WorkerMessage::Done(report))) => break Some(Ok(report)),
                    Ok(Some(WorkerMessage::Failed(failure))) => break Some(Err(failure)),
                    Ok(None) => break None,
                }
            };

            match outcome {
                Some(Ok(report)) => {
                    let _ = handle.await;
                    return Ok(report);
                }
                Some(Err(failure)) => {
                    let _ = handle.await;
                    return Err(failure_to_error(failure));
                }
                None => {
                    let crash = match handle.await {
                        Err(err) if err.is_panic() => "worker panicked".to_string(),
                        Err(err) => err.to_string(),
                        Ok(()) => "worker stopped without reporting".to_string(),
                    };
                    if restarts >= self.config.max_restarts {
                        return Err(LauncherError::Extraction {
                            archive: "extraction worker".to_string(),
                            detail: crash,
                        });
                    }
                    restarts += 1;
                    tracing::warn!(
                        "extraction worker crashed ({}); restart {}/{}",
                        crash,
                        restarts,
                        self.config.max_restarts
                    );
                }
            }
        }
    }
}

fn failure_to_error(failure: WorkerFailure) -> LauncherError {
    if let Some(executable) = &failure.executable {
        tracing::info!("executable after failed extraction: {}", executable.display());
    }
    LauncherError::Extraction {
        archive: failure.archive.unwrap_or_else(|| "install".to_string()),
        detail: failure.message,
    }
}
