use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::max_parallel_downloads;
use crate::db::queries::SettingsQueries;
use crate::errors::{LauncherError, Result};
use crate::models::{DownloadRequest, JobOutcome, QueueEntrySummary, QueueStatus, TransportKind};
use crate::services::download_pipeline::JobRunner;
use crate::services::job_control::JobControl;
use crate::services::notifier::Notifier;

const PROGRESS_CAPACITY: usize = 128;

pub type JobResult = Result<JobOutcome>;

enum QueueCommand {
    Enqueue {
        request: DownloadRequest,
        done: oneshot::Sender<JobResult>,
    },
    Prioritize {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Swap {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    SetPaused {
        id: String,
        paused: bool,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
    JobFinished {
        id: String,
        result: JobResult,
    },
}

struct QueuedJob {
    request: DownloadRequest,
    /// More negative sorts first among equal priorities; set by prioritize/swap.
    boost: i64,
    done: oneshot::Sender<JobResult>,
}

struct ActiveJob {
    request: DownloadRequest,
    done: oneshot::Sender<JobResult>,
    control: watch::Sender<JobControl>,
    paused: bool,
}

/// Handle to the scheduler task. Cloning is cheap; every clone talks to the same queue.
#[derive(Clone)]
pub struct DownloadQueue {
    commands: mpsc::UnboundedSender<QueueCommand>,
}

impl DownloadQueue {
    /// Spawns the scheduler on the current runtime.
    pub fn start(
        runner: Arc<dyn JobRunner>,
        settings: Arc<dyn SettingsQueries>,
        notifier: Notifier,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            runner,
            settings,
            notifier,
            commands: commands.clone(),
            queued: Vec::new(),
            active: HashMap::new(),
            next_boost: 0,
        };
        tokio::spawn(scheduler.run(inbox));
        Self { commands }
    }

    fn send(&self, command: QueueCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| LauncherError::Config("download queue stopped".to_string()))
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> QueueCommand) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.send(build(reply))?;
        answer
            .await
            .map_err(|_| LauncherError::Config("download queue stopped".to_string()))
    }

    /// Queues `request` and returns a receiver for its final outcome. Duplicates resolve
    /// immediately with `Duplicate`.
    pub fn submit(&self, request: DownloadRequest) -> Result<oneshot::Receiver<JobResult>> {
        let (done, outcome) = oneshot::channel();
        self.send(QueueCommand::Enqueue { request, done })?;
        Ok(outcome)
    }

    pub async fn enqueue(&self, request: DownloadRequest) -> JobResult {
        let outcome = self.submit(request)?;
        outcome
            .await
            .map_err(|_| LauncherError::Config("download queue stopped".to_string()))?
    }

    pub async fn prioritize(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.ask(|reply| QueueCommand::Prioritize { id, reply }).await
    }

    pub async fn swap(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.ask(|reply| QueueCommand::Swap { id, reply }).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.ask(|reply| QueueCommand::Remove { id, reply }).await
    }

    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.ask(|reply| QueueCommand::Cancel { id, reply }).await
    }

    pub async fn pause(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.ask(|reply| QueueCommand::SetPaused {
            id,
            paused: true,
            reply,
        })
        .await
    }

    pub async fn resume(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.ask(|reply| QueueCommand::SetPaused {
            id,
            paused: false,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.ask(|reply| QueueCommand::Status { reply }).await
    }
}

/// Single owner of queue and active-job state; commands are handled one at a time.
struct Scheduler {
    runner: Arc<dyn JobRunner>,
    settings: Arc<dyn SettingsQueries>,
    notifier: Notifier,
    commands: mpsc::UnboundedSender<QueueCommand>,
    queued: Vec<QueuedJob>,
    active: HashMap<String, ActiveJob>,
    next_boost: i64,
}

impl Scheduler {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<QueueCommand>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue { request, done } => self.enqueue(request, done),
            QueueCommand::Prioritize { id, reply } => {
                let _ = reply.send(self.prioritize(&id));
            }
            QueueCommand::Swap { id, reply } => {
                let _ = reply.send(self.swap(&id));
            }
            QueueCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove_queued(&id));
            }
            QueueCommand::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id));
            }
            QueueCommand::SetPaused { id, paused, reply } => {
                let _ = reply.send(self.set_paused(&id, paused));
            }
            QueueCommand::Status { reply } => {
                let _ = reply.send(self.snapshot());
                return;
            }
            QueueCommand::JobFinished { id, result } => self.finish(&id, result),
        }
        self.admit();
        self.notifier.queue_status(self.snapshot());
    }

    fn is_known_url(&self, game_url: &str) -> bool {
        self.queued
            .iter()
            .any(|job| job.request.game_url == game_url)
            || self
                .active
                .values()
                .any(|job| job.request.game_url == game_url)
    }

    fn enqueue(&mut self, request: DownloadRequest, done: oneshot::Sender<JobResult>) {
        if self.is_known_url(&request.game_url) {
            tracing::info!("rejecting duplicate request for {}", request.game_url);
            let _ = done.send(Err(LauncherError::Duplicate(request.game_url)));
            return;
        }
        tracing::info!("queued {} ({})", request.title, request.id);
        self.queued.push(QueuedJob {
            request,
            boost: 0,
            done,
        });
    }

    fn take_boost(&mut self) -> i64 {
        self.next_boost -= 1;
        self.next_boost
    }

    fn prioritize(&mut self, id: &str) -> bool {
        let boost = self.take_boost();
        match self.queued.iter_mut().find(|job| job.request.id == id) {
            Some(job) => {
                job.request.priority = 0;
                job.boost = boost;
                true
            }
            None => false,
        }
    }

    /// Suspends an active torrent so `id` takes its slot; degrades to `prioritize`.
    fn swap(&mut self, id: &str) -> bool {
        if !self.queued.iter().any(|job| job.request.id == id) {
            return false;
        }
        let victim = self
            .active
            .values()
            .filter(|job| job.request.source.transport() == TransportKind::Torrent)
            .filter(|job| *job.control.borrow() != JobControl::Suspended)
            .max_by_key(|job| job.request.enqueued_at)
            .map(|job| job.request.id.clone());

        let Some(victim) = victim else {
            return self.prioritize(id);
        };

        let boost = self.take_boost();
        if let Some(job) = self.queued.iter_mut().find(|job| job.request.id == id) {
            job.request.priority = -1;
            job.boost = boost;
        }
        if let Some(active) = self.active.get(&victim) {
            tracing::info!("suspending {} to make room for {}", victim, id);
            let _ = active.control.send(JobControl::Suspended);
        }
        true
    }

    fn remove_queued(&mut self, id: &str) -> bool {
        let Some(index) = self.queued.iter().position(|job| job.request.id == id) else {
            return false;
        };
        let job = self.queued.remove(index);
        let _ = job.done.send(Err(LauncherError::Cancelled));
        true
    }

    fn cancel(&mut self, id: &str) -> bool {
        if self.remove_queued(id) {
            return true;
        }
        match self.active.get(id) {
            Some(job) => {
                let _ = job.control.send(JobControl::Cancelled);
                true
            }
            None => false,
        }
    }

    fn set_paused(&mut self, id: &str, paused: bool) -> bool {
        let Some(job) = self.active.get_mut(id) else {
            return false;
        };
        let next = if paused {
            JobControl::Paused
        } else {
            JobControl::Running
        };
        if matches!(*job.control.borrow(), JobControl::Cancelled | JobControl::Suspended) {
            return false;
        }
        let _ = job.control.send(next);
        job.paused = paused;
        true
    }

    fn finish(&mut self, id: &str, result: JobResult) {
        let Some(job) = self.active.remove(id) else {
            return;
        };
        match result {
            Ok(JobOutcome::Suspended { download_id }) => {
                tracing::info!("re-queueing suspended job {}", id);
                let mut request = job.request;
                request.download_id = Some(download_id);
                self.queued.push(QueuedJob {
                    request,
                    boost: 0,
                    done: job.done,
                });
            }
            other => {
                if let Err(err) = &other {
                    tracing::warn!("job {} ended with error: {}", id, err);
                }
                let _ = job.done.send(other);
            }
        }
    }

    fn next_index(&self) -> Option<usize> {
        self.queued
            .iter()
            .enumerate()
            .min_by_key(|(_, job)| (job.request.priority, job.boost, job.request.enqueued_at))
            .map(|(index, _)| index)
    }

    fn admit(&mut self) {
        // Read at every admission so a settings change applies to the next slot.
        let limit = max_parallel_downloads(self.settings.as_ref());
        while self.active.len() < limit {
            let Some(index) = self.next_index() else {
                break;
            };
            let QueuedJob { request, done, .. } = self.queued.remove(index);
            self.launch(request, done);
        }
    }

    fn launch(&mut self, request: DownloadRequest, done: oneshot::Sender<JobResult>) {
        let (control, control_rx) = watch::channel(JobControl::Running);
        let id = request.id.clone();
        tracing::info!("admitting {} ({})", request.title, id);

        let runner = self.runner.clone();
        let notifier = self.notifier.clone();
        let commands = self.commands.clone();
        let job_request = request.clone();
        tokio::spawn(async move {
            let (progress, mut events) = mpsc::channel(PROGRESS_CAPACITY);
            let forward = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    notifier.progress(event);
                }
            });
            let job_runner = runner.clone();
            let crashed_request = job_request.clone();
            let work = tokio::spawn(async move { job_runner.run(job_request, progress, control_rx).await });
            let result = match work.await {
                Ok(result) => result,
                Err(err) => {
                    let error = LauncherError::Config(format!("download job crashed: {}", err));
                    tracing::error!("{} ({}): {}", crashed_request.title, crashed_request.id, error);
                    runner.abandon(&crashed_request, &error);
                    Err(error)
                }
            };
            let _ = forward.await;
            let _ = commands.send(QueueCommand::JobFinished { id, result });
        });

        self.active.insert(
            request.id.clone(),
            ActiveJob {
                request,
                done,
                control,
                paused: false,
            },
        );
    }

    fn snapshot(&self) -> QueueStatus {
        let mut queued: Vec<&QueuedJob> = self.queued.iter().collect();
        queued.sort_by_key(|job| (job.request.priority, job.boost, job.request.enqueued_at));
        let mut active: Vec<QueueEntrySummary> = self
            .active
            .values()
            .map(|job| QueueEntrySummary::from_request(&job.request, job.paused))
            .collect();
        active.sort_by_key(|entry| entry.enqueued_at);

        QueueStatus {
            active,
            queued: queued
                .into_iter()
                .map(|job| QueueEntrySummary::from_request(&job.request, false))
                .collect(),
            max_parallel: max_parallel_downloads(self.settings.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::config::SETTING_MAX_PARALLEL;
    use crate::db::Database;
    use crate::models::{DownloadSource, ProgressEvent};
    use crate::services::job_control::ControlReceiver;

    /// Holds every job until the test releases it; records admission order.
    #[derive(Default)]
    struct GatedRunner {
        running: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
        release: Notify,
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(
            &self,
            request: DownloadRequest,
            _progress: mpsc::Sender<ProgressEvent>,
            mut control: ControlReceiver,
        ) -> Result<JobOutcome> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Ok(mut started) = self.started.lock() {
                started.push(request.title.clone());
            }

            let outcome = tokio::select! {
                _ = self.release.notified() => Ok(JobOutcome::Downloaded {
                    download_id: request.id.clone(),
                    path: std::path::PathBuf::from("/tmp"),
                }),
                stopped = watch_control(&mut control) => stopped.map(|()| JobOutcome::Suspended {
                    download_id: format!("row-{}", request.title),
                }),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    /// Resolves `Ok` on suspend and `Err` on cancel.
    async fn watch_control(control: &mut ControlReceiver) -> Result<()> {
        loop {
            if control.changed().await.is_err() {
                return Err(LauncherError::Cancelled);
            }
            let state = *control.borrow();
            match state {
                JobControl::Suspended => return Ok(()),
                JobControl::Cancelled => return Err(LauncherError::Cancelled),
                JobControl::Running | JobControl::Paused => {}
            }
        }
    }

    impl GatedRunner {
        fn started(&self) -> Vec<String> {
            self.started.lock().map(|started| started.clone()).unwrap_or_default()
        }
    }

    fn request(title: &str, location: &str) -> DownloadRequest {
        DownloadRequest::new(
            format!("https://games.example/{}", title),
            DownloadSource::detect(location),
            title,
        )
    }

    fn http(title: &str) -> DownloadRequest {
        request(title, &format!("https://cdn.example/{}.zip", title))
    }

    fn queue_with_limit(limit: usize) -> (DownloadQueue, Arc<GatedRunner>) {
        let db = Database::open_in_memory().expect("db");
        db.set_setting(SETTING_MAX_PARALLEL, &limit.to_string()).expect("setting");
        let runner = Arc::new(GatedRunner::default());
        let queue = DownloadQueue::start(runner.clone(), Arc::new(db), Notifier::new());
        (queue, runner)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn never_runs_more_than_max_parallel() {
        let (queue, runner) = queue_with_limit(2);
        let mut outcomes = Vec::new();
        for index in 0..5 {
            outcomes.push(queue.submit(http(&format!("game-{}", index))).expect("submit"));
        }
        settle().await;

        let status = queue.status().await.expect("status");
        assert_eq!(status.active.len(), 2);
        assert_eq!(status.queued.len(), 3);
        assert_eq!(status.max_parallel, 2);

        for _ in 0..5 {
            runner.release.notify_one();
            settle().await;
        }
        for outcome in outcomes {
            assert!(outcome.await.expect("outcome").is_ok());
        }
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_duplicate_game_urls() {
        let (queue, runner) = queue_with_limit(1);
        let first = queue.submit(http("same")).expect("submit");
        settle().await;

        let err = queue.enqueue(http("same")).await.expect_err("duplicate");
        assert!(matches!(err, LauncherError::Duplicate(_)));

        runner.release.notify_one();
        assert!(first.await.expect("outcome").is_ok());
        assert_eq!(runner.started(), vec!["same".to_string()]);
    }

    #[tokio::test]
    async fn prioritized_entry_is_admitted_next() {
        let (queue, runner) = queue_with_limit(1);
        let _a = queue.submit(http("a")).expect("submit");
        let _b = queue.submit(http("b")).expect("submit");
        let c_request = http("c");
        let c_id = c_request.id.clone();
        let _c = queue.submit(c_request).expect("submit");
        settle().await;

        assert!(queue.prioritize(&c_id).await.expect("prioritize"));
        let status = queue.status().await.expect("status");
        assert_eq!(status.queued[0].id, c_id);

        runner.release.notify_one();
        settle().await;
        assert_eq!(runner.started(), vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn second_http_download_waits_for_the_first() {
        let (queue, runner) = queue_with_limit(1);
        let first = queue.submit(http("first")).expect("submit");
        let second = queue.submit(http("second")).expect("submit");
        settle().await;

        assert_eq!(runner.started(), vec!["first".to_string()]);
        let status = queue.status().await.expect("status");
        assert_eq!(status.queued.len(), 1);

        runner.release.notify_one();
        assert!(first.await.expect("outcome").is_ok());
        settle().await;
        assert_eq!(runner.started(), vec!["first".to_string(), "second".to_string()]);

        runner.release.notify_one();
        assert!(second.await.expect("outcome").is_ok());
    }

    #[tokio::test]
    async fn swap_suspends_active_torrent_and_requeues_it() {
        let (queue, runner) = queue_with_limit(1);
        let torrent = queue
            .submit(request(
                "seeded",
                "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
            ))
            .expect("submit");
        let urgent = http("urgent");
        let urgent_id = urgent.id.clone();
        let urgent_outcome = queue.submit(urgent).expect("submit");
        settle().await;

        assert!(queue.swap(&urgent_id).await.expect("swap"));
        settle().await;
        assert_eq!(runner.started(), vec!["seeded".to_string(), "urgent".to_string()]);

        let status = queue.status().await.expect("status");
        assert_eq!(status.active[0].id, urgent_id);
        assert_eq!(status.queued[0].title, "seeded");

        runner.release.notify_one();
        assert!(urgent_outcome.await.expect("outcome").is_ok());
        settle().await;
        assert_eq!(
            runner.started(),
            vec!["seeded".to_string(), "urgent".to_string(), "seeded".to_string()]
        );

        runner.release.notify_one();
        assert!(torrent.await.expect("outcome").is_ok());
    }

    #[tokio::test]
    async fn swap_without_active_torrent_falls_back_to_prioritize() {
        let (queue, runner) = queue_with_limit(1);
        let _a = queue.submit(http("a")).expect("submit");
        let _b = queue.submit(http("b")).expect("submit");
        let c = http("c");
        let c_id = c.id.clone();
        let _c = queue.submit(c).expect("submit");
        settle().await;

        assert!(queue.swap(&c_id).await.expect("swap"));
        runner.release.notify_one();
        settle().await;
        assert_eq!(runner.started(), vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn cancel_resolves_queued_and_active_jobs() {
        let (queue, _runner) = queue_with_limit(1);
        let active = http("active");
        let active_id = active.id.clone();
        let active_outcome = queue.submit(active).expect("submit");
        let waiting = http("waiting");
        let waiting_id = waiting.id.clone();
        let waiting_outcome = queue.submit(waiting).expect("submit");
        settle().await;

        assert!(queue.cancel(&waiting_id).await.expect("cancel queued"));
        assert!(waiting_outcome
            .await
            .expect("outcome")
            .expect_err("cancelled")
            .is_cancelled());

        assert!(queue.cancel(&active_id).await.expect("cancel active"));
        assert!(active_outcome
            .await
            .expect("outcome")
            .expect_err("cancelled")
            .is_cancelled());
        assert!(!queue.cancel("missing").await.expect("cancel missing"));
    }

    fn idle_scheduler(runner: Arc<dyn JobRunner>) -> Scheduler {
        let db = Database::open_in_memory().expect("db");
        db.set_setting(SETTING_MAX_PARALLEL, "1").expect("setting");
        let (commands, _inbox) = mpsc::unbounded_channel();
        Scheduler {
            runner,
            settings: Arc::new(db),
            notifier: Notifier::new(),
            commands,
            queued: Vec::new(),
            active: HashMap::new(),
            next_boost: 0,
        }
    }

    #[test]
    fn swapped_entry_stays_ahead_of_later_prioritize() {
        let mut scheduler = idle_scheduler(Arc::new(GatedRunner::default()));

        let seeded = request(
            "seeded",
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
        );
        let (control, control_rx) = watch::channel(JobControl::Running);
        let (done, _seeded_done) = oneshot::channel();
        scheduler.active.insert(
            seeded.id.clone(),
            ActiveJob {
                request: seeded,
                done,
                control,
                paused: false,
            },
        );

        let urgent = http("urgent");
        let urgent_id = urgent.id.clone();
        let late = http("late");
        let late_id = late.id.clone();
        let (urgent_done, _urgent_rx) = oneshot::channel();
        let (late_done, _late_rx) = oneshot::channel();
        scheduler.enqueue(urgent, urgent_done);
        scheduler.enqueue(late, late_done);

        assert!(scheduler.swap(&urgent_id));
        assert_eq!(*control_rx.borrow(), JobControl::Suspended);
        assert!(scheduler.prioritize(&late_id));

        let status = scheduler.snapshot();
        assert_eq!(status.queued[0].id, urgent_id);
        assert_eq!(status.queued[0].priority, -1);
        assert_eq!(status.queued[1].id, late_id);
        assert_eq!(status.queued[1].priority, 0);
        let next = scheduler.next_index().expect("next");
        assert_eq!(scheduler.queued[next].request.id, urgent_id);
    }

    /// Panics inside `run`; remembers which requests were abandoned.
    #[derive(Default)]
    struct PanickingRunner {
        abandoned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobRunner for PanickingRunner {
        async fn run(
            &self,
            request: DownloadRequest,
            _progress: mpsc::Sender<ProgressEvent>,
            _control: ControlReceiver,
        ) -> Result<JobOutcome> {
            panic!("job for {} blew up", request.title);
        }

        fn abandon(&self, request: &DownloadRequest, _error: &LauncherError) {
            if let Ok(mut abandoned) = self.abandoned.lock() {
                abandoned.push(request.title.clone());
            }
        }
    }

    #[tokio::test]
    async fn panicking_job_is_abandoned_and_reported() {
        let db = Database::open_in_memory().expect("db");
        let runner = Arc::new(PanickingRunner::default());
        let queue = DownloadQueue::start(runner.clone(), Arc::new(db), Notifier::new());

        let outcome = queue.submit(http("fragile")).expect("submit");
        let err = outcome.await.expect("outcome").expect_err("crashed");
        assert!(matches!(err, LauncherError::Config(ref message) if message.contains("crashed")));

        let abandoned = runner.abandoned.lock().expect("lock").clone();
        assert_eq!(abandoned, vec!["fragile".to_string()]);

        let status = queue.status().await.expect("status");
        assert!(status.active.is_empty());
    }
}
