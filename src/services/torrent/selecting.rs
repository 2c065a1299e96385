use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::errors::{LauncherError, Result};
use crate::services::torrent::{EngineInfo, TorrentEngine, TorrentStatus};

/// Uses the primary engine; the fallback is only tried when explicitly allowed.
pub struct SelectingEngine {
    primary: Arc<dyn TorrentEngine>,
    fallback: Option<Arc<dyn TorrentEngine>>,
    allow_fallback: bool,
    selected: Mutex<Option<Arc<dyn TorrentEngine>>>,
    startup: tokio::sync::Mutex<()>,
}

impl SelectingEngine {
    pub fn new(
        primary: Arc<dyn TorrentEngine>,
        fallback: Option<Arc<dyn TorrentEngine>>,
        allow_fallback: bool,
    ) -> Self {
        Self {
            primary,
            fallback,
            allow_fallback,
            selected: Mutex::new(None),
            startup: tokio::sync::Mutex::new(()),
        }
    }

    fn selected(&self) -> Option<Arc<dyn TorrentEngine>> {
        self.selected.lock().ok().and_then(|guard| guard.clone())
    }

    fn select(&self, engine: Arc<dyn TorrentEngine>) {
        if let Ok(mut guard) = self.selected.lock() {
            *guard = Some(engine);
        }
    }

    pub fn active_engine_name(&self) -> Option<&'static str> {
        self.selected().map(|engine| engine.name())
    }

    async fn engine(&self) -> Result<Arc<dyn TorrentEngine>> {
        self.start().await?;
        self.selected().ok_or_else(|| {
            LauncherError::EngineUnavailable("no torrent engine selected".to_string())
        })
    }
}

#[async_trait]
impl TorrentEngine for SelectingEngine {
    fn name(&self) -> &'static str {
        "selecting"
    }

    async fn start(&self) -> Result<()> {
        if self.selected().is_some() {
            return Ok(());
        }
        let _guard = self.startup.lock().await;
        if self.selected().is_some() {
            return Ok(());
        }

        let primary_error = match self.primary.start().await {
            Ok(()) => {
                self.select(self.primary.clone());
                return Ok(());
            }
            Err(err) => err,
        };

        let fallback = match (&self.fallback, self.allow_fallback) {
            (Some(fallback), true) => fallback.clone(),
            _ => {
                return Err(LauncherError::EngineUnavailable(format!(
                    "{} engine: {}",
                    self.primary.name(),
                    primary_error
                )))
            }
        };

        tracing::warn!(
            "{} engine failed ({}); trying {} engine",
            self.primary.name(),
            primary_error,
            fallback.name()
        );
        match fallback.start().await {
            Ok(()) => {
                self.select(fallback);
                Ok(())
            }
            Err(fallback_error) => Err(LauncherError::EngineUnavailable(format!(
                "{} engine: {}; {} engine: {}",
                self.primary.name(),
                primary_error,
                fallback.name(),
                fallback_error
            ))),
        }
    }

    async fn ping(&self) -> Result<EngineInfo> {
        self.engine().await?.ping().await
    }

    async fn add(&self, source: &str, save_path: &Path) -> Result<String> {
        self.engine().await?.add(source, save_path).await
    }

    async fn status(&self, torrent_id: &str) -> Result<TorrentStatus> {
        self.engine().await?.status(torrent_id).await
    }

    async fn pause(&self, torrent_id: &str) -> Result<()> {
        self.engine().await?.pause(torrent_id).await
    }

    async fn resume(&self, torrent_id: &str) -> Result<()> {
        self.engine().await?.resume(torrent_id).await
    }

    async fn remove(&self, torrent_id: &str, delete_files: bool) -> Result<()> {
        self.engine().await?.remove(torrent_id, delete_files).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubEngine {
        name: &'static str,
        starts: bool,
        start_calls: AtomicUsize,
    }

    impl StubEngine {
        fn new(name: &'static str, starts: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                starts,
                start_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TorrentEngine for StubEngine {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self) -> Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.starts {
                Ok(())
            } else {
                Err(LauncherError::EngineUnavailable(format!("{} down", self.name)))
            }
        }

        async fn ping(&self) -> Result<EngineInfo> {
            Ok(EngineInfo {
                engine: self.name,
                version: None,
            })
        }

        async fn add(&self, _source: &str, _save_path: &Path) -> Result<String> {
            Ok(self.name.to_string())
        }

        async fn status(&self, _torrent_id: &str) -> Result<TorrentStatus> {
            Ok(TorrentStatus::default())
        }

        async fn pause(&self, _torrent_id: &str) -> Result<()> {
            Ok(())
        }

        async fn resume(&self, _torrent_id: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _torrent_id: &str, _delete_files: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fallback_requires_opt_in() {
        let primary = StubEngine::new("sidecar", false);
        let fallback = StubEngine::new("daemon", true);

        let strict = SelectingEngine::new(
            primary.clone(),
            Some(fallback.clone() as Arc<dyn TorrentEngine>),
            false,
        );
        let err = strict.ping().await.expect_err("no fallback");
        assert!(matches!(err, LauncherError::EngineUnavailable(_)));
        assert_eq!(fallback.start_calls.load(Ordering::SeqCst), 0);

        let lenient =
            SelectingEngine::new(primary, Some(fallback as Arc<dyn TorrentEngine>), true);
        let info = lenient.ping().await.expect("fallback");
        assert_eq!(info.engine, "daemon");
        assert_eq!(lenient.active_engine_name(), Some("daemon"));
    }

    #[tokio::test]
    async fn primary_wins_and_is_started_once() {
        let primary = StubEngine::new("sidecar", true);
        let engine = SelectingEngine::new(primary.clone(), None, true);
        assert_eq!(
            engine.add("magnet:?", Path::new("/tmp")).await.expect("add"),
            "sidecar"
        );
        engine.status("x").await.expect("status");
        assert_eq!(primary.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn both_failing_reports_both_reasons() {
        let engine = SelectingEngine::new(
            StubEngine::new("sidecar", false),
            Some(StubEngine::new("daemon", false) as Arc<dyn TorrentEngine>),
            true,
        );
        let message = engine.start().await.expect_err("down").to_string();
        assert!(message.contains("sidecar down"));
        assert!(message.contains("daemon down"));
    }
}
