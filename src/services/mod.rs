pub mod archive_extractor;
pub mod download_pipeline;
pub mod download_queue;
pub mod extraction_supervisor;
pub mod http_download;
pub mod install_normalizer;
pub mod job_control;
pub mod notifier;
pub mod torrent;
pub mod update_worker;

pub use archive_extractor::{ArchiveExtractor, ExtractProgress};
pub use download_pipeline::{recover_interrupted_downloads, DownloadPipeline, JobRunner, RecoveryReport};
pub use download_queue::DownloadQueue;
pub use extraction_supervisor::ExtractionSupervisor;
pub use http_download::HttpDownloader;
pub use install_normalizer::{InstallNormalizer, NormalizeReport};
pub use job_control::{ControlReceiver, JobControl};
pub use notifier::{LauncherEvent, Notifier};
pub use torrent::TorrentClient;
pub use update_worker::{ExtractionTask, ExtractionWorker, WorkerReport};
