use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use launcher_downloads::config::LauncherConfig;
use launcher_downloads::db::{self, Database};
use launcher_downloads::errors::Result;
use launcher_downloads::logging;
use launcher_downloads::models::{format_speed, DownloadRequest, DownloadSource, JobOutcome};
use launcher_downloads::services::{
    recover_interrupted_downloads, DownloadPipeline, DownloadQueue,
    ExtractProgress, InstallNormalizer, LauncherEvent, Notifier,
};
use launcher_downloads::utils::paths::{resolve_cache_dir, resolve_log_dir};

#[derive(Parser)]
#[command(name = "launcher-downloads")]
#[command(version)]
#[command(about = "Queue, download, extract and normalize game installs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log to stderr instead of the rolling log file
    #[arg(long, global = true)]
    log_stderr: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more sources (HTTP URLs, magnets or .torrent files) and install them
    ///
    /// Examples:
    ///   launcher-downloads fetch https://cdn.example/game.zip --title "Game"
    ///   launcher-downloads fetch "magnet:?xt=urn:btih:..." --no-extract
    Fetch {
        sources: Vec<String>,
        /// Display title; defaults to a name derived from the source
        #[arg(short, long)]
        title: Option<String>,
        /// Version recorded on the installed game
        #[arg(long)]
        version: Option<String>,
        /// Keep the downloaded payload without extracting it
        #[arg(long)]
        no_extract: bool,
        /// Lower runs first
        #[arg(long, default_value_t = 10)]
        priority: i64,
    },

    /// Collapse wrapper folders, flatten nested installs and remove junk
    Normalize { dir: PathBuf },

    /// Print the most likely game executable under a folder
    FindExe { dir: PathBuf },

    /// Apply update archives dropped inside an installed game
    ApplyUpdate {
        dir: PathBuf,
        /// Game page URL whose library row should be refreshed
        #[arg(long)]
        game_url: Option<String>,
    },

    /// Mark downloads left mid-flight by a previous run as interrupted
    Recover,
}

fn open_database() -> Result<Database> {
    db::init(&resolve_cache_dir())
}

fn title_for(source: &str, explicit: Option<&String>) -> String {
    if let Some(title) = explicit {
        return title.clone();
    }
    let trimmed = source.trim_end_matches('/');
    let name = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    name.split(['?', '#'])
        .next()
        .unwrap_or(name)
        .trim_end_matches(".torrent")
        .to_string()
}

async fn print_progress(mut updates: mpsc::Receiver<ExtractProgress>) {
    while let Some(update) = updates.recv().await {
        eprintln!("extracting {:>5.1}%", update.percent);
    }
}

async fn fetch(
    sources: Vec<String>,
    title: Option<String>,
    version: Option<String>,
    no_extract: bool,
    priority: i64,
) -> Result<bool> {
    let db = open_database()?;
    let report = recover_interrupted_downloads(&db)?;
    if !report.interrupted.is_empty() {
        tracing::info!("{} interrupted download(s) recovered", report.interrupted.len());
    }

    let notifier = Notifier::new();
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LauncherEvent::DownloadProgress(progress) => eprintln!(
                    "[{}] {:?} {:>5.1}% {}",
                    progress.queue_id,
                    progress.phase,
                    progress.percent,
                    format_speed(progress.speed_bps)
                ),
                LauncherEvent::DownloadError(payload) => {
                    eprintln!("error: {} ({})", payload.message, payload.title)
                }
                _ => {}
            }
        }
    });

    let pipeline = DownloadPipeline::new(db.clone(), notifier.clone(), LauncherConfig::from_env())?;
    let queue = DownloadQueue::start(Arc::new(pipeline), Arc::new(db), notifier);

    let mut pending = Vec::new();
    for source in sources {
        let mut request = DownloadRequest::new(
            source.clone(),
            DownloadSource::detect(&source),
            title_for(&source, title.as_ref()),
        )
        .with_priority(priority);
        request.version = version.clone();
        request.auto_extract = !no_extract;
        pending.push((source, queue.submit(request)?));
    }

    let mut all_ok = true;
    for (source, outcome) in pending {
        match outcome.await {
            Ok(Ok(JobOutcome::Installed {
                install_path,
                executable,
                ..
            })) => {
                println!("{} -> {}", source, install_path.display());
                if let Some(executable) = executable {
                    println!("  executable: {}", executable.display());
                }
            }
            Ok(Ok(JobOutcome::Downloaded { path, .. })) => {
                println!("{} -> {}", source, path.display());
            }
            Ok(Ok(JobOutcome::Suspended { .. })) => {
                println!("{} suspended", source);
            }
            Ok(Err(err)) => {
                all_ok = false;
                println!("{} failed: {}", source, err.user_message());
            }
            Err(_) => {
                all_ok = false;
                println!("{} dropped by the queue", source);
            }
        }
    }
    Ok(all_ok)
}

async fn run(command: Commands) -> Result<bool> {
    match command {
        Commands::Fetch {
            sources,
            title,
            version,
            no_extract,
            priority,
        } => fetch(sources, title, version, no_extract, priority).await,
        Commands::Normalize { dir } => {
            let config = LauncherConfig::from_env();
            let normalizer = InstallNormalizer::new(config.normalize);
            let report = tokio::task::spawn_blocking(move || normalizer.normalize(&dir))
                .await
                .map_err(|err| launcher_downloads::LauncherError::Config(err.to_string()))??;
            println!(
                "collapsed {} flattened {} removed {}",
                report.collapsed, report.flattened, report.junk_removed
            );
            Ok(true)
        }
        Commands::FindExe { dir } => {
            let normalizer = InstallNormalizer::new(LauncherConfig::from_env().normalize);
            match normalizer.find_executable(&dir) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(true)
                }
                None => {
                    println!("no executable found under {}", dir.display());
                    Ok(false)
                }
            }
        }
        Commands::ApplyUpdate { dir, game_url } => {
            let config = LauncherConfig::from_env();
            let pipeline = DownloadPipeline::new(open_database()?, Notifier::new(), config)?;
            let (tx, rx) = mpsc::channel(64);
            let printer = tokio::spawn(print_progress(rx));
            let report = pipeline.apply_update(&dir, game_url.as_deref(), tx).await;
            let _ = printer.await;
            let report = report?;
            for archive in &report.extracted {
                println!("applied {}", archive);
            }
            if let Some(executable) = report.executable {
                println!("executable: {}", executable.display());
            }
            Ok(true)
        }
        Commands::Recover => {
            let db = open_database()?;
            let report = recover_interrupted_downloads(&db)?;
            println!(
                "{} interrupted, {} stale install marker(s)",
                report.interrupted.len(),
                report.stale_markers.len()
            );
            for marker in report.stale_markers {
                println!("  {}", marker.display());
            }
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let logged = if cli.log_stderr {
        logging::init_stderr()
    } else {
        logging::init(&resolve_log_dir())
    };
    if let Err(err) = logged {
        eprintln!("logging disabled: {}", err);
    }

    match run(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{}", err);
            eprintln!("error: {}", err.user_message());
            ExitCode::FAILURE
        }
    }
}
