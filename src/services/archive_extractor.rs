use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use zip::ZipArchive;

use crate::config::ExtractorConfig;
use crate::errors::{LauncherError, Result};
use crate::utils::process::{hide_console_window, trim_text_snippet};

static PERCENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,3})%").expect("percent regex is valid")
});

const OUTPUT_TAIL_CHARS: usize = 4000;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExtractProgress {
    pub percent: f64,
    pub eta_seconds: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Rar,
    Zip,
    SevenZip,
    Other,
}

impl ArchiveKind {
    pub fn of(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".rar") {
            ArchiveKind::Rar
        } else if name.ends_with(".zip") {
            ArchiveKind::Zip
        } else if name.ends_with(".7z") || name.contains(".7z.") {
            ArchiveKind::SevenZip
        } else {
            ArchiveKind::Other
        }
    }
}

pub fn is_archive(path: &Path) -> bool {
    ArchiveKind::of(path) != ArchiveKind::Other
}

fn archive_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Pulls percentages out of 7-Zip's progress stream. Output is split on
/// carriage returns, newlines and backspaces; a trailing partial segment is held back.
#[derive(Default)]
pub(crate) struct ProgressParser {
    carry: String,
    best: f64,
}

impl ProgressParser {
    fn scan(&mut self, segment: &str) -> Option<f64> {
        let mut advanced = None;
        for capture in PERCENT_PATTERN.captures_iter(segment) {
            let value = capture
                .get(1)
                .and_then(|digits| digits.as_str().parse::<f64>().ok())
                .filter(|value| *value <= 100.0);
            if let Some(value) = value {
                if value > self.best {
                    self.best = value;
                    advanced = Some(value);
                }
            }
        }
        advanced
    }

    /// Returns the new high-water mark if this chunk moved it.
    pub(crate) fn feed(&mut self, chunk: &str) -> Option<f64> {
        self.carry.push_str(chunk);
        let Some(cut) = self.carry.rfind(['\r', '\n', '\u{8}']) else {
            return None;
        };
        let complete: String = self.carry.drain(..=cut).collect();
        let mut advanced = None;
        for segment in complete.split(['\r', '\n', '\u{8}']) {
            if let Some(value) = self.scan(segment) {
                advanced = Some(value);
            }
        }
        advanced
    }

    pub(crate) fn finish(&mut self) -> Option<f64> {
        let rest = std::mem::take(&mut self.carry);
        self.scan(&rest)
    }
}

pub(crate) fn estimate_eta(elapsed_secs: f64, percent: f64) -> Option<u64> {
    if percent <= 0.0 || percent >= 100.0 {
        return None;
    }
    Some((elapsed_secs / percent * (100.0 - percent)).round() as u64)
}

struct OutputTail {
    text: String,
}

impl OutputTail {
    fn push(&mut self, chunk: &str) {
        self.text.extend(chunk.chars().filter(|ch| *ch != '\u{8}'));
        let count = self.text.chars().count();
        if count > OUTPUT_TAIL_CHARS * 2 {
            self.text = self.text.chars().skip(count - OUTPUT_TAIL_CHARS).collect();
        }
    }
}

enum ToolFailure {
    /// The tool could not be launched at all.
    Missing(io::Error),
    Failed(String),
}

#[derive(Clone)]
pub struct ArchiveExtractor {
    config: ExtractorConfig,
}

impl ArchiveExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extracts one archive (for multi-volume sets, the first volume) into `dest`.
    pub async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        password: Option<&str>,
        progress: mpsc::Sender<ExtractProgress>,
    ) -> Result<()> {
        let label = archive_label(archive);
        if !archive.is_file() {
            return Err(LauncherError::Extraction {
                archive: label,
                detail: format!("archive not found at {}", archive.display()),
            });
        }
        tokio::fs::create_dir_all(dest).await?;

        let password = password
            .map(|value| value.to_string())
            .unwrap_or_else(|| self.config.default_password.clone());
        let kind = ArchiveKind::of(archive);
        tracing::info!("extracting {} into {}", label, dest.display());

        let failure = match self.run_seven_zip(archive, dest, &password, &progress).await {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };

        match (kind, failure) {
            (ArchiveKind::Zip, ToolFailure::Missing(err)) => {
                tracing::warn!("7-Zip unavailable ({}); extracting {} in-process", err, label);
                self.extract_zip_blocking(archive, dest, progress).await
            }
            (ArchiveKind::Rar, failure) if self.config.rar_fallback => {
                let primary = match &failure {
                    ToolFailure::Missing(err) => format!("7-Zip unavailable: {}", err),
                    ToolFailure::Failed(detail) => detail.clone(),
                };
                tracing::warn!("7-Zip failed on {} ({}); retrying with unrar", label, primary);
                self.extract_rar_blocking(archive, dest, &password, progress)
                    .await
                    .map_err(|err| LauncherError::Extraction {
                        archive: label.clone(),
                        detail: format!("{}; unrar fallback: {}", primary, err),
                    })
            }
            (_, ToolFailure::Missing(err)) => Err(LauncherError::Extraction {
                archive: label,
                detail: format!(
                    "failed to launch {}: {}",
                    self.config.seven_zip_path, err
                ),
            }),
            (_, ToolFailure::Failed(detail)) => Err(LauncherError::Extraction {
                archive: label,
                detail,
            }),
        }
    }

    async fn run_seven_zip(
        &self,
        archive: &Path,
        dest: &Path,
        password: &str,
        progress: &mpsc::Sender<ExtractProgress>,
    ) -> std::result::Result<(), ToolFailure> {
        let mut command = Command::new(&self.config.seven_zip_path);
        command
            .arg("x")
            .arg("-y")
            .arg("-bsp1")
            .arg("-bso1")
            .arg(format!("-o{}", dest.display()))
            .arg(format!("-p{}", password))
            .arg(archive)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut command);

        let mut child = command.spawn().map_err(ToolFailure::Missing)?;

        // Both streams feed one channel so percentages are read from the combined output.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<(bool, String)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, false, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, true, chunk_tx.clone()));
        }
        drop(chunk_tx);

        let started = Instant::now();
        let mut parser = ProgressParser::default();
        let mut stdout_tail = OutputTail { text: String::new() };
        let mut stderr_tail = OutputTail { text: String::new() };

        while let Some((is_stderr, chunk)) = chunk_rx.recv().await {
            if is_stderr {
                stderr_tail.push(&chunk);
            } else {
                stdout_tail.push(&chunk);
            }
            if let Some(percent) = parser.feed(&chunk) {
                let eta = estimate_eta(started.elapsed().as_secs_f64(), percent);
                let _ = progress
                    .send(ExtractProgress {
                        percent,
                        eta_seconds: eta,
                    })
                    .await;
            }
        }
        if let Some(percent) = parser.finish() {
            let _ = progress
                .send(ExtractProgress {
                    percent,
                    eta_seconds: None,
                })
                .await;
        }

        let status = child
            .wait()
            .await
            .map_err(|err| ToolFailure::Failed(format!("failed to wait for 7-Zip: {}", err)))?;
        if status.success() {
            return Ok(());
        }

        let code = status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(ToolFailure::Failed(format!(
            "7-Zip exited with code {}; stderr: {}; stdout: {}",
            code,
            trim_text_snippet(&stderr_tail.text, 600),
            trim_text_snippet(&stdout_tail.text, 600)
        )))
    }

    async fn extract_zip_blocking(
        &self,
        archive: &Path,
        dest: &Path,
        progress: mpsc::Sender<ExtractProgress>,
    ) -> Result<()> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip_archive(&archive, &dest, &progress))
            .await
            .map_err(|err| LauncherError::Config(format!("zip extraction task failed: {}", err)))?
    }

    async fn extract_rar_blocking(
        &self,
        archive: &Path,
        dest: &Path,
        password: &str,
        progress: mpsc::Sender<ExtractProgress>,
    ) -> Result<()> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || extract_rar_archive(&archive, &dest, &password, &progress))
            .await
            .map_err(|err| LauncherError::Config(format!("unrar task failed: {}", err)))?
    }
}

async fn pump_output<R>(mut reader: R, is_stderr: bool, sink: mpsc::Sender<(bool, String)>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; 8192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let chunk = String::from_utf8_lossy(&buffer[..read]).to_string();
                if sink.send((is_stderr, chunk)).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn is_safe_relative_path(path: &Path) -> bool {
    path.components().all(|component| {
        !matches!(
            component,
            Component::Prefix(_) | Component::RootDir | Component::ParentDir
        )
    })
}

fn report_blocking(progress: &mpsc::Sender<ExtractProgress>, done: usize, total: usize) {
    if total == 0 {
        return;
    }
    let _ = progress.try_send(ExtractProgress {
        percent: (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0),
        eta_seconds: None,
    });
}

pub(crate) fn extract_zip_archive(
    archive_path: &Path,
    dest: &Path,
    progress: &mpsc::Sender<ExtractProgress>,
) -> Result<()> {
    let label = archive_label(archive_path);
    let zip_error = |err: zip::result::ZipError| LauncherError::Extraction {
        archive: label.clone(),
        detail: err.to_string(),
    };

    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(zip_error)?;
    let total = archive.len();
    for index in 0..total {
        let mut entry = archive.by_index(index).map_err(zip_error)?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        let entry_path = PathBuf::from(&name);
        if !is_safe_relative_path(&entry_path) {
            tracing::warn!("skipping unsafe zip entry {}", name);
            continue;
        }
        let out_path = dest.join(&entry_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        report_blocking(progress, index + 1, total);
    }
    Ok(())
}

/// Slow path for environments where 7-Zip's RAR codec is missing or broken.
pub(crate) fn extract_rar_archive(
    archive_path: &Path,
    dest: &Path,
    password: &str,
    progress: &mpsc::Sender<ExtractProgress>,
) -> Result<()> {
    let label = archive_label(archive_path);
    let rar_error = |stage: &str, detail: String| LauncherError::Extraction {
        archive: label.clone(),
        detail: format!("{}: {}", stage, detail),
    };

    let total = unrar::Archive::with_password(archive_path, password)
        .open_for_listing()
        .map(|listing| {
            listing
                .filter_map(|header| header.ok())
                .filter(|header| header.is_file())
                .count()
        })
        .unwrap_or(0);

    let mut archive = unrar::Archive::with_password(archive_path, password)
        .open_for_processing()
        .map_err(|err| rar_error("open", format!("{:?}", err)))?;

    let mut done = 0usize;
    while let Some(header) = archive
        .read_header()
        .map_err(|err| rar_error("read header", format!("{:?}", err)))?
    {
        archive = if header.entry().is_file() {
            done += 1;
            let next = header
                .extract_with_base(dest)
                .map_err(|err| rar_error("extract", format!("{:?}", err)))?;
            report_blocking(progress, done, total.max(done));
            next
        } else {
            header
                .skip()
                .map_err(|err| rar_error("skip", format!("{:?}", err)))?
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_seven_zip_progress_stream() {
        let mut parser = ProgressParser::default();
        let mut seen = Vec::new();
        let captured = [
            "\n7-Zip 23.01 (x64)\n\nExtracting archive: game.7z\n",
            "  0%\u{8}\u{8}\u{8}\u{8}    \u{8}\u{8}\u{8}\u{8}  1",
            "2% 3 - Game\\data.pak\u{8}\u{8}\u{8}\u{8}\u{8}",
            " 57% 9\r 40%\r",
            "100%\nEverything is Ok\n",
        ];
        for chunk in captured {
            if let Some(value) = parser.feed(chunk) {
                seen.push(value);
            }
        }
        assert_eq!(seen, vec![12.0, 57.0, 100.0]);
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn trailing_segment_is_read_at_the_end() {
        let mut parser = ProgressParser::default();
        assert_eq!(parser.feed(" 33"), None);
        assert_eq!(parser.feed("%"), None);
        assert_eq!(parser.finish(), Some(33.0));
    }

    #[test]
    fn eta_scales_with_remaining_percent() {
        assert_eq!(estimate_eta(10.0, 25.0), Some(30));
        assert_eq!(estimate_eta(10.0, 0.0), None);
        assert_eq!(estimate_eta(10.0, 100.0), None);
    }

    #[test]
    fn classifies_archive_kinds() {
        assert_eq!(ArchiveKind::of(Path::new("a/patch.part01.rar")), ArchiveKind::Rar);
        assert_eq!(ArchiveKind::of(Path::new("Game.ZIP")), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::of(Path::new("game.7z.001")), ArchiveKind::SevenZip);
        assert!(!is_archive(Path::new("game.exe")));
    }

    fn write_zip(path: &Path) {
        let file = File::create(path).expect("zip file");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        writer.start_file("Game/game.exe", options).expect("entry");
        writer.write_all(b"MZ").expect("write");
        writer.start_file("../escape.txt", options).expect("entry");
        writer.write_all(b"nope").expect("write");
        writer.finish().expect("finish");
    }

    #[tokio::test]
    async fn zip_falls_back_when_seven_zip_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let archive = temp.path().join("game.zip");
        write_zip(&archive);
        let dest = temp.path().join("out");

        let extractor = ArchiveExtractor::new(ExtractorConfig {
            seven_zip_path: temp.path().join("missing-7z").to_string_lossy().to_string(),
            ..ExtractorConfig::default()
        });
        let (tx, _rx) = mpsc::channel(16);
        extractor
            .extract(&archive, &dest, None, tx)
            .await
            .expect("extract");

        assert!(dest.join("Game/game.exe").is_file());
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn missing_archive_names_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let extractor = ArchiveExtractor::new(ExtractorConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let err = extractor
            .extract(&temp.path().join("gone.rar"), temp.path(), None, tx)
            .await
            .expect_err("missing");
        assert!(matches!(err, LauncherError::Extraction { ref archive, .. } if archive == "gone.rar"));
    }

    #[cfg(unix)]
    mod stand_in {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn stand_in_tool(dir: &Path, body: &str) -> String {
            let path = dir.join("7z-stand-in");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write tool");
            let mut permissions = std::fs::metadata(&path).expect("meta").permissions();
            permissions.set_mode(0o755);
            std::fs::set_permissions(&path, permissions).expect("chmod");
            path.to_string_lossy().to_string()
        }

        #[tokio::test]
        async fn non_zero_exit_reports_code_and_output() {
            let temp = tempfile::tempdir().expect("tempdir");
            let archive = temp.path().join("game.7z");
            std::fs::write(&archive, b"7z").expect("archive");
            let tool = stand_in_tool(
                temp.path(),
                "printf ' 15%%\\r'\necho 'ERROR: Wrong password : game.7z' >&2\nexit 2",
            );

            let extractor = ArchiveExtractor::new(ExtractorConfig {
                seven_zip_path: tool,
                ..ExtractorConfig::default()
            });
            let (tx, mut rx) = mpsc::channel(16);
            let err = extractor
                .extract(&archive, &temp.path().join("out"), None, tx)
                .await
                .expect_err("exit 2");

            match err {
                LauncherError::Extraction { archive, detail } => {
                    assert_eq!(archive, "game.7z");
                    assert!(detail.contains("code 2"));
                    assert!(detail.contains("Wrong password"));
                }
                other => panic!("unexpected error {:?}", other),
            }
            assert_eq!(rx.recv().await.map(|p| p.percent), Some(15.0));
        }

        #[tokio::test]
        async fn passes_default_password_and_reports_progress() {
            let temp = tempfile::tempdir().expect("tempdir");
            let archive = temp.path().join("game.7z");
            std::fs::write(&archive, b"7z").expect("archive");
            let args_file = temp.path().join("args.txt");
            let tool = stand_in_tool(
                temp.path(),
                &format!(
                    "echo \"$@\" > '{}'\nprintf ' 10%%\\r 55%%\\r100%%\\n'\nexit 0",
                    args_file.display()
                ),
            );

            let extractor = ArchiveExtractor::new(ExtractorConfig {
                seven_zip_path: tool,
                ..ExtractorConfig::default()
            });
            let (tx, mut rx) = mpsc::channel(16);
            extractor
                .extract(&archive, &temp.path().join("out"), None, tx)
                .await
                .expect("extract");

            let mut percents = Vec::new();
            while let Some(update) = rx.recv().await {
                percents.push(update.percent);
            }
            assert_eq!(percents, vec![10.0, 55.0, 100.0]);

            let args = std::fs::read_to_string(&args_file).expect("args");
            assert!(args.contains("-ponline-fix.me"));
            assert!(args.starts_with("x -y"));
        }
    }
}
