use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, RANGE};
use reqwest::StatusCode;
use sysinfo::Disks;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::config::HttpConfig;
use crate::errors::{LauncherError, Result};
use crate::models::{format_bytes, JobPhase, ProgressEvent};
use crate::services::job_control::{wait_for_running, ControlReceiver, JobControl};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const FALLBACK_FILE_NAME: &str = "download.bin";

#[derive(Clone, Debug)]
pub struct HttpJob {
    pub queue_id: String,
    pub url: String,
    pub dest_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpFinish {
    Completed { path: PathBuf, total_bytes: u64 },
    /// Stopped for a swap; the `.part` file stays for a ranged resume.
    Suspended,
}

enum TransferEnd {
    Finished { path: PathBuf, total_bytes: u64 },
    Interrupted(JobControl),
}

fn sanitize_file_name(name: &str) -> Option<String> {
    let trimmed = name.trim().trim_matches('"').replace('\\', "/");
    let last = trimmed.rsplit('/').next()?.trim().to_string();
    if last.is_empty() || last == "." || last == ".." {
        None
    } else {
        Some(last)
    }
}

/// Reads `filename*=` (RFC 5987) or `filename=` from a Content-Disposition value.
pub fn file_name_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key == "filename*" {
            let encoded = raw.trim().trim_matches('"');
            let encoded = encoded.split_once("''").map(|(_, rest)| rest).unwrap_or(encoded);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                if let Some(name) = sanitize_file_name(&decoded) {
                    return Some(name);
                }
            }
        } else if key == "filename" {
            plain = sanitize_file_name(raw);
        }
    }
    plain
}

pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    sanitize_file_name(&decoded)
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

pub fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().to_string_lossy().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }
    best.map(|(_, available)| available)
}

fn ensure_disk_space(dest: &Path, needed: u64) -> Result<()> {
    let Some(available) = available_disk_space(dest) else {
        return Ok(());
    };
    if available < needed {
        return Err(LauncherError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "not enough space on disk: need {}, available {}",
                format_bytes(needed),
                format_bytes(available)
            ),
        )));
    }
    Ok(())
}

struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    last_speed: u64,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            last_speed: 0,
        }
    }

    fn add(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.last_speed = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }
}

#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true);
        if config.disable_system_proxy {
            builder = builder.no_proxy();
        }
        if let Some(proxy_url) = &config.proxy {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    tracing::info!("using launcher proxy: {}", proxy_url);
                }
                Err(err) => tracing::warn!("invalid LAUNCHER_PROXY '{}': {}", proxy_url, err),
            }
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Streams `job.url` into `job.dest_dir`, resuming an existing `.part` file.
    pub async fn download(
        &self,
        job: &HttpJob,
        progress: &mpsc::Sender<ProgressEvent>,
        control: &mut ControlReceiver,
    ) -> Result<HttpFinish> {
        tokio::fs::create_dir_all(&job.dest_dir).await?;
        let url_name = file_name_from_url(&job.url).unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        let part_path = job.dest_dir.join(format!("{}.part", url_name));

        loop {
            match wait_for_running(control).await {
                Ok(JobControl::Suspended) => return Ok(HttpFinish::Suspended),
                Ok(_) => {}
                Err(err) => {
                    remove_part(&part_path).await;
                    return Err(err);
                }
            }

            match self
                .transfer(job, &url_name, &part_path, progress, control)
                .await?
            {
                TransferEnd::Finished { path, total_bytes } => {
                    return Ok(HttpFinish::Completed { path, total_bytes })
                }
                TransferEnd::Interrupted(JobControl::Paused) => {
                    let mut event = ProgressEvent::new(job.queue_id.clone(), JobPhase::Paused, 0.0);
                    event.detail = Some("paused".to_string());
                    let _ = progress.send(event).await;
                }
                TransferEnd::Interrupted(JobControl::Suspended) => return Ok(HttpFinish::Suspended),
                TransferEnd::Interrupted(JobControl::Cancelled) => {
                    remove_part(&part_path).await;
                    return Err(LauncherError::Cancelled);
                }
                TransferEnd::Interrupted(JobControl::Running) => {}
            }
        }
    }

    async fn transfer(
        &self,
        job: &HttpJob,
        url_name: &str,
        part_path: &Path,
        progress: &mpsc::Sender<ProgressEvent>,
        control: &mut ControlReceiver,
    ) -> Result<TransferEnd> {
        let mut offset = tokio::fs::metadata(part_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut request = self.client.get(&job.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;
        let status = response.status();

        let final_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(file_name_from_disposition)
            .unwrap_or_else(|| url_name.to_string());
        let final_path = job.dest_dir.join(&final_name);

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            tracing::info!("{} already fully downloaded", final_name);
            tokio::fs::rename(part_path, &final_path).await?;
            return Ok(TransferEnd::Finished {
                path: final_path,
                total_bytes: offset,
            });
        }
        if !status.is_success() {
            return Err(LauncherError::Http(format!(
                "GET {} returned {}",
                job.url, status
            )));
        }

        let resumed = status == StatusCode::PARTIAL_CONTENT && offset > 0;
        if !resumed {
            offset = 0;
        }
        let total = response.content_length().map(|length| length + offset);
        if let Some(total) = total {
            ensure_disk_space(&job.dest_dir, total.saturating_sub(offset))?;
        }
        tracing::info!(
            "downloading {} ({}{})",
            final_name,
            total.map(format_bytes).unwrap_or_else(|| "unknown size".to_string()),
            if resumed {
                format!(", resuming at {}", format_bytes(offset))
            } else {
                String::new()
            }
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(part_path)
            .await?;

        let mut stream = response.bytes_stream();
        let mut written = offset;
        let mut meter = SpeedMeter::new();
        let mut last_report: Option<Instant> = None;
        let mut best_percent = 0.0f64;

        loop {
            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() {
                        file.flush().await?;
                        return Ok(TransferEnd::Interrupted(JobControl::Cancelled));
                    }
                    let state = *control.borrow();
                    if state != JobControl::Running {
                        file.flush().await?;
                        return Ok(TransferEnd::Interrupted(state));
                    }
                }
                next = stream.next() => {
                    let Some(next) = next else { break; };
                    let bytes = next?;
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                    meter.add(bytes.len() as u64);

                    let due = last_report
                        .map(|at| at.elapsed() >= PROGRESS_INTERVAL)
                        .unwrap_or(true);
                    if due {
                        last_report = Some(Instant::now());
                        if let Some(total) = total.filter(|total| *total > 0) {
                            let percent = (written as f64 / total as f64 * 100.0).min(99.9);
                            best_percent = best_percent.max(percent);
                        }
                        let mut event = ProgressEvent::new(job.queue_id.clone(), JobPhase::Downloading, best_percent);
                        event.speed_bps = meter.last_speed;
                        event.eta_seconds = total
                            .filter(|_| meter.last_speed > 0)
                            .map(|total| total.saturating_sub(written) / meter.last_speed.max(1));
                        let _ = progress.send(event).await;
                    }
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(total) = total {
            if written < total {
                return Err(LauncherError::Http(format!(
                    "connection closed after {} of {}",
                    format_bytes(written),
                    format_bytes(total)
                )));
            }
        }

        if tokio::fs::metadata(&final_path).await.is_ok() {
            tokio::fs::remove_file(&final_path).await?;
        }
        tokio::fs::rename(part_path, &final_path).await?;

        let _ = progress
            .send(ProgressEvent::new(job.queue_id.clone(), JobPhase::Downloading, 100.0))
            .await;
        Ok(TransferEnd::Finished {
            path: final_path,
            total_bytes: written,
        })
    }
}

async fn remove_part(part_path: &Path) {
    if tokio::fs::metadata(part_path).await.is_ok() {
        if let Err(err) = tokio::fs::remove_file(part_path).await {
            tracing::warn!("failed to remove {}: {}", part_path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    #[test]
    fn reads_file_names_from_headers_and_urls() {
        assert_eq!(
            file_name_from_disposition("attachment; filename=\"Game Setup.zip\"").as_deref(),
            Some("Game Setup.zip")
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename=x.zip; filename*=UTF-8''Gra%C3%A7a.zip")
                .as_deref(),
            Some("Graça.zip")
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename=\"../../evil.rar\"").as_deref(),
            Some("evil.rar")
        );
        assert_eq!(
            file_name_from_url("https://cdn.example.com/files/My%20Game.7z?token=1").as_deref(),
            Some("My Game.7z")
        );
        assert_eq!(file_name_from_url("https://cdn.example.com/"), None);
    }

    async fn read_head(stream: &mut tokio::net::TcpStream) -> String {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&buffer).contains("\r\n\r\n") {
            let read = stream.read(&mut chunk).await.expect("read");
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
        String::from_utf8_lossy(&buffer).to_string()
    }

    /// Serves `body` once, honouring a `Range: bytes=N-` header.
    async fn serve_once(body: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let head = read_head(&mut stream).await;
            let start = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if !name.trim().eq_ignore_ascii_case("range") {
                        return None;
                    }
                    value.trim().strip_prefix("bytes=")?.trim_end_matches('-').parse::<usize>().ok()
                })
                .unwrap_or(0);
            let status = if start > 0 { "206 Partial Content" } else { "200 OK" };
            let slice = &body[start..];
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Disposition: attachment; filename=\"game.zip\"\r\nConnection: close\r\n\r\n",
                status,
                slice.len()
            );
            stream.write_all(response.as_bytes()).await.expect("write head");
            stream.write_all(slice).await.expect("write body");
            stream.shutdown().await.ok();
            head
        });
        (format!("http://127.0.0.1:{}/files/archive", port), server)
    }

    fn downloader() -> HttpDownloader {
        HttpDownloader::new(&HttpConfig {
            disable_system_proxy: true,
            ..HttpConfig::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn downloads_into_named_file_with_final_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let body: Vec<u8> = (0..64 * 1024).map(|index| (index % 251) as u8).collect();
        let (url, server) = serve_once(body.clone()).await;

        let (tx, mut rx) = mpsc::channel(64);
        let (_control_tx, mut control) = watch::channel(JobControl::Running);
        let job = HttpJob {
            queue_id: "q1".to_string(),
            url,
            dest_dir: temp.path().to_path_buf(),
        };
        let finish = downloader()
            .download(&job, &tx, &mut control)
            .await
            .expect("download");
        server.await.expect("server");

        assert_eq!(
            finish,
            HttpFinish::Completed {
                path: temp.path().join("game.zip"),
                total_bytes: body.len() as u64,
            }
        );
        assert_eq!(std::fs::read(temp.path().join("game.zip")).expect("file"), body);
        assert!(!temp.path().join("archive.part").exists());

        drop(tx);
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event.percent);
        }
        assert_eq!(last, Some(100.0));
    }

    #[tokio::test]
    async fn resumes_an_existing_part_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let body: Vec<u8> = (0..10_000).map(|index| (index % 13) as u8).collect();
        std::fs::write(temp.path().join("archive.part"), &body[..4000]).expect("part");
        let (url, server) = serve_once(body.clone()).await;

        let (tx, _rx) = mpsc::channel(64);
        let (_control_tx, mut control) = watch::channel(JobControl::Running);
        let job = HttpJob {
            queue_id: "q2".to_string(),
            url,
            dest_dir: temp.path().to_path_buf(),
        };
        downloader()
            .download(&job, &tx, &mut control)
            .await
            .expect("download");

        let head = server.await.expect("server").to_ascii_lowercase();
        assert!(head.contains("range: bytes=4000-"));
        assert_eq!(std::fs::read(temp.path().join("game.zip")).expect("file"), body);
    }

    #[tokio::test]
    async fn cancelled_before_start_removes_partial_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.bin.part"), b"partial").expect("part");
        let (tx, _rx) = mpsc::channel(4);
        let (_control_tx, mut control) = watch::channel(JobControl::Cancelled);
        let job = HttpJob {
            queue_id: "q3".to_string(),
            url: "http://127.0.0.1:9/a.bin".to_string(),
            dest_dir: temp.path().to_path_buf(),
        };
        let err = downloader()
            .download(&job, &tx, &mut control)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(!temp.path().join("a.bin.part").exists());
    }

    #[tokio::test]
    async fn suspended_job_keeps_partial_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.bin.part"), b"partial").expect("part");
        let (tx, _rx) = mpsc::channel(4);
        let (_control_tx, mut control) = watch::channel(JobControl::Suspended);
        let job = HttpJob {
            queue_id: "q4".to_string(),
            url: "http://127.0.0.1:9/a.bin".to_string(),
            dest_dir: temp.path().to_path_buf(),
        };
        let finish = downloader()
            .download(&job, &tx, &mut control)
            .await
            .expect("suspended");
        assert_eq!(finish, HttpFinish::Suspended);
        assert!(temp.path().join("a.bin.part").exists());
    }
}
