use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::config::TorrentConfig;
use crate::errors::{LauncherError, Result};
use crate::services::torrent::{is_magnet, EngineInfo, TorrentEngine, TorrentStatus};
use crate::utils::process::trim_text_snippet;

const SESSION_HEADER: &str = "X-Transmission-Session-Id";
const RPC_PATH: &str = "/transmission/rpc";
const STATUS_FIELDS: [&str; 12] = [
    "hashString",
    "percentDone",
    "rateDownload",
    "eta",
    "peersConnected",
    "peersSendingToUs",
    "sizeWhenDone",
    "leftUntilDone",
    "isFinished",
    "status",
    "metadataPercentComplete",
    "errorString",
];

/// Fallback engine: a Transmission-compatible daemon on a local port.
pub struct DaemonEngine {
    client: reqwest::Client,
    config: TorrentConfig,
    endpoint: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
    startup: tokio::sync::Mutex<()>,
}

impl DaemonEngine {
    pub fn new(config: TorrentConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .connect_timeout(Duration::from_secs(3))
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            config,
            endpoint: Mutex::new(None),
            session_id: Mutex::new(None),
            startup: tokio::sync::Mutex::new(()),
        }
    }

    fn candidate_urls(&self) -> Vec<String> {
        self.config
            .daemon_ports
            .iter()
            .map(|port| format!("http://{}:{}{}", self.config.daemon_host, port, RPC_PATH))
            .collect()
    }

    fn endpoint(&self) -> Option<String> {
        self.endpoint.lock().ok().and_then(|guard| guard.clone())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_session_id(&self, value: Option<String>) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = value;
        }
    }

    async fn rpc_at(&self, url: &str, method: &str, arguments: Value) -> Result<Value> {
        let body = json!({ "method": method, "arguments": arguments });

        // One retry: a 409 hands us the session token to use.
        for _ in 0..2 {
            let mut request = self.client.post(url).json(&body);
            if let Some(token) = self.session_id() {
                request = request.header(SESSION_HEADER, token);
            }
            if let Some(user) = &self.config.daemon_username {
                request = request.basic_auth(user, self.config.daemon_password.as_ref());
            }

            let response = request.send().await?;
            if response.status() == reqwest::StatusCode::CONFLICT {
                let token = response
                    .headers()
                    .get(SESSION_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.to_string());
                if token.is_none() {
                    return Err(LauncherError::Protocol(
                        "daemon returned 409 without a session id".to_string(),
                    ));
                }
                tracing::debug!("torrent daemon issued a new session id");
                self.set_session_id(token);
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(LauncherError::Http(format!(
                    "torrent daemon returned {}: {}",
                    status,
                    trim_text_snippet(&text, 200)
                )));
            }

            let payload: Value = response.json().await?;
            let result = payload
                .get("result")
                .and_then(|value| value.as_str())
                .unwrap_or("missing result");
            if result != "success" {
                return Err(LauncherError::Engine {
                    message: result.to_string(),
                    code: None,
                });
            }
            return Ok(payload.get("arguments").cloned().unwrap_or(Value::Null));
        }

        Err(LauncherError::Protocol(
            "torrent daemon kept rejecting the session id".to_string(),
        ))
    }

    async fn rpc(&self, method: &str, arguments: Value) -> Result<Value> {
        self.start().await?;
        let url = self.endpoint().ok_or_else(|| {
            LauncherError::EngineUnavailable("torrent daemon endpoint unknown".to_string())
        })?;
        self.rpc_at(&url, method, arguments).await
    }
}

fn added_hash(arguments: &Value) -> Option<String> {
    ["torrent-added", "torrent-duplicate"]
        .iter()
        .filter_map(|key| arguments.get(*key))
        .find_map(|torrent| torrent.get("hashString").and_then(|value| value.as_str()))
        .map(|value| value.to_ascii_lowercase())
}

fn daemon_state(code: i64) -> &'static str {
    match code {
        0 => "stopped",
        1 => "check_pending",
        2 => "checking",
        3 => "download_pending",
        4 => "downloading",
        5 => "seed_pending",
        6 => "seeding",
        _ => "unknown",
    }
}

pub(crate) fn status_from_daemon(torrent: &Value) -> Result<TorrentStatus> {
    if let Some(error) = torrent
        .get("errorString")
        .and_then(|value| value.as_str())
        .filter(|value| !value.trim().is_empty())
    {
        tracing::debug!("torrent daemon reports: {}", error);
    }

    let number = |key: &str| torrent.get(key).and_then(|value| value.as_f64()).unwrap_or(0.0);
    let size = number("sizeWhenDone").max(0.0) as u64;
    let left = number("leftUntilDone").max(0.0) as u64;
    let has_metadata = number("metadataPercentComplete") >= 1.0;
    let eta = torrent.get("eta").and_then(|value| value.as_i64()).filter(|value| *value >= 0);

    Ok(TorrentStatus {
        info_hash: torrent
            .get("hashString")
            .and_then(|value| value.as_str())
            .map(|value| value.to_ascii_lowercase()),
        progress: (number("percentDone") * 100.0).clamp(0.0, 100.0),
        total_done: size.saturating_sub(left),
        total_wanted: size,
        download_rate: number("rateDownload").max(0.0) as u64,
        eta,
        peers: number("peersConnected") as u32,
        seeds: number("peersSendingToUs") as u32,
        state: torrent
            .get("status")
            .and_then(|value| value.as_i64())
            .map(|code| daemon_state(code).to_string()),
        is_finished: torrent
            .get("isFinished")
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
            || (has_metadata && size > 0 && left == 0),
        has_metadata,
    })
}

#[async_trait]
impl TorrentEngine for DaemonEngine {
    fn name(&self) -> &'static str {
        "daemon"
    }

    async fn start(&self) -> Result<()> {
        if self.endpoint().is_some() {
            return Ok(());
        }
        let _guard = self.startup.lock().await;
        if self.endpoint().is_some() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for url in self.candidate_urls() {
            match self.rpc_at(&url, "session-get", json!({})).await {
                Ok(session) => {
                    let version = session
                        .get("version")
                        .and_then(|value| value.as_str())
                        .unwrap_or("unknown");
                    tracing::info!("using torrent daemon at {} (version {})", url, version);
                    if let Ok(mut guard) = self.endpoint.lock() {
                        *guard = Some(url);
                    }
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!("torrent daemon candidate {} unreachable: {}", url, err);
                    failures.push(format!("{}: {}", url, err));
                }
            }
        }

        Err(LauncherError::EngineUnavailable(format!(
            "no torrent daemon reachable ({})",
            failures.join("; ")
        )))
    }

    async fn ping(&self) -> Result<EngineInfo> {
        let session = self.rpc("session-get", json!({})).await?;
        Ok(EngineInfo {
            engine: self.name(),
            version: session
                .get("version")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string()),
        })
    }

    async fn add(&self, source: &str, save_path: &Path) -> Result<String> {
        let mut arguments = json!({
            "download-dir": save_path.to_string_lossy(),
            "paused": false,
        });
        let local = Path::new(source);
        if !is_magnet(source) && local.is_file() {
            let bytes = tokio::fs::read(local).await?;
            arguments["metainfo"] = Value::String(base64::engine::general_purpose::STANDARD.encode(bytes));
        } else {
            arguments["filename"] = Value::String(source.to_string());
        }

        let reply = self.rpc("torrent-add", arguments).await?;
        added_hash(&reply)
            .ok_or_else(|| LauncherError::Protocol("torrent-add returned no hashString".to_string()))
    }

    async fn status(&self, torrent_id: &str) -> Result<TorrentStatus> {
        let reply = self
            .rpc(
                "torrent-get",
                json!({ "ids": [torrent_id], "fields": STATUS_FIELDS }),
            )
            .await?;
        let torrent = reply
            .get("torrents")
            .and_then(|value| value.as_array())
            .and_then(|items| items.first())
            .ok_or_else(|| LauncherError::Engine {
                message: "torrent not found".to_string(),
                code: None,
            })?;
        status_from_daemon(torrent)
    }

    async fn pause(&self, torrent_id: &str) -> Result<()> {
        self.rpc("torrent-stop", json!({ "ids": [torrent_id] })).await?;
        Ok(())
    }

    async fn resume(&self, torrent_id: &str) -> Result<()> {
        self.rpc("torrent-start", json!({ "ids": [torrent_id] })).await?;
        Ok(())
    }

    async fn remove(&self, torrent_id: &str, delete_files: bool) -> Result<()> {
        self.rpc(
            "torrent-remove",
            json!({ "ids": [torrent_id], "delete-local-data": delete_files }),
        )
        .await?;
        Ok(())
    }
}
