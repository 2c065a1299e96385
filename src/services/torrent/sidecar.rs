use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::config::{env_string, TorrentConfig};
use crate::errors::{LauncherError, Result};
use crate::services::torrent::{EngineInfo, TorrentEngine, TorrentStatus};
use crate::utils::process::{hide_console_window, trim_text_snippet};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type ConnectionSlot = Arc<Mutex<Option<Arc<AgentConnection>>>>;

#[cfg(target_os = "windows")]
const AGENT_BINARY: &str = "torrent-agent.exe";
#[cfg(not(target_os = "windows"))]
const AGENT_BINARY: &str = "torrent-agent";
const AGENT_SCRIPT: &str = "libtorrent_rpc.py";

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

#[derive(Deserialize)]
struct RawAgentLine {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RpcFailure {
    pub message: String,
    pub code: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AgentMessage {
    Reply {
        id: u64,
        outcome: std::result::Result<Value, RpcFailure>,
    },
    Fatal {
        message: String,
        detail: Option<String>,
    },
    Event {
        name: String,
    },
    /// A reply whose id could not be read; nobody can be waiting for it.
    Orphan,
}

pub(crate) fn encode_request(id: u64, method: &str, params: &Value) -> Result<String> {
    let mut line = serde_json::to_string(&RpcRequest { id, method, params })?;
    line.push('\n');
    Ok(line)
}

pub(crate) fn decode_line(line: &str) -> Result<AgentMessage> {
    let raw: RawAgentLine = serde_json::from_str(line).map_err(|err| {
        LauncherError::Protocol(format!(
            "malformed agent line ({}): {}",
            err,
            trim_text_snippet(line, 120)
        ))
    })?;

    if let Some(event) = raw.event {
        if event.eq_ignore_ascii_case("fatal") {
            return Ok(AgentMessage::Fatal {
                message: raw
                    .message
                    .unwrap_or_else(|| "torrent agent reported a fatal error".to_string()),
                detail: raw.detail,
            });
        }
        return Ok(AgentMessage::Event { name: event });
    }

    let id = raw.id.as_ref().and_then(|value| {
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|text| text.parse::<u64>().ok()))
    });
    let Some(id) = id else {
        return Ok(AgentMessage::Orphan);
    };

    let outcome = match raw.error {
        Some(error) => Err(RpcFailure {
            message: if error.message.is_empty() {
                "unknown agent error".to_string()
            } else {
                error.message
            },
            code: error.code,
        }),
        None => Ok(raw.result.unwrap_or(Value::Null)),
    };
    Ok(AgentMessage::Reply { id, outcome })
}

/// How to launch the agent: a native binary, or the python script through an interpreter.
#[derive(Clone, Debug)]
pub struct AgentLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl AgentLaunch {
    pub fn from_path(path: &Path) -> Self {
        let is_script = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("py"))
            .unwrap_or(false);
        if is_script {
            let python = env_string("LAUNCHER_PYTHON").unwrap_or_else(|| {
                if cfg!(target_os = "windows") {
                    "python".to_string()
                } else {
                    "python3".to_string()
                }
            });
            return Self {
                program: PathBuf::from(python),
                args: vec!["-u".to_string(), path.to_string_lossy().to_string()],
            };
        }
        Self {
            program: path.to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn resolve(config: &TorrentConfig) -> Option<Self> {
        if let Some(path) = &config.agent_path {
            return Some(Self::from_path(path));
        }

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))?;
        let candidates = [
            exe_dir.join(AGENT_BINARY),
            exe_dir.join("resources").join(AGENT_BINARY),
            exe_dir.join("torrent-agent").join(AGENT_BINARY),
            exe_dir.join("torrent-agent").join(AGENT_SCRIPT),
            exe_dir.join("resources").join("torrent-agent").join(AGENT_SCRIPT),
        ];
        candidates
            .iter()
            .find(|candidate| candidate.is_file())
            .map(|candidate| Self::from_path(candidate))
    }
}

struct AgentConnection {
    generation: u64,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    child: Mutex<Option<Child>>,
    fatal: Mutex<Option<String>>,
}

impl AgentConnection {
    async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }

    fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }

    fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().ok().and_then(|guard| guard.clone())
    }

    fn forget(&self, id: u64) {
        if let Ok(mut guard) = self.pending.lock() {
            guard.remove(&id);
        }
    }
}

fn fail_pending(pending: &PendingMap, make_error: impl Fn() -> LauncherError) {
    let waiters: Vec<_> = match pending.lock() {
        Ok(mut guard) => guard.drain().map(|(_, tx)| tx).collect(),
        Err(_) => return,
    };
    for tx in waiters {
        let _ = tx.send(Err(make_error()));
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            tracing::debug!(target: "torrent_agent", "{}", trimmed);
        }
    }
}

async fn read_agent_output(stdout: ChildStdout, conn: Arc<AgentConnection>, slot: ConnectionSlot) {
    let mut lines = BufReader::new(stdout).lines();
    let mut exit_reason = "torrent agent closed its output".to_string();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                exit_reason = format!("failed to read torrent agent output: {}", err);
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match decode_line(trimmed) {
            Ok(AgentMessage::Reply { id, outcome }) => {
                let waiter = conn.pending.lock().ok().and_then(|mut guard| guard.remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(|failure| LauncherError::Engine {
                            message: failure.message,
                            code: failure.code,
                        }));
                    }
                    None => tracing::debug!("dropping unmatched torrent agent reply {}", id),
                }
            }
            Ok(AgentMessage::Fatal { message, detail }) => {
                let reason = match detail {
                    Some(detail) if !detail.trim().is_empty() => {
                        format!("{}: {}", message, detail.trim())
                    }
                    _ => message,
                };
                tracing::error!("torrent agent fatal: {}", reason);
                if let Ok(mut guard) = conn.fatal.lock() {
                    *guard = Some(reason.clone());
                }
                fail_pending(&conn.pending, || LauncherError::EngineUnavailable(reason.clone()));
                conn.kill();
                exit_reason = reason;
                break;
            }
            Ok(AgentMessage::Event { name }) => {
                tracing::debug!("torrent agent event: {}", name);
            }
            Ok(AgentMessage::Orphan) => {
                tracing::debug!("dropping torrent agent reply without id");
            }
            Err(err) => tracing::warn!("{}", err),
        }
    }

    fail_pending(&conn.pending, || LauncherError::EngineExited(exit_reason.clone()));

    if let Ok(mut guard) = slot.lock() {
        if guard.as_ref().map(|current| current.generation) == Some(conn.generation) {
            *guard = None;
        }
    }

    let child = conn.child.lock().ok().and_then(|mut guard| guard.take());
    if let Some(mut child) = child {
        match child.wait().await {
            Ok(status) => tracing::info!("torrent agent exited with {}", status),
            Err(err) => tracing::warn!("failed to reap torrent agent: {}", err),
        }
    }
}

/// Primary engine: one long-lived agent process spoken to with line-delimited JSON.
pub struct SidecarEngine {
    config: TorrentConfig,
    launch: Option<AgentLaunch>,
    connection: ConnectionSlot,
    startup: tokio::sync::Mutex<()>,
    attempts: AtomicU64,
    last_failure: Mutex<Option<String>>,
    next_id: AtomicU64,
    generation: AtomicU64,
}

impl SidecarEngine {
    pub fn new(config: TorrentConfig) -> Self {
        Self {
            config,
            launch: None,
            connection: Arc::new(Mutex::new(None)),
            startup: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_launch(config: TorrentConfig, launch: AgentLaunch) -> Self {
        let mut engine = Self::new(config);
        engine.launch = Some(launch);
        engine
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    pub fn shutdown(&self) {
        let current = self.connection.lock().ok().and_then(|mut guard| guard.take());
        if let Some(conn) = current {
            conn.kill();
        }
    }

    fn current(&self) -> Option<Arc<AgentConnection>> {
        self.connection.lock().ok().and_then(|guard| guard.clone())
    }

    fn remember_failure(&self, reason: Option<String>) {
        if let Ok(mut guard) = self.last_failure.lock() {
            *guard = reason;
        }
    }

    async fn launch_agent(&self) -> Result<Arc<AgentConnection>> {
        let launch = self
            .launch
            .clone()
            .or_else(|| AgentLaunch::resolve(&self.config))
            .ok_or_else(|| {
                LauncherError::EngineUnavailable("torrent agent binary not found".to_string())
            })?;

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut command);

        tracing::info!(
            "starting torrent agent: {} {}",
            launch.program.display(),
            launch.args.join(" ")
        );
        let mut child = command.spawn().map_err(|err| {
            LauncherError::EngineUnavailable(format!(
                "failed to spawn {}: {}",
                launch.program.display(),
                err
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            LauncherError::EngineUnavailable("torrent agent stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            LauncherError::EngineUnavailable("torrent agent stdout unavailable".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let conn = Arc::new(AgentConnection {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Arc::new(Mutex::new(HashMap::new())),
            child: Mutex::new(Some(child)),
            fatal: Mutex::new(None),
        });
        tokio::spawn(read_agent_output(
            stdout,
            conn.clone(),
            self.connection.clone(),
        ));

        match self
            .call_on(&conn, "ping", json!({}), self.config.startup_timeout)
            .await
        {
            Ok(reply) => {
                let version = reply.get("libtorrent").and_then(|value| value.as_str());
                tracing::info!(
                    "torrent agent ready (libtorrent {})",
                    version.unwrap_or("unknown")
                );
                Ok(conn)
            }
            Err(err) => {
                // A fatal line can race our first write; give the reader a moment to report it.
                for _ in 0..10 {
                    if conn.fatal_reason().is_some() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                conn.kill();
                match conn.fatal_reason() {
                    Some(reason) => Err(LauncherError::EngineUnavailable(reason)),
                    None => Err(err),
                }
            }
        }
    }

    async fn call_on(
        &self,
        conn: &AgentConnection,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = encode_request(id, method, &params)?;
        let (tx, rx) = oneshot::channel();
        conn.pending
            .lock()
            .map_err(|_| LauncherError::Config("torrent agent pending map poisoned".to_string()))?
            .insert(id, tx);

        if let Err(err) = conn.send_line(&line).await {
            conn.forget(id);
            return Err(LauncherError::EngineExited(format!(
                "failed to write to torrent agent: {}",
                err
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(LauncherError::EngineExited(
                "torrent agent dropped the request".to_string(),
            )),
            Err(_) => {
                conn.forget(id);
                Err(LauncherError::Protocol(format!(
                    "{} timed out after {}s",
                    method,
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.start().await?;
        let conn = self.current().ok_or_else(|| {
            LauncherError::EngineExited("torrent agent is not running".to_string())
        })?;
        self.call_on(&conn, method, params, self.config.call_timeout)
            .await
    }
}

impl Drop for SidecarEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl TorrentEngine for SidecarEngine {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    async fn start(&self) -> Result<()> {
        if self.current().is_some() {
            return Ok(());
        }
        let seen = self.attempts.load(Ordering::SeqCst);
        let _guard = self.startup.lock().await;
        if self.current().is_some() {
            return Ok(());
        }
        if self.attempts.load(Ordering::SeqCst) != seen {
            // Someone else's attempt failed while we waited; share its outcome.
            let previous = self.last_failure.lock().ok().and_then(|guard| guard.clone());
            if let Some(reason) = previous {
                return Err(LauncherError::EngineUnavailable(reason));
            }
        }

        let outcome = self.launch_agent().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match outcome {
            Ok(conn) => {
                self.remember_failure(None);
                let mut guard = self
                    .connection
                    .lock()
                    .map_err(|_| LauncherError::Config("torrent agent slot poisoned".to_string()))?;
                *guard = Some(conn);
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    LauncherError::EngineUnavailable(reason) => {
                        LauncherError::EngineUnavailable(reason)
                    }
                    other => LauncherError::EngineUnavailable(other.to_string()),
                };
                self.remember_failure(Some(err.to_string()));
                tracing::warn!("torrent agent failed to start: {}", err);
                Err(err)
            }
        }
    }

    async fn ping(&self) -> Result<EngineInfo> {
        let reply = self.call("ping", json!({})).await?;
        Ok(EngineInfo {
            engine: self.name(),
            version: reply
                .get("libtorrent")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string()),
        })
    }

    async fn add(&self, source: &str, save_path: &Path) -> Result<String> {
        let reply = self
            .call(
                "add",
                json!({ "source": source, "savePath": save_path.to_string_lossy() }),
            )
            .await?;
        reply
            .get("infoHash")
            .and_then(|value| value.as_str())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| LauncherError::Protocol("add returned no infoHash".to_string()))
    }

    async fn status(&self, torrent_id: &str) -> Result<TorrentStatus> {
        let reply = self.call("status", json!({ "torrentId": torrent_id })).await?;
        serde_json::from_value(reply)
            .map_err(|err| LauncherError::Protocol(format!("bad status payload: {}", err)))
    }

    async fn pause(&self, torrent_id: &str) -> Result<()> {
        self.call("pause", json!({ "torrentId": torrent_id })).await?;
        Ok(())
    }

    async fn resume(&self, torrent_id: &str) -> Result<()> {
        self.call("resume", json!({ "torrentId": torrent_id })).await?;
        Ok(())
    }

    async fn remove(&self, torrent_id: &str, delete_files: bool) -> Result<()> {
        self.call(
            "remove",
            json!({ "torrentId": torrent_id, "deleteFiles": delete_files }),
        )
        .await?;
        Ok(())
    }
}
