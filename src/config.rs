use std::path::PathBuf;
use std::time::Duration;

use crate::db::queries::SettingsQueries;

pub const SETTING_MAX_PARALLEL: &str = "max_parallel_downloads";
pub const SETTING_INSTALL_DIR: &str = "install_dir";
pub const SETTING_DOWNLOAD_DIR: &str = "download_dir";

pub const DEFAULT_MAX_PARALLEL: usize = 3;
pub const DEFAULT_ARCHIVE_PASSWORD: &str = "online-fix.me";

pub(crate) fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

pub(crate) fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_string(key).map(|value| {
        value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

/// Reads the parallel download limit at call time; bad or missing values fall back to 3.
pub fn max_parallel_downloads(settings: &dyn SettingsQueries) -> usize {
    settings
        .get_setting(SETTING_MAX_PARALLEL)
        .ok()
        .flatten()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_PARALLEL)
}

#[derive(Clone, Debug)]
pub struct TorrentConfig {
    pub agent_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub startup_timeout: Duration,
    pub allow_fallback: bool,
    pub daemon_host: String,
    pub daemon_ports: Vec<u16>,
    pub daemon_username: Option<String>,
    pub daemon_password: Option<String>,
    pub max_status_failures: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            agent_path: None,
            poll_interval: Duration::from_millis(800),
            call_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(20),
            allow_fallback: false,
            daemon_host: "127.0.0.1".to_string(),
            daemon_ports: vec![9091, 9092, 9093],
            daemon_username: None,
            daemon_password: None,
            max_status_failures: 5,
        }
    }
}

impl TorrentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let daemon_ports = env_list("LAUNCHER_TORRENT_DAEMON_PORTS")
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.parse::<u16>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|ports| !ports.is_empty())
            .unwrap_or(defaults.daemon_ports);

        Self {
            agent_path: env_string("LAUNCHER_TORRENT_AGENT_PATH").map(PathBuf::from),
            poll_interval: env_usize("LAUNCHER_TORRENT_POLL_MS")
                .map(|value| Duration::from_millis(value.clamp(100, 10_000) as u64))
                .unwrap_or(defaults.poll_interval),
            call_timeout: env_usize("LAUNCHER_TORRENT_CALL_TIMEOUT")
                .map(|value| Duration::from_secs(value.clamp(2, 600) as u64))
                .unwrap_or(defaults.call_timeout),
            startup_timeout: env_usize("LAUNCHER_TORRENT_STARTUP_TIMEOUT")
                .map(|value| Duration::from_secs(value.clamp(2, 300) as u64))
                .unwrap_or(defaults.startup_timeout),
            allow_fallback: env_truthy("LAUNCHER_TORRENT_FALLBACK"),
            daemon_host: env_string("LAUNCHER_TORRENT_DAEMON_HOST").unwrap_or(defaults.daemon_host),
            daemon_ports,
            daemon_username: env_string("LAUNCHER_TORRENT_DAEMON_USER"),
            daemon_password: env_string("LAUNCHER_TORRENT_DAEMON_PASSWORD"),
            max_status_failures: env_usize("LAUNCHER_TORRENT_STATUS_FAILURES")
                .map(|value| value.clamp(1, 100))
                .unwrap_or(defaults.max_status_failures),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExtractorConfig {
    pub seven_zip_path: String,
    pub default_password: String,
    pub rar_fallback: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            seven_zip_path: "7z".to_string(),
            default_password: DEFAULT_ARCHIVE_PASSWORD.to_string(),
            rar_fallback: true,
        }
    }
}

impl ExtractorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            seven_zip_path: env_string("LAUNCHER_7Z_PATH").unwrap_or(defaults.seven_zip_path),
            default_password: env_string("LAUNCHER_ARCHIVE_PASSWORD")
                .unwrap_or(defaults.default_password),
            rar_fallback: !env_truthy("LAUNCHER_DISABLE_RAR_FALLBACK"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub stall_timeout: Duration,
    pub hard_timeout: Duration,
    pub max_restarts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(10 * 60),
            hard_timeout: Duration::from_secs(4 * 60 * 60),
            max_restarts: 1,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stall_timeout: env_usize("LAUNCHER_EXTRACT_STALL_MINUTES")
                .map(|value| Duration::from_secs(value.clamp(1, 240) as u64 * 60))
                .unwrap_or(defaults.stall_timeout),
            hard_timeout: env_usize("LAUNCHER_EXTRACT_MAX_MINUTES")
                .map(|value| Duration::from_secs(value.clamp(5, 24 * 60) as u64 * 60))
                .unwrap_or(defaults.hard_timeout),
            max_restarts: env_usize("LAUNCHER_EXTRACT_MAX_RESTARTS")
                .map(|value| value.clamp(0, 5) as u32)
                .unwrap_or(defaults.max_restarts),
        }
    }
}

/// Weights for picking the game executable. Only the relative ranking matters.
#[derive(Clone, Debug)]
pub struct ExecutableScoring {
    pub max_depth: usize,
    pub installer_penalty: i64,
    pub game_name_bonus: i64,
    pub folder_name_bonus: i64,
    pub shipping_binary_bonus: i64,
    pub shipping_name_bonus: i64,
    pub data_folder_bonus: i64,
    pub depth_step_bonus: i64,
    pub large_binary_bytes: u64,
    pub large_binary_bonus: i64,
    pub medium_binary_bytes: u64,
    pub medium_binary_bonus: i64,
    pub stub_binary_bytes: u64,
    pub stub_penalty: i64,
}

impl Default for ExecutableScoring {
    fn default() -> Self {
        Self {
            max_depth: 4,
            installer_penalty: 1000,
            game_name_bonus: 50,
            folder_name_bonus: 80,
            shipping_binary_bonus: 150,
            shipping_name_bonus: 100,
            data_folder_bonus: 120,
            depth_step_bonus: 10,
            large_binary_bytes: 50 * 1024 * 1024,
            large_binary_bonus: 40,
            medium_binary_bytes: 5 * 1024 * 1024,
            medium_binary_bonus: 20,
            stub_binary_bytes: 200 * 1024,
            stub_penalty: 60,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NormalizeConfig {
    /// Folders deleted after extraction (repair bundles, OS metadata).
    pub junk_dirs: Vec<String>,
    pub junk_files: Vec<String>,
    /// Folders never searched for executables or update archives.
    pub skip_dirs: Vec<String>,
    /// Folders whose RAR files belong to repair tooling, not to updates.
    pub repair_dirs: Vec<String>,
    pub preserved_configs: Vec<String>,
    pub dominance_ratio: usize,
    pub max_flatten_passes: usize,
    pub scoring: ExecutableScoring,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            junk_dirs: strings(&["Fix Repair", "__MACOSX"]),
            junk_files: strings(&[".DS_Store", "Thumbs.db", "desktop.ini"]),
            skip_dirs: strings(&[
                "_CommonRedist",
                "CommonRedist",
                "Redist",
                "Redistributables",
                "DirectX",
                "vcredist",
                "Installers",
                "__Installer",
                "Support",
                "Fix Repair",
                "__MACOSX",
            ]),
            repair_dirs: strings(&["Fix Repair"]),
            preserved_configs: strings(&["OnlineFix.ini"]),
            dominance_ratio: 2,
            max_flatten_passes: 4,
            scoring: ExecutableScoring::default(),
        }
    }
}

impl NormalizeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(items) = env_list("LAUNCHER_PRESERVED_CONFIGS") {
            config.preserved_configs = items;
        }
        if let Some(items) = env_list("LAUNCHER_JUNK_DIRS") {
            config.junk_dirs = items;
        }
        if let Some(ratio) = env_usize("LAUNCHER_DOMINANCE_RATIO") {
            config.dominance_ratio = ratio.clamp(1, 100);
        }
        if let Some(depth) = env_usize("LAUNCHER_EXE_SEARCH_DEPTH") {
            config.scoring.max_depth = depth.clamp(1, 12);
        }
        config
    }

    pub fn is_junk_dir(&self, name: &str) -> bool {
        self.junk_dirs.iter().any(|item| item.eq_ignore_ascii_case(name))
    }

    pub fn is_junk_file(&self, name: &str) -> bool {
        self.junk_files.iter().any(|item| item.eq_ignore_ascii_case(name))
    }

    pub fn is_skipped_dir(&self, name: &str) -> bool {
        self.skip_dirs.iter().any(|item| item.eq_ignore_ascii_case(name))
    }

    pub fn is_repair_dir(&self, name: &str) -> bool {
        self.repair_dirs.iter().any(|item| item.eq_ignore_ascii_case(name))
    }
}

#[derive(Clone, Debug)]
pub struct ProgressPersistConfig {
    pub min_interval: Duration,
    pub min_delta: f64,
}

impl Default for ProgressPersistConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            min_delta: 1.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy: Option<String>,
    pub disable_system_proxy: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(6 * 60 * 60),
            connect_timeout: Duration::from_secs(20),
            proxy: None,
            disable_system_proxy: false,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_usize("LAUNCHER_HTTP_TIMEOUT_SECONDS")
                .map(|value| Duration::from_secs(value.clamp(60, 24 * 3600) as u64))
                .unwrap_or(defaults.request_timeout),
            connect_timeout: env_usize("LAUNCHER_HTTP_CONNECT_TIMEOUT_SECONDS")
                .map(|value| Duration::from_secs(value.clamp(5, 120) as u64))
                .unwrap_or(defaults.connect_timeout),
            proxy: env_string("LAUNCHER_PROXY"),
            disable_system_proxy: env_truthy("LAUNCHER_DISABLE_SYSTEM_PROXY"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LauncherConfig {
    pub torrent: TorrentConfig,
    pub extractor: ExtractorConfig,
    pub supervisor: SupervisorConfig,
    pub normalize: NormalizeConfig,
    pub progress: ProgressPersistConfig,
    pub http: HttpConfig,
    pub keep_archives: bool,
}

impl LauncherConfig {
    pub fn from_env() -> Self {
        Self {
            torrent: TorrentConfig::from_env(),
            extractor: ExtractorConfig::from_env(),
            supervisor: SupervisorConfig::from_env(),
            normalize: NormalizeConfig::from_env(),
            progress: ProgressPersistConfig::default(),
            http: HttpConfig::from_env(),
            keep_archives: env_truthy("LAUNCHER_KEEP_ARCHIVES"),
        }
    }
}
