use std::path::{Path, PathBuf};

use crate::config::{SETTING_DOWNLOAD_DIR, SETTING_INSTALL_DIR};
use crate::db::queries::SettingsQueries;

const APP_DIR_NAME: &str = "launcher";

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(&PathBuf::from(trimmed))
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
}

pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = env_dir("LAUNCHER_ROOT_DIR") {
        return dir;
    }

    if let Some(dir) = exe_dir() {
        if is_portable_root(&dir) {
            return dir;
        }
    }

    if let Some(local) = dirs::data_local_dir() {
        if let Some(found) = ensure_dir(&local.join(APP_DIR_NAME)) {
            return found;
        }
    }

    if let Some(data) = dirs::data_dir() {
        if let Some(found) = ensure_dir(&data.join(APP_DIR_NAME)) {
            return found;
        }
    }

    PathBuf::from(".")
}

pub fn resolve_cache_dir() -> PathBuf {
    let root = resolve_root_dir();
    let candidates = [root.join("cached"), root.join("cache")];
    for candidate in candidates {
        if let Some(dir) = ensure_dir(&candidate) {
            return dir;
        }
    }
    PathBuf::from("cache")
}

pub fn resolve_log_dir() -> PathBuf {
    if let Some(dir) = env_dir("LAUNCHER_LOG_DIR") {
        return dir;
    }

    let root = resolve_root_dir();
    if let Some(found) = ensure_dir(&root.join("logs")) {
        return found;
    }

    if let Some(dir) = exe_dir() {
        if let Some(found) = ensure_dir(&dir.join("logs")) {
            return found;
        }
    }

    PathBuf::from("logs")
}

fn setting_dir(settings: &dyn SettingsQueries, key: &str) -> Option<PathBuf> {
    settings
        .get_setting(key)
        .ok()
        .flatten()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .and_then(|value| ensure_dir(&PathBuf::from(value)))
}

/// Base directory games are installed into. The settings value wins when it is usable.
pub fn resolve_games_dir(settings: &dyn SettingsQueries) -> PathBuf {
    if let Some(dir) = setting_dir(settings, SETTING_INSTALL_DIR) {
        return dir;
    }
    let fallback = resolve_root_dir().join("games");
    ensure_dir(&fallback).unwrap_or(fallback)
}

/// Staging directory for archives and torrent payloads.
pub fn resolve_downloads_dir(settings: &dyn SettingsQueries) -> PathBuf {
    if let Some(dir) = setting_dir(settings, SETTING_DOWNLOAD_DIR) {
        return dir;
    }
    let fallback = resolve_root_dir().join("downloads");
    ensure_dir(&fallback).unwrap_or(fallback)
}

/// Turns a display title into a folder name that is valid on every platform.
pub fn sanitize_dir_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => ' ',
            ch if ch.is_control() => ' ',
            ch => ch,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches('.').trim().to_string();
    if trimmed.is_empty() {
        "game".to_string()
    } else {
        trimmed
    }
}
