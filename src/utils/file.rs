use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub const INSTALL_MARKER_FILE: &str = ".launcher-install.json";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallMarkerKind {
    Install,
    Update,
}

/// Left at the install root while an extraction or update is running.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstallMarker {
    pub kind: InstallMarkerKind,
    pub download_id: Option<String>,
    pub archive: Option<String>,
    pub started_at: i64,
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

pub fn write_install_marker(install_root: &Path, marker: &InstallMarker) -> Result<()> {
    let payload = serde_json::to_vec_pretty(marker)?;
    write_atomic(&install_root.join(INSTALL_MARKER_FILE), &payload)?;
    Ok(())
}

pub fn read_install_marker(install_root: &Path) -> Option<InstallMarker> {
    let raw = fs::read(install_root.join(INSTALL_MARKER_FILE)).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Best-effort; a marker that cannot be removed is only logged.
pub fn clear_install_marker(install_root: &Path) {
    let path = install_root.join(INSTALL_MARKER_FILE);
    if !path.exists() {
        return;
    }
    if let Err(err) = fs::remove_file(&path) {
        tracing::warn!("failed to remove install marker {}: {}", path.display(), err);
    }
}

/// True when the directory holds nothing, or only entries accepted by `ignorable`.
pub fn dir_is_effectively_empty(path: &Path, ignorable: impl Fn(&Path) -> bool) -> bool {
    match fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .all(|entry| ignorable(&entry.path())),
        Err(_) => false,
    }
}

pub fn remove_path_best_effort(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return;
    };
    if let Err(err) = result {
        tracing::warn!("cleanup skipped for {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_marker_round_trips_and_clears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = InstallMarker {
            kind: InstallMarkerKind::Update,
            download_id: None,
            archive: Some("patch.part01.rar".to_string()),
            started_at: 42,
        };
        write_install_marker(temp.path(), &marker).expect("write marker");

        let stored = read_install_marker(temp.path()).expect("marker");
        assert_eq!(stored.kind, InstallMarkerKind::Update);
        assert_eq!(stored.archive.as_deref(), Some("patch.part01.rar"));

        clear_install_marker(temp.path());
        assert!(read_install_marker(temp.path()).is_none());
    }

    #[test]
    fn marker_write_creates_missing_root_and_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("games/Fresh");
        let marker = InstallMarker {
            kind: InstallMarkerKind::Install,
            download_id: Some("d1".to_string()),
            archive: None,
            started_at: 7,
        };
        write_install_marker(&root, &marker).expect("write marker");

        assert!(root.join(INSTALL_MARKER_FILE).is_file());
        assert!(!root.join(INSTALL_MARKER_FILE).with_extension("tmp").exists());
        assert_eq!(read_install_marker(&root).map(|m| m.started_at), Some(7));
    }
}
