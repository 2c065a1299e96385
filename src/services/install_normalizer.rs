use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::NormalizeConfig;
use crate::errors::Result;
use crate::utils::file::INSTALL_MARKER_FILE;

const INSTALLER_PATTERNS: &[&str] = &[
    "unins",
    "setup",
    "install",
    "redist",
    "vcredist",
    "vc_redist",
    "dxsetup",
    "dxwebsetup",
    "directx",
    "dotnet",
    "ndp4",
    "prereq",
    "crashreport",
    "crashhandler",
    "uploader",
    "easyanticheat_setup",
    "be_setup",
];

const GAME_NAME_PATTERNS: &[&str] = &["game", "launcher", "play", "start"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub collapsed: usize,
    pub flattened: usize,
    pub junk_removed: usize,
}

impl NormalizeReport {
    pub fn changed(&self) -> bool {
        self.collapsed + self.flattened + self.junk_removed > 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutableCandidate {
    pub path: PathBuf,
    pub score: i64,
}

fn lower_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn is_exe(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

fn alnum_lower(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

#[derive(Clone)]
pub struct InstallNormalizer {
    config: NormalizeConfig,
}

impl InstallNormalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizeConfig {
        &self.config
    }

    fn is_ignorable(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|name| name.to_string_lossy().to_string()) else {
            return true;
        };
        if name == INSTALL_MARKER_FILE || name.starts_with(".flatten-") {
            return true;
        }
        if path.is_dir() {
            self.config.is_junk_dir(&name)
        } else {
            self.config.is_junk_file(&name)
        }
    }

    fn meaningful_entries(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !self.is_ignorable(&path) {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn count_files(&self, dir: &Path) -> usize {
        WalkDir::new(dir)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_ignorable(entry.path()))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count()
    }

    fn has_top_level_exe(&self, dir: &Path) -> bool {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .any(|entry| entry.path().is_file() && is_exe(&entry.path()))
            })
            .unwrap_or(false)
    }

    /// Runs collapse and dominant-folder flatten to a fixpoint, then drops junk.
    pub fn normalize(&self, root: &Path) -> Result<NormalizeReport> {
        let mut report = NormalizeReport::default();
        if !root.is_dir() {
            return Ok(report);
        }

        for _ in 0..self.config.max_flatten_passes.max(1) {
            if self.collapse_single_child(root)? {
                report.collapsed += 1;
                continue;
            }
            if self.flatten_dominant_child(root)? {
                report.flattened += 1;
                continue;
            }
            break;
        }
        report.junk_removed = self.remove_junk(root)?;

        if report.changed() {
            tracing::info!(
                "normalized {} (collapsed {}, flattened {}, junk removed {})",
                root.display(),
                report.collapsed,
                report.flattened,
                report.junk_removed
            );
        }
        Ok(report)
    }

    fn collapse_single_child(&self, root: &Path) -> Result<bool> {
        let entries = self.meaningful_entries(root)?;
        match entries.as_slice() {
            [only] if only.is_dir() => {
                tracing::debug!("collapsing wrapper folder {}", only.display());
                merge_into_parent(root, only)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// A subfolder that holds most of the files and a top-level executable is the real
    /// game root. "Most" means the child's file count is at least `dominance_ratio` times
    /// the count of everything else (total minus the child), and the install root itself
    /// must not already hold an executable.
    fn flatten_dominant_child(&self, root: &Path) -> Result<bool> {
        if self.has_top_level_exe(root) {
            return Ok(false);
        }
        let entries = self.meaningful_entries(root)?;
        let mut direct_files = 0usize;
        let mut folders = Vec::new();
        for entry in &entries {
            if entry.is_dir() {
                folders.push((entry.clone(), self.count_files(entry)));
            } else {
                direct_files += 1;
            }
        }
        if folders.len() < 2 && direct_files == 0 {
            return Ok(false);
        }

        let total: usize = direct_files + folders.iter().map(|(_, count)| count).sum::<usize>();
        let Some((dominant, count)) = folders
            .iter()
            .fold(None::<&(PathBuf, usize)>, |best, candidate| match best {
                Some(current) if current.1 >= candidate.1 => Some(current),
                _ => Some(candidate),
            })
            .cloned()
        else {
            return Ok(false);
        };

        let rest = total - count;
        let ratio = self.config.dominance_ratio.max(1);
        if count == 0 || count < rest.saturating_mul(ratio) || !self.has_top_level_exe(&dominant) {
            return Ok(false);
        }

        tracing::debug!(
            "flattening dominant folder {} ({} of {} files)",
            dominant.display(),
            count,
            total
        );
        merge_into_parent(root, &dominant)?;
        Ok(true)
    }

    /// Deletes junk folders and files anywhere under `root`.
    pub fn remove_junk(&self, root: &Path) -> Result<usize> {
        let mut junk = Vec::new();
        let mut walker = WalkDir::new(root).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().is_dir() {
                if self.config.is_junk_dir(&name) {
                    junk.push(entry.path().to_path_buf());
                    walker.skip_current_dir();
                }
            } else if self.config.is_junk_file(&name) {
                junk.push(entry.path().to_path_buf());
            }
        }

        let mut removed = 0;
        for path in junk {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!("failed to remove junk {}: {}", path.display(), err),
            }
        }
        Ok(removed)
    }

    pub fn score_executable(&self, root: &Path, path: &Path, size: u64, depth: usize) -> i64 {
        let scoring = &self.config.scoring;
        let file_name = lower_name(path);
        let stem = file_name.trim_end_matches(".exe").to_string();
        let mut score = 0i64;

        if INSTALLER_PATTERNS.iter().any(|pattern| stem.contains(pattern)) {
            score -= scoring.installer_penalty;
        }
        if GAME_NAME_PATTERNS.iter().any(|pattern| stem.contains(pattern)) {
            score += scoring.game_name_bonus;
        }

        let folder = root
            .file_name()
            .map(|name| alnum_lower(&name.to_string_lossy()))
            .unwrap_or_default();
        let compact_stem = alnum_lower(&stem);
        if !folder.is_empty()
            && !compact_stem.is_empty()
            && (folder.contains(&compact_stem) || compact_stem.contains(&folder))
        {
            score += scoring.folder_name_bonus;
        }

        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
            .to_ascii_lowercase();
        if stem.ends_with("-win64-shipping") && relative.contains("binaries/win64/") {
            score += scoring.shipping_binary_bonus;
        } else if stem.contains("shipping") {
            score += scoring.shipping_name_bonus;
        }

        if let Some(parent) = path.parent() {
            let original_stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default();
            if parent.join(format!("{}_Data", original_stem)).is_dir() {
                score += scoring.data_folder_bonus;
            }
        }

        let remaining_depth = scoring.max_depth.saturating_sub(depth) as i64;
        score += remaining_depth * scoring.depth_step_bonus;

        if size >= scoring.large_binary_bytes {
            score += scoring.large_binary_bonus;
        } else if size >= scoring.medium_binary_bytes {
            score += scoring.medium_binary_bonus;
        } else if size < scoring.stub_binary_bytes {
            score -= scoring.stub_penalty;
        }
        score
    }

    pub fn executable_candidates(&self, root: &Path) -> Vec<ExecutableCandidate> {
        let walker = WalkDir::new(root)
            .max_depth(self.config.scoring.max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !self
                        .config
                        .is_skipped_dir(&entry.file_name().to_string_lossy())
            });

        walker
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_exe(entry.path()))
            .map(|entry| {
                let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
                ExecutableCandidate {
                    score: self.score_executable(root, entry.path(), size, entry.depth()),
                    path: entry.into_path(),
                }
            })
            .collect()
    }

    /// Highest score wins; ties keep the first candidate in walk order.
    pub fn find_executable(&self, root: &Path) -> Option<PathBuf> {
        let mut best: Option<ExecutableCandidate> = None;
        for candidate in self.executable_candidates(root) {
            let better = best
                .as_ref()
                .map(|current| candidate.score > current.score)
                .unwrap_or(true);
            if better {
                best = Some(candidate);
            }
        }
        best.map(|candidate| candidate.path)
    }

    /// First preserved config file (e.g. `OnlineFix.ini`) outside repair folders.
    pub fn find_preserved_config(&self, root: &Path) -> Option<PathBuf> {
        WalkDir::new(root)
            .max_depth(8)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !self
                        .config
                        .is_repair_dir(&entry.file_name().to_string_lossy())
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .find(|entry| {
                let name = entry.file_name().to_string_lossy();
                self.config
                    .preserved_configs
                    .iter()
                    .any(|config| config.eq_ignore_ascii_case(&name))
            })
            .map(|entry| entry.into_path())
    }
}

/// Moves everything inside `child` into `parent` and removes `child`. The folder is first
/// renamed to a unique temp name so a grandchild sharing its name can land in place.
fn merge_into_parent(parent: &Path, child: &Path) -> Result<()> {
    let staging = parent.join(format!(".flatten-{}", uuid::Uuid::new_v4()));
    fs::rename(child, &staging)?;
    merge_dir(&staging, parent)?;
    fs::remove_dir_all(&staging)?;
    Ok(())
}

fn merge_dir(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            if to.is_dir() {
                merge_dir(&from, &to)?;
                continue;
            }
            if to.exists() {
                fs::remove_file(&to)?;
            }
            fs::rename(&from, &to)?;
        } else {
            if to.is_dir() {
                fs::remove_dir_all(&to)?;
            } else if to.exists() {
                fs::remove_file(&to)?;
            }
            fs::rename(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn touch(path: &Path, size: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, vec![0u8; size]).expect("write");
    }

    fn snapshot(root: &Path) -> BTreeMap<String, u64> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let rel = entry
                    .path()
                    .strip_prefix(root)
                    .expect("prefix")
                    .to_string_lossy()
                    .replace('\\', "/");
                let size = if entry.file_type().is_file() {
                    entry.metadata().map(|meta| meta.len()).unwrap_or(0)
                } else {
                    u64::MAX
                };
                (rel, size)
            })
            .collect()
    }

    fn normalizer() -> InstallNormalizer {
        InstallNormalizer::new(NormalizeConfig::default())
    }

    #[test]
    fn single_wrapper_folder_is_merged_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        touch(&root.join("Game/game.exe"), 10);
        touch(&root.join("Game/data/level.pak"), 10);

        normalizer().normalize(root).expect("normalize");

        assert!(root.join("game.exe").is_file());
        assert!(root.join("data/level.pak").is_file());
        assert!(!root.join("Game").exists());
    }

    #[test]
    fn two_level_nesting_and_same_name_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        touch(&root.join("Release/Game/Game/game.exe"), 10);
        touch(&root.join("Release/Game/readme.txt"), 1);

        let report = normalizer().normalize(root).expect("normalize");
        assert_eq!(report.collapsed, 2);
        assert!(root.join("Game/game.exe").is_file());
        assert!(root.join("readme.txt").is_file());
    }

    #[test]
    fn dominant_folder_with_exe_is_flattened() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        touch(&root.join("Game/game.exe"), 10);
        for index in 0..6 {
            touch(&root.join(format!("Game/data/{}.bin", index)), 1);
        }
        touch(&root.join("_CommonRedist/vc_redist.x64.exe"), 1);
        touch(&root.join("readme.txt"), 1);

        let report = normalizer().normalize(root).expect("normalize");
        assert_eq!(report.flattened, 1);
        assert!(root.join("game.exe").is_file());
        assert!(root.join("_CommonRedist").is_dir());
    }

    #[test]
    fn normalization_is_idempotent_and_drops_junk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        touch(&root.join("Wrapper/Game/game.exe"), 10);
        touch(&root.join("Wrapper/Game/Engine/core.dll"), 10);
        touch(&root.join("Wrapper/Fix Repair/patch.part01.rar"), 10);
        touch(&root.join("Wrapper/__MACOSX/._game.exe"), 1);
        touch(&root.join("Wrapper/Game/Thumbs.db"), 1);

        let normalizer = normalizer();
        normalizer.normalize(root).expect("first");
        let first = snapshot(root);
        let second_report = normalizer.normalize(root).expect("second");

        assert!(!second_report.changed());
        assert_eq!(first, snapshot(root));
        assert!(root.join("game.exe").is_file());
        assert!(!root.join("Fix Repair").exists());
        assert!(!root.join("Thumbs.db").exists());
    }

    #[test]
    fn unreal_layout_is_left_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        touch(&root.join("Engine/Binaries/ThirdParty/a.dll"), 1);
        for index in 0..10 {
            touch(&root.join(format!("MyGame/Content/Paks/{}.pak", index)), 1);
        }
        touch(&root.join("MyGame/Binaries/Win64/MyGame-Win64-Shipping.exe"), 1);

        let before = snapshot(root);
        normalizer().normalize(root).expect("normalize");
        assert_eq!(before, snapshot(root));
    }

    #[test]
    fn prefers_game_binary_over_installers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("Cool Game");
        touch(&root.join("unins000.exe"), 1024 * 1024);
        touch(&root.join("CoolGame.exe"), 300 * 1024);
        touch(&root.join("_CommonRedist/DirectX/DXSETUP.exe"), 10);
        touch(&root.join("CoolGame_Data/globalgamemanagers"), 10);
        touch(&root.join("UnityCrashHandler64.exe"), 1024 * 1024);

        let normalizer = normalizer();
        let found = normalizer.find_executable(&root).expect("exe");
        assert_eq!(found, root.join("CoolGame.exe"));
        assert!(normalizer
            .executable_candidates(&root)
            .iter()
            .all(|candidate| !candidate.path.ends_with("DXSETUP.exe")));
    }

    #[test]
    fn shipping_binary_beats_bootstrap_stub() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("MyGame");
        touch(&root.join("MyGame.exe"), 150 * 1024);
        touch(
            &root.join("MyGame/Binaries/Win64/MyGame-Win64-Shipping.exe"),
            6 * 1024 * 1024,
        );

        let normalizer = normalizer();
        let first = normalizer.find_executable(&root);
        assert_eq!(
            first,
            Some(root.join("MyGame/Binaries/Win64/MyGame-Win64-Shipping.exe"))
        );
        for _ in 0..3 {
            assert_eq!(normalizer.find_executable(&root), first);
        }
    }

    #[test]
    fn preserved_config_ignores_repair_folder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        touch(&root.join("Fix Repair/OnlineFix.ini"), 1);
        assert_eq!(normalizer().find_preserved_config(root), None);

        touch(&root.join("bin/onlinefix.ini"), 1);
        assert_eq!(
            normalizer().find_preserved_config(root),
            Some(root.join("bin/onlinefix.ini"))
        );
    }
}
