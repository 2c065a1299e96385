use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::errors::{LauncherError, Result};
use crate::services::archive_extractor::{is_archive, ArchiveExtractor, ExtractProgress};
use crate::services::install_normalizer::InstallNormalizer;
use crate::utils::file::{dir_is_effectively_empty, remove_path_best_effort};

static RAR_PART_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.*)\.part(\d+)\.rar$").expect("rar part regex is valid")
});

static SPLIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.*\.(?:7z|zip))\.(\d{3})$").expect("split volume regex is valid")
});

/// One archive set: every volume plus the volume handed to the extractor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveGroup {
    pub entry: PathBuf,
    pub volumes: Vec<PathBuf>,
}

impl ArchiveGroup {
    pub fn entry_name(&self) -> String {
        self.entry
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Groups `name.partNN.rar` and `name.7z.NNN` volumes; everything else stands alone.
pub fn group_archives(files: &[PathBuf]) -> Vec<ArchiveGroup> {
    let mut groups: BTreeMap<(PathBuf, String), Vec<(u32, PathBuf)>> = BTreeMap::new();
    for file in files {
        let parent = file.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let (key, index) = if let Some(caps) = RAR_PART_PATTERN.captures(&name) {
            let index = caps[2].parse::<u32>().unwrap_or(u32::MAX);
            (format!("{}.rar", caps[1].to_ascii_lowercase()), index)
        } else if let Some(caps) = SPLIT_PATTERN.captures(&name) {
            let index = caps[2].parse::<u32>().unwrap_or(u32::MAX);
            (caps[1].to_ascii_lowercase(), index)
        } else {
            (name.to_ascii_lowercase(), 0)
        };
        groups
            .entry((parent, key))
            .or_default()
            .push((index, file.clone()));
    }

    groups
        .into_values()
        .filter_map(|mut volumes| {
            volumes.sort();
            let entry = volumes.first()?.1.clone();
            Some(ArchiveGroup {
                entry,
                volumes: volumes.into_iter().map(|(_, path)| path).collect(),
            })
        })
        .collect()
}

fn has_rar_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("rar"))
        .unwrap_or(false)
}

/// Every `.rar` under `root` outside repair-tool folders, grouped by set.
pub fn find_update_archives(root: &Path, normalizer: &InstallNormalizer) -> Vec<ArchiveGroup> {
    let files: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !normalizer
                    .config()
                    .is_repair_dir(&entry.file_name().to_string_lossy())
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && has_rar_extension(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    group_archives(&files)
}

/// Release notes and checksums that ship next to packed archives without making the
/// folder game content.
const RELEASE_NOTE_EXTENSIONS: &[&str] = &["txt", "nfo", "diz", "url", "sfv", "md5", "sha1"];

fn is_archive_volume(path: &Path) -> bool {
    is_archive(path)
        || path
            .file_name()
            .map(|name| SPLIT_PATTERN.is_match(&name.to_string_lossy()))
            .unwrap_or(false)
}

fn is_release_note(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy();
            RELEASE_NOTE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Archive sets that make up a download in its staging path (a single file or a folder).
/// Repair-tool folders are skipped. An archive sitting under a folder that also holds
/// real files (an exe, game data) belongs to the payload and is left packed.
pub fn find_install_archives(source: &Path, normalizer: &InstallNormalizer) -> Vec<ArchiveGroup> {
    if source.is_file() {
        if !is_archive_volume(source) {
            return Vec::new();
        }
        let parent = source.parent().unwrap_or(source);
        return group_archives(&sibling_volumes(parent, source));
    }

    let mut archives = Vec::new();
    let mut content_dirs: Vec<PathBuf> = Vec::new();
    let entries = WalkDir::new(source)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !normalizer
                    .config()
                    .is_repair_dir(&entry.file_name().to_string_lossy())
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file());
    for entry in entries {
        let path = entry.into_path();
        if is_archive_volume(&path) {
            archives.push(path);
        } else if !is_release_note(&path) {
            if let Some(parent) = path.parent() {
                content_dirs.push(parent.to_path_buf());
            }
        }
    }
    archives.retain(|archive| !content_dirs.iter().any(|dir| archive.starts_with(dir)));
    group_archives(&archives)
}

fn sibling_volumes(parent: &Path, archive: &Path) -> Vec<PathBuf> {
    let mut files = vec![archive.to_path_buf()];
    let Ok(entries) = fs::read_dir(parent) else {
        return files;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if path != archive && path.is_file() {
            files.push(path);
        }
    }
    let groups = group_archives(&files);
    groups
        .into_iter()
        .find(|group| group.volumes.iter().any(|volume| volume == archive))
        .map(|group| group.volumes)
        .unwrap_or_else(|| vec![archive.to_path_buf()])
}

#[derive(Clone, Debug)]
pub enum ExtractionTask {
    /// Extract (or move) a finished download into a fresh install folder.
    Install {
        source: PathBuf,
        install_dir: PathBuf,
        password: Option<String>,
        keep_archives: bool,
    },
    /// Apply update archives dropped inside an existing install.
    Update {
        install_dir: PathBuf,
        known_executable: Option<PathBuf>,
        password: Option<String>,
    },
}

impl ExtractionTask {
    pub fn install_dir(&self) -> &Path {
        match self {
            ExtractionTask::Install { install_dir, .. } => install_dir,
            ExtractionTask::Update { install_dir, .. } => install_dir,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerReport {
    pub executable: Option<PathBuf>,
    pub extracted: Vec<String>,
    pub removed_volumes: usize,
    pub restored_config: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerFailure {
    pub archive: Option<String>,
    pub message: String,
    pub executable: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMessage {
    Progress(ExtractProgress),
    Done(WorkerReport),
    Failed(WorkerFailure),
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| LauncherError::Config(format!("worker step failed: {}", err)))?
}

/// Runs one extraction task and reports only through its mailbox.
#[derive(Clone)]
pub struct ExtractionWorker {
    extractor: ArchiveExtractor,
    normalizer: InstallNormalizer,
}

struct GroupFailure {
    archive: String,
    error: LauncherError,
}

impl ExtractionWorker {
    pub fn new(extractor: ArchiveExtractor, normalizer: InstallNormalizer) -> Self {
        Self {
            extractor,
            normalizer,
        }
    }

    pub async fn run(self, task: ExtractionTask, mailbox: mpsc::Sender<WorkerMessage>) {
        let message = match task {
            ExtractionTask::Install {
                source,
                install_dir,
                password,
                keep_archives,
            } => {
                self.install(&source, &install_dir, password.as_deref(), keep_archives, &mailbox)
                    .await
            }
            ExtractionTask::Update {
                install_dir,
                known_executable,
                password,
            } => {
                self.update(&install_dir, known_executable, password.as_deref(), &mailbox)
                    .await
            }
        };
        let _ = mailbox.send(message).await;
    }

    async fn extract_group(
        &self,
        group: &ArchiveGroup,
        dest: &Path,
        password: Option<&str>,
        position: (usize, usize),
        mailbox: &mpsc::Sender<WorkerMessage>,
    ) -> Result<()> {
        let (index, count) = position;
        let (tx, mut rx) = mpsc::channel::<ExtractProgress>(32);
        let extraction = self.extractor.extract(&group.entry, dest, password, tx);
        let forward = async {
            while let Some(update) = rx.recv().await {
                let overall = (index as f64 + update.percent / 100.0) / count.max(1) as f64 * 100.0;
                let _ = mailbox
                    .send(WorkerMessage::Progress(ExtractProgress {
                        percent: overall,
                        eta_seconds: update.eta_seconds,
                    }))
                    .await;
            }
        };
        let (result, ()) = tokio::join!(extraction, forward);
        result
    }

    async fn normalize(&self, root: &Path) -> Result<()> {
        let normalizer = self.normalizer.clone();
        let root = root.to_path_buf();
        blocking(move || normalizer.normalize(&root).map(|_| ())).await
    }

    async fn find_executable(&self, root: &Path, known: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(known) = known.filter(|path| path.is_file()) {
            return Some(known);
        }
        let normalizer = self.normalizer.clone();
        let root = root.to_path_buf();
        blocking(move || Ok(normalizer.find_executable(&root)))
            .await
            .ok()
            .flatten()
    }

    async fn install(
        &self,
        source: &Path,
        install_dir: &Path,
        password: Option<&str>,
        keep_archives: bool,
        mailbox: &mpsc::Sender<WorkerMessage>,
    ) -> WorkerMessage {
        let failure = |archive: Option<String>, err: LauncherError| {
            WorkerMessage::Failed(WorkerFailure {
                archive,
                message: err.to_string(),
                executable: None,
            })
        };

        if let Err(err) = tokio::fs::create_dir_all(install_dir).await {
            return failure(None, err.into());
        }

        let source_owned = source.to_path_buf();
        let normalizer = self.normalizer.clone();
        let groups = match blocking(move || Ok(find_install_archives(&source_owned, &normalizer))).await {
            Ok(groups) => groups,
            Err(err) => return failure(None, err),
        };

        let mut report = WorkerReport::default();

        let count = groups.len();
        for (index, group) in groups.iter().enumerate() {
            let outcome = self
                .extract_group(group, install_dir, password, (index, count), mailbox)
                .await;
            if !keep_archives {
                report.removed_volumes += delete_volumes(group);
            }
            if let Err(err) = outcome {
                return failure(Some(group.entry_name()), err);
            }
            report.extracted.push(group.entry_name());
        }

        // Whatever was not unpacked is part of the game; extracted files win on conflicts.
        let volumes: HashSet<PathBuf> = groups
            .iter()
            .flat_map(|group| group.volumes.iter().cloned())
            .collect();
        let volume_dirs: HashSet<PathBuf> = volumes
            .iter()
            .filter_map(|volume| volume.parent().map(Path::to_path_buf))
            .collect();
        let (from, to) = (source.to_path_buf(), install_dir.to_path_buf());
        let repair = self.normalizer.clone();
        let moved = blocking(move || {
            move_payload(&from, &to, &|path: &Path| {
                volumes.contains(path)
                    || (is_release_note(path)
                        && path
                            .parent()
                            .map(|parent| volume_dirs.contains(parent))
                            .unwrap_or(false))
                    || (path.is_dir()
                        && path
                            .file_name()
                            .map(|name| repair.config().is_repair_dir(&name.to_string_lossy()))
                            .unwrap_or(false))
            })
        })
        .await;
        if let Err(err) = moved {
            return failure(None, err);
        }

        if let Err(err) = self.normalize(install_dir).await {
            return failure(None, err);
        }
        if !keep_archives && source.is_dir() && source != install_dir {
            remove_path_best_effort(source);
        }
        report.executable = self.find_executable(install_dir, None).await;
        WorkerMessage::Done(report)
    }

    async fn update(
        &self,
        install_dir: &Path,
        known_executable: Option<PathBuf>,
        password: Option<&str>,
        mailbox: &mpsc::Sender<WorkerMessage>,
    ) -> WorkerMessage {
        let normalizer = self.normalizer.clone();
        let root = install_dir.to_path_buf();
        let scan = blocking(move || {
            let groups = find_update_archives(&root, &normalizer);
            let config = normalizer.find_preserved_config(&root).and_then(|path| {
                let contents = fs::read(&path).ok()?;
                Some((path, contents))
            });
            Ok((groups, config))
        })
        .await;
        let (groups, saved_config) = match scan {
            Ok(found) => found,
            Err(err) => {
                return WorkerMessage::Failed(WorkerFailure {
                    archive: None,
                    message: err.to_string(),
                    executable: known_executable,
                })
            }
        };

        if groups.is_empty() {
            tracing::info!("no update archives under {}", install_dir.display());
        }

        let mut report = WorkerReport::default();
        let mut failed: Option<GroupFailure> = None;
        let count = groups.len();
        for (index, group) in groups.iter().enumerate() {
            tracing::info!(
                "applying update {} ({} volume(s))",
                group.entry_name(),
                group.volumes.len()
            );
            let outcome = self
                .extract_group(group, install_dir, password, (index, count), mailbox)
                .await;
            if outcome.is_ok() {
                if let Err(err) = self.normalize(install_dir).await {
                    tracing::warn!("normalization after {} failed: {}", group.entry_name(), err);
                }
            }
            report.removed_volumes += self.cleanup_group(group, install_dir).await;

            match outcome {
                Ok(()) => report.extracted.push(group.entry_name()),
                Err(error) => {
                    failed = Some(GroupFailure {
                        archive: group.entry_name(),
                        error,
                    });
                    break;
                }
            }
        }

        if let Some((original, contents)) = saved_config {
            report.restored_config = self.restore_config(install_dir, original, contents).await;
        }
        report.executable = self.find_executable(install_dir, known_executable).await;

        match failed {
            None => WorkerMessage::Done(report),
            Some(GroupFailure { archive, error }) => WorkerMessage::Failed(WorkerFailure {
                message: error.to_string(),
                archive: Some(archive),
                executable: report.executable,
            }),
        }
    }

    /// Deletes the group's volumes, junk next to them, and the folder they sat in when
    /// nothing but junk is left.
    async fn cleanup_group(&self, group: &ArchiveGroup, install_dir: &Path) -> usize {
        let normalizer = self.normalizer.clone();
        let group = group.clone();
        let root = install_dir.to_path_buf();
        blocking(move || {
            let removed = delete_volumes(&group);
            if let Some(parent) = group.entry.parent().filter(|parent| *parent != root) {
                if parent.is_dir() {
                    let _ = normalizer.remove_junk(parent);
                    if dir_is_effectively_empty(parent, |path| {
                        let name = path
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string())
                            .unwrap_or_default();
                        normalizer.config().is_junk_file(&name)
                            || normalizer.config().is_junk_dir(&name)
                    }) {
                        remove_path_best_effort(parent);
                    }
                }
            }
            let _ = normalizer.remove_junk(&root);
            Ok(removed)
        })
        .await
        .unwrap_or(0)
    }

    async fn restore_config(
        &self,
        install_dir: &Path,
        original: PathBuf,
        contents: Vec<u8>,
    ) -> Option<PathBuf> {
        let normalizer = self.normalizer.clone();
        let root = install_dir.to_path_buf();
        let restored = blocking(move || {
            let target = normalizer.find_preserved_config(&root).unwrap_or(original);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &contents)?;
            Ok(target)
        })
        .await;
        match restored {
            Ok(path) => {
                tracing::info!("restored {}", path.display());
                Some(path)
            }
            Err(err) => {
                tracing::warn!("failed to restore preserved config: {}", err);
                None
            }
        }
    }
}

fn delete_volumes(group: &ArchiveGroup) -> usize {
    let mut removed = 0;
    for volume in &group.volumes {
        match fs::remove_file(volume) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("failed to delete {}: {}", volume.display(), err),
        }
    }
    removed
}

fn move_entry(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if from.is_dir() {
        copy_tree(from, to)?;
        fs::remove_dir_all(from)?;
    } else {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Moves a download into the install folder, merging into folders that already exist
/// there. Entries accepted by `skip` stay behind, and so does any existing target file.
fn move_payload(source: &Path, install_dir: &Path, skip: &dyn Fn(&Path) -> bool) -> Result<()> {
    if source.is_file() {
        if skip(source) {
            return Ok(());
        }
        let name = source
            .file_name()
            .ok_or_else(|| LauncherError::NotFound(source.display().to_string()))?;
        let target = install_dir.join(name);
        if !target.exists() {
            move_entry(source, &target)?;
        }
        return Ok(());
    }
    if !source.is_dir() {
        return Err(LauncherError::NotFound(source.display().to_string()));
    }
    for entry in fs::read_dir(source)? {
        let path = entry?.path();
        if skip(&path) {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = install_dir.join(name);
        if path.is_dir() {
            if target.is_dir() || contains_skipped(&path, skip) {
                move_payload(&path, &target, skip)?;
            } else if !target.exists() {
                fs::create_dir_all(install_dir)?;
                move_entry(&path, &target)?;
            }
        } else if !target.exists() {
            fs::create_dir_all(install_dir)?;
            move_entry(&path, &target)?;
        }
    }
    Ok(())
}

fn contains_skipped(dir: &Path, skip: &dyn Fn(&Path) -> bool) -> bool {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| skip(entry.path()))
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source).into_iter().filter_map(|entry| entry.ok()) {
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractorConfig, NormalizeConfig};

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, b"x").expect("write");
    }

    #[test]
    fn groups_multipart_sets_by_first_volume() {
        let files = vec![
            PathBuf::from("/g/patch.part02.rar"),
            PathBuf::from("/g/patch.part01.rar"),
            PathBuf::from("/g/Patch.part10.rar"),
            PathBuf::from("/g/extra.rar"),
            PathBuf::from("/g/big.7z.002"),
            PathBuf::from("/g/big.7z.001"),
        ];
        let groups = group_archives(&files);
        assert_eq!(groups.len(), 3);

        let patch = groups
            .iter()
            .find(|group| group.entry_name() == "patch.part01.rar")
            .expect("patch group");
        assert_eq!(patch.volumes.len(), 3);
        assert!(groups.iter().any(|group| group.entry_name() == "big.7z.001"));
        assert!(groups
            .iter()
            .any(|group| group.entry_name() == "extra.rar" && group.volumes.len() == 1));
    }

    #[test]
    fn repair_folder_archives_are_not_updates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        touch(&root.join("Fix Repair/patch.part01.rar"));
        touch(&root.join("Fix Repair/patch.part02.rar"));
        touch(&root.join("update/update.rar"));

        let normalizer = InstallNormalizer::new(NormalizeConfig::default());
        let groups = find_update_archives(root, &normalizer);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].entry, root.join("update/update.rar"));
    }

    #[test]
    fn single_file_source_pulls_in_sibling_volumes() {
        let temp = tempfile::tempdir().expect("tempdir");
        touch(&temp.path().join("game.part1.rar"));
        touch(&temp.path().join("game.part2.rar"));
        touch(&temp.path().join("other.zip"));

        let normalizer = InstallNormalizer::new(NormalizeConfig::default());
        let groups = find_install_archives(&temp.path().join("game.part1.rar"), &normalizer);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].volumes.len(), 2);
    }

    #[test]
    fn archives_beside_game_files_stay_packed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let staging = temp.path();
        touch(&staging.join("Game/Game.exe"));
        touch(&staging.join("Game/data/assets.zip"));
        touch(&staging.join("Pack/x.part1.rar"));
        touch(&staging.join("Pack/x.part2.rar"));
        touch(&staging.join("Pack/readme.txt"));
        touch(&staging.join("Fix Repair/repair.zip"));

        let normalizer = InstallNormalizer::new(NormalizeConfig::default());
        let groups = find_install_archives(staging, &normalizer);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].entry, staging.join("Pack/x.part1.rar"));
        assert_eq!(groups[0].volumes.len(), 2);
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        let file = fs::File::create(path).expect("zip file");
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .expect("entry");
            writer.write_all(body).expect("write");
        }
        writer.finish().expect("finish");
    }

    /// 7-Zip is absent, so `.zip` groups go through the in-process decoder.
    fn zip_only_worker(temp: &Path) -> ExtractionWorker {
        ExtractionWorker::new(
            ArchiveExtractor::new(ExtractorConfig {
                seven_zip_path: temp.join("no-7z").to_string_lossy().to_string(),
                ..ExtractorConfig::default()
            }),
            InstallNormalizer::new(NormalizeConfig::default()),
        )
    }

    async fn run_install(worker: ExtractionWorker, source: &Path, install: &Path) -> WorkerMessage {
        let (tx, mut rx) = mpsc::channel(64);
        worker
            .run(
                ExtractionTask::Install {
                    source: source.to_path_buf(),
                    install_dir: install.to_path_buf(),
                    password: None,
                    keep_archives: false,
                },
                tx,
            )
            .await;
        let mut last = None;
        while let Some(message) = rx.recv().await {
            last = Some(message);
        }
        last.expect("terminal message")
    }

    #[tokio::test]
    async fn loose_payload_keeps_game_files_and_inner_archives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        fs::create_dir_all(staging.join("Game")).expect("mkdir");
        fs::write(staging.join("Game/Game.exe"), vec![3u8; 4096]).expect("exe");
        write_zip(
            &staging.join("Game/data/assets.zip"),
            &[("texture.png", b"png".as_slice())],
        );
        let install = temp.path().join("install");

        let message = run_install(zip_only_worker(temp.path()), &staging, &install).await;
        let report = match message {
            WorkerMessage::Done(report) => report,
            other => panic!("unexpected message {:?}", other),
        };
        assert!(report.extracted.is_empty());
        assert_eq!(report.executable, Some(install.join("Game.exe")));
        assert!(install.join("data/assets.zip").is_file());
        assert!(!install.join("texture.png").exists());
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn repair_folder_archives_are_not_installed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        write_zip(
            &staging.join("game.zip"),
            &[("Game/Game.exe", [5u8; 4096].as_slice()), ("Game/data/level.pak", b"lvl".as_slice())],
        );
        write_zip(
            &staging.join("Fix Repair/repair.zip"),
            &[("RepairTool.exe", [9u8; 4096].as_slice())],
        );
        let install = temp.path().join("install");

        let message = run_install(zip_only_worker(temp.path()), &staging, &install).await;
        let report = match message {
            WorkerMessage::Done(report) => report,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(report.extracted, vec!["game.zip".to_string()]);
        assert_eq!(report.executable, Some(install.join("Game.exe")));
        assert!(install.join("data/level.pak").is_file());

        let stray: Vec<PathBuf> = WalkDir::new(&install)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name == "RepairTool.exe" || name == "Fix Repair")
                    .unwrap_or(false)
            })
            .collect();
        assert!(stray.is_empty(), "repair files installed: {:?}", stray);
    }

    #[tokio::test]
    async fn plain_download_is_moved_into_install_folder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        touch(&staging.join("Game/game.exe"));
        let install = temp.path().join("install");

        let worker = ExtractionWorker::new(
            ArchiveExtractor::new(ExtractorConfig::default()),
            InstallNormalizer::new(NormalizeConfig::default()),
        );
        let (tx, mut rx) = mpsc::channel(16);
        worker
            .run(
                ExtractionTask::Install {
                    source: staging.clone(),
                    install_dir: install.clone(),
                    password: None,
                    keep_archives: false,
                },
                tx,
            )
            .await;

        match rx.recv().await {
            Some(WorkerMessage::Done(report)) => {
                assert_eq!(report.executable, Some(install.join("game.exe")));
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(!staging.exists());
    }

    #[cfg(unix)]
    mod with_stand_in_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Fake 7-Zip: logs the archive it was given and writes files into the `-o` folder.
        fn stand_in_tool(dir: &Path, body: &str) -> String {
            let path = dir.join("7z-stand-in");
            let script = format!(
                "#!/bin/sh\nout=''\nfor a in \"$@\"; do case \"$a\" in -o*) out=\"${{a#-o}}\";; esac; last=\"$a\"; done\necho \"$last\" >> '{}'\n{}\n",
                dir.join("calls.log").display(),
                body
            );
            fs::write(&path, script).expect("write tool");
            let mut permissions = fs::metadata(&path).expect("meta").permissions();
            permissions.set_mode(0o755);
            fs::set_permissions(&path, permissions).expect("chmod");
            path.to_string_lossy().to_string()
        }

        fn worker(tool: String) -> ExtractionWorker {
            ExtractionWorker::new(
                ArchiveExtractor::new(ExtractorConfig {
                    seven_zip_path: tool,
                    rar_fallback: false,
                    ..ExtractorConfig::default()
                }),
                InstallNormalizer::new(NormalizeConfig::default()),
            )
        }

        async fn run_update(worker: ExtractionWorker, install: &Path) -> WorkerMessage {
            let (tx, mut rx) = mpsc::channel(64);
            worker
                .run(
                    ExtractionTask::Update {
                        install_dir: install.to_path_buf(),
                        known_executable: None,
                        password: None,
                    },
                    tx,
                )
                .await;
            let mut last = None;
            while let Some(message) = rx.recv().await {
                last = Some(message);
            }
            last.expect("terminal message")
        }

        #[tokio::test]
        async fn update_skips_repair_archives_and_restores_config() {
            let tools = tempfile::tempdir().expect("tools");
            let temp = tempfile::tempdir().expect("tempdir");
            let install = temp.path().join("Game");
            touch(&install.join("game.exe"));
            fs::write(install.join("OnlineFix.ini"), b"user settings").expect("ini");
            touch(&install.join("Fix Repair/patch.part01.rar"));
            touch(&install.join("Fix Repair/patch.part02.rar"));
            touch(&install.join("update/update.rar"));

            let tool = stand_in_tool(
                tools.path(),
                "mkdir -p \"$out\"\necho stock > \"$out/OnlineFix.ini\"\necho new > \"$out/patched.dll\"\nexit 0",
            );
            let message = run_update(worker(tool), &install).await;

            let report = match message {
                WorkerMessage::Done(report) => report,
                other => panic!("unexpected message {:?}", other),
            };
            assert_eq!(report.extracted, vec!["update.rar".to_string()]);
            assert_eq!(report.executable, Some(install.join("game.exe")));

            let calls = fs::read_to_string(tools.path().join("calls.log")).expect("log");
            assert_eq!(calls.lines().count(), 1);
            assert!(calls.contains("update.rar"));
            assert!(!calls.contains("patch.part01.rar"));

            assert!(install.join("patched.dll").is_file());
            assert!(!install.join("update").exists());
            assert!(!install.join("Fix Repair").exists());
            assert_eq!(
                fs::read_to_string(install.join("OnlineFix.ini")).expect("ini"),
                "user settings"
            );
        }

        #[tokio::test]
        async fn installed_split_set_removes_every_volume() {
            let tools = tempfile::tempdir().expect("tools");
            let temp = tempfile::tempdir().expect("tempdir");
            let downloads = temp.path().join("downloads");
            for part in 1..=3 {
                touch(&downloads.join(format!("game.7z.00{}", part)));
            }
            let install = temp.path().join("install");

            let tool = stand_in_tool(
                tools.path(),
                "mkdir -p \"$out/Game\"\nhead -c 4096 /dev/zero > \"$out/Game/Game.exe\"\nexit 0",
            );
            let message = run_install(worker(tool), &downloads.join("game.7z.001"), &install).await;

            let report = match message {
                WorkerMessage::Done(report) => report,
                other => panic!("unexpected message {:?}", other),
            };
            assert_eq!(report.extracted, vec!["game.7z.001".to_string()]);
            assert_eq!(report.removed_volumes, 3);
            assert_eq!(report.executable, Some(install.join("Game.exe")));
            for part in 1..=3 {
                assert!(!downloads.join(format!("game.7z.00{}", part)).exists());
            }
            let calls = fs::read_to_string(tools.path().join("calls.log")).expect("log");
            assert_eq!(calls.lines().count(), 1);
        }

        #[tokio::test]
        async fn applied_multipart_update_removes_every_volume() {
            let tools = tempfile::tempdir().expect("tools");
            let temp = tempfile::tempdir().expect("tempdir");
            let install = temp.path().join("Game");
            touch(&install.join("game.exe"));
            for part in 1..=3 {
                touch(&install.join(format!("patch.part0{}.rar", part)));
            }

            let tool = stand_in_tool(
                tools.path(),
                "echo new > \"$out/patched.dll\"\nexit 0",
            );
            let message = run_update(worker(tool), &install).await;

            let report = match message {
                WorkerMessage::Done(report) => report,
                other => panic!("unexpected message {:?}", other),
            };
            assert_eq!(report.extracted, vec!["patch.part01.rar".to_string()]);
            assert_eq!(report.removed_volumes, 3);
            assert!(install.join("patched.dll").is_file());
            for part in 1..=3 {
                assert!(!install.join(format!("patch.part0{}.rar", part)).exists());
            }
        }

        #[tokio::test]
        async fn failed_group_deletes_every_volume_and_names_the_archive() {
            let tools = tempfile::tempdir().expect("tools");
            let temp = tempfile::tempdir().expect("tempdir");
            let install = temp.path().join("Game");
            touch(&install.join("game.exe"));
            touch(&install.join("update.part01.rar"));
            touch(&install.join("update.part02.rar"));
            touch(&install.join("update.part03.rar"));

            let tool = stand_in_tool(tools.path(), "echo 'ERROR: CRC Failed' >&2\nexit 2");
            let message = run_update(worker(tool), &install).await;

            match message {
                WorkerMessage::Failed(failure) => {
                    assert_eq!(failure.archive.as_deref(), Some("update.part01.rar"));
                    assert!(failure.message.contains("code 2"));
                    assert_eq!(failure.executable, Some(install.join("game.exe")));
                }
                other => panic!("unexpected message {:?}", other),
            }
            for part in 1..=3 {
                assert!(!install.join(format!("update.part0{}.rar", part)).exists());
            }
        }
    }
}
