use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::errors::{LauncherError, Result};
use crate::services::torrent::info_hash_from_magnet;

/// One torrent session the launcher is driving.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveTorrent {
    pub id: u64,
    pub source: String,
    pub aliases: BTreeSet<String>,
    pub info_hash: Option<String>,
    pub paused: bool,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: HashMap<u64, ActiveTorrent>,
    aliases: HashMap<String, u64>,
}

/// Canonical ids plus an alias index; every lookup by name goes through the index.
#[derive(Default)]
pub struct ActiveTorrentRegistry {
    inner: Mutex<RegistryInner>,
}

/// Info-hashes are compared case-insensitively, everything else verbatim.
fn alias_key(alias: &str) -> Option<String> {
    let trimmed = alias.trim();
    if trimmed.is_empty() {
        return None;
    }
    let is_hash = matches!(trimmed.len(), 40 | 64) && trimmed.chars().all(|ch| ch.is_ascii_hexdigit());
    if is_hash {
        Some(trimmed.to_ascii_lowercase())
    } else {
        Some(trimmed.to_string())
    }
}

impl ActiveTorrentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RegistryInner>> {
        self.inner
            .lock()
            .map_err(|_| LauncherError::Config("torrent registry lock poisoned".to_string()))
    }

    /// Fails with `Duplicate` when any alias already belongs to an active session.
    pub fn register(&self, source: &str, aliases: &[String]) -> Result<u64> {
        let mut keys: BTreeSet<String> = aliases.iter().filter_map(|alias| alias_key(alias)).collect();
        keys.extend(alias_key(source));
        let info_hash = info_hash_from_magnet(source);
        keys.extend(info_hash.clone());

        let mut inner = self.lock()?;
        if let Some(taken) = keys.iter().find(|key| inner.aliases.contains_key(*key)) {
            return Err(LauncherError::Duplicate(taken.clone()));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        for key in &keys {
            inner.aliases.insert(key.clone(), id);
        }
        inner.entries.insert(
            id,
            ActiveTorrent {
                id,
                source: source.to_string(),
                aliases: keys,
                info_hash,
                paused: false,
            },
        );
        Ok(id)
    }

    pub fn add_alias(&self, id: u64, alias: &str) -> Result<()> {
        let Some(key) = alias_key(alias) else {
            return Ok(());
        };
        let mut inner = self.lock()?;
        match inner.aliases.get(&key) {
            Some(owner) if *owner == id => return Ok(()),
            Some(_) => return Err(LauncherError::Duplicate(key)),
            None => {}
        }
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| LauncherError::NotFound(format!("torrent session {}", id)))?;
        entry.aliases.insert(key.clone());
        inner.aliases.insert(key, id);
        Ok(())
    }

    pub fn set_info_hash(&self, id: u64, info_hash: &str) -> Result<()> {
        self.add_alias(id, info_hash)?;
        let mut inner = self.lock()?;
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.info_hash = alias_key(info_hash);
        }
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<ActiveTorrent> {
        self.lock().ok()?.entries.get(&id).cloned()
    }

    pub fn lookup(&self, alias: &str) -> Option<ActiveTorrent> {
        let key = alias_key(alias)?;
        let inner = self.lock().ok()?;
        let id = inner.aliases.get(&key)?;
        inner.entries.get(id).cloned()
    }

    pub fn is_active(&self, alias: &str) -> bool {
        self.lookup(alias).is_some()
    }

    pub fn set_paused(&self, id: u64, paused: bool) -> Option<ActiveTorrent> {
        let mut inner = self.lock().ok()?;
        let entry = inner.entries.get_mut(&id)?;
        entry.paused = paused;
        Some(entry.clone())
    }

    pub fn unregister(&self, id: u64) -> Option<ActiveTorrent> {
        let mut inner = self.lock().ok()?;
        let entry = inner.entries.remove(&id)?;
        for alias in &entry.aliases {
            inner.aliases.remove(alias);
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
