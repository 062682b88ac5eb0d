//! The engine: owns the active file, the readonly file set, the current
//! tree root, and the metadata; coordinates open/read/write/rotate/merge/
//! backup/close under a single-writer lock and an exclusive directory lock
//! (§4.5, §5).

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use fs4::FileExt;

use crate::codec::{self, Entry};
use crate::config::{Config, Options};
use crate::datafile::{self, DataFile};
use crate::error::{Error, Result};
use crate::keydir::{Item, KeyDir};
use crate::metadata::Metadata;

pub const LOCK_FILE: &str = "lock";

/// Mutable engine state, guarded by a single `RwLock`: shared for reads,
/// exclusive for writes and for the structural parts of merge (§5).
pub(crate) struct State {
    pub(crate) active: Arc<DataFile>,
    pub(crate) readonly: HashMap<i32, Arc<DataFile>>,
    pub(crate) keydir: KeyDir,
    pub(crate) meta: Metadata,
    pub(crate) is_merging: bool,
}

/// A batched mutation, as accumulated by [`crate::txn::Transaction`] and
/// replayed through [`Db::write_batch`] on commit (§4.7).
#[derive(Debug, Clone)]
pub enum BatchEntry {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A batch of writes applied atomically-in-sequence (not all-or-nothing,
/// per §9) by [`Db::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.push(BatchEntry::Put { key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.entries.push(BatchEntry::Delete { key: key.into() });
    }
}

/// Point-in-time counters reported by [`Db::stats`] (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub datafiles: usize,
    pub keys: usize,
    pub size: u64,
    pub reclaimable: i64,
}

pub struct Db {
    pub(crate) path: PathBuf,
    pub(crate) config: Config,
    pub(crate) readonly_mode: bool,
    pub(crate) lock_file: Option<File>,
    pub(crate) state: RwLock<State>,
}

impl Db {
    /// Opens (or creates) a database at `path` (§4.5).
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        set_dir_mode(&path, options.dir_mode_override().unwrap_or(Config::default().dir_mode));

        let base_config = Config::load(&path)?;
        let config = options.apply(base_config);
        config.validate()?;
        config.save(&path)?;
        // The directory may have just been created with a provisional mode
        // (an override wasn't known, or this is a reopen with a config.json
        // whose `dir_mode` differs from the override); bring it in line with
        // the fully resolved config.
        set_dir_mode(&path, config.dir_mode);

        let mut meta = Metadata::load(&path)?;

        let lock_path = path.join(LOCK_FILE);
        let lock_file = File::options().create(true).read(true).write(true).open(&lock_path)?;
        let (lock_file, readonly_mode) = match lock_file.try_lock_exclusive() {
            Ok(()) => (Some(lock_file), false),
            Err(_) if config.auto_readonly => {
                log::warn!("database {} is locked, opening readonly", path.display());
                (None, true)
            }
            Err(_) => return Err(Error::DatabaseLocked),
        };

        let mut ids = discover_ids(&path)?;
        ids.sort_unstable();
        let last_id = ids.last().copied().unwrap_or(0);

        if config.auto_recovery && ids.contains(&last_id) && recover_tail(&path, last_id, &config)? {
            // The on-disk tail didn't match what was on disk when the
            // index snapshot was last written; it can no longer be
            // trusted, so force the step-7 rebuild from data files.
            meta.index_up_to_date = false;
        }

        let keydir = load_or_rebuild_keydir(&path, &ids, &config, &mut meta)?;

        let active = if readonly_mode {
            // A readonly-mode open never creates or writes the active
            // file; reads still resolve through the readonly map below by
            // also registering `last_id` there.
            DataFile::open_readonly(&path, last_id)?
        } else if ids.contains(&last_id) {
            DataFile::open_writable(&path, last_id)?
        } else {
            DataFile::open_writable(&path, 0)?
        };

        let mut readonly = HashMap::new();
        for id in ids.iter().copied().filter(|&id| id != active.id()) {
            readonly.insert(id, DataFile::open_readonly(&path, id)?);
        }
        if readonly_mode {
            readonly.insert(active.id(), active.clone());
        }

        log::info!("opened database {} ({} keys, {} data files)", path.display(), keydir.len(), ids.len().max(1));

        Ok(Self {
            path,
            config,
            readonly_mode,
            lock_file,
            state: RwLock::new(State { active, readonly, keydir, meta, is_merging: false }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly_mode {
            return Err(Error::DatabaseReadonly);
        }
        Ok(())
    }

    /// `Get` (§4.5 read path).
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let (item, file) = {
            let state = self.state.read().unwrap();
            let item = state.keydir.get(key).ok_or(Error::KeyNotFound)?;
            let file = self.resolve_file(&state, item.file_id)?;
            (item, file)
        };
        let entry = file.read_at(item.offset, item.size)?;
        codec::verify_checksum(&entry)?;
        Ok(entry.value)
    }

    /// Directory membership test; no disk I/O.
    pub fn has(&self, key: &[u8]) -> bool {
        self.state.read().unwrap().keydir.contains(key)
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().keydir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        validate_key(key, self.config.max_key_size)?;
        if value.len() as u64 > self.config.max_value_size {
            return Err(Error::ValueTooLarge);
        }
        let mut state = self.state.write().unwrap();
        self.write_entry_locked(&mut state, Entry::new(key.to_vec(), value.to_vec()))
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        validate_key(key, self.config.max_key_size)?;
        let mut state = self.state.write().unwrap();
        self.write_entry_locked(&mut state, Entry::new(key.to_vec(), Vec::new()))
    }

    /// Replays a batch through the write path in order. Not atomic across
    /// entries: a crash partway through leaves a prefix durable (§4.7, §9).
    pub fn write_batch(&self, batch: &Batch) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().unwrap();
        for entry in &batch.entries {
            match entry {
                BatchEntry::Put { key, value } => {
                    validate_key(key, self.config.max_key_size)?;
                    if value.len() as u64 > self.config.max_value_size {
                        return Err(Error::ValueTooLarge);
                    }
                    self.write_entry_locked(&mut state, Entry::new(key.clone(), value.clone()))?;
                }
                BatchEntry::Delete { key } => {
                    validate_key(key, self.config.max_key_size)?;
                    self.write_entry_locked(&mut state, Entry::new(key.clone(), Vec::new()))?;
                }
            }
        }
        Ok(())
    }

    /// Appends `entry`, updates the directory and `ReclaimableSpace`, and
    /// rotates the active file first if needed (§4.5 write path).
    pub(crate) fn write_entry_locked(&self, state: &mut State, entry: Entry) -> Result<()> {
        state.meta.index_up_to_date = false;
        self.maybe_rotate(state)?;

        let (offset, n) = state.active.write(&entry)?;
        if self.config.sync_writes {
            state.active.sync()?;
        }

        let key = entry.key.clone();
        if entry.is_tombstone() {
            if let Some(old) = state.keydir.get(&key) {
                state.meta.reclaimable_space += old.size + codec::META_OVERHEAD as i64 + key.len() as i64;
                state.keydir = state.keydir.delete(&key);
            }
        } else {
            if let Some(old) = state.keydir.get(&key) {
                state.meta.reclaimable_space += old.size;
            }
            let item = Item { file_id: state.active.id(), offset, size: n };
            state.keydir = state.keydir.insert(&key, item);
        }
        Ok(())
    }

    /// Seals the active file and opens a fresh one if it has reached
    /// `max_datafile_size` (§4.5).
    pub(crate) fn maybe_rotate(&self, state: &mut State) -> Result<()> {
        if state.active.size() < self.config.max_datafile_size {
            return Ok(());
        }
        let old_id = state.active.id();
        let sealed = state.active.make_readonly()?;
        state.readonly.insert(old_id, sealed);
        state.active = DataFile::open_writable(&self.path, old_id + 1)?;
        log::info!("rotated to data file {}", datafile::file_name(state.active.id()));
        crate::index::save(&self.path, &state.keydir)?;
        Ok(())
    }

    pub(crate) fn resolve_file(&self, state: &State, id: i32) -> Result<Arc<DataFile>> {
        if id == state.active.id() {
            return Ok(state.active.clone());
        }
        state.readonly.get(&id).cloned().ok_or(Error::KeyNotFound)
    }

    /// Clones the live key directory as of this call.
    pub(crate) fn keydir_snapshot(&self) -> KeyDir {
        self.state.read().unwrap().keydir.clone()
    }

    pub fn sync(&self) -> Result<()> {
        self.check_writable()?;
        let state = self.state.read().unwrap();
        state.meta.save(&self.path)?;
        state.active.sync()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        let state = self.state.read().unwrap();
        let mut size = 0u64;
        for entry in fs::read_dir(&self.path)? {
            size += entry?.metadata()?.len();
        }
        Ok(Stats {
            datafiles: state.readonly.len(),
            keys: state.keydir.len(),
            size,
            reclaimable: state.meta.reclaimable_space,
        })
    }

    /// Copies every file under the database path except the lock file to
    /// `target`, creating it if needed (§4.6).
    pub fn backup(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        fs::create_dir_all(target)?;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == LOCK_FILE {
                continue;
            }
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), target.join(&name))?;
            }
        }
        Ok(())
    }

    /// Writes the index snapshot, marks the metadata up to date, persists
    /// it, and releases the directory lock (§4.5).
    pub fn close(self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        crate::index::save(&self.path, &state.keydir)?;
        state.meta.index_up_to_date = true;
        state.meta.save(&self.path)?;
        if let Some(active_sync_err) = state.active.sync().err() {
            log::warn!("failed to sync active file on close: {active_sync_err}");
        }
        log::info!("closed database {}", self.path.display());
        // `lock_file` is dropped (and the advisory lock released) when
        // `self` goes out of scope at the end of this function.
        Ok(())
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) {}

pub(crate) fn validate_key(key: &[u8], max_key_size: u32) -> Result<()> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    if key.len() as u32 > max_key_size {
        return Err(Error::KeyTooLarge);
    }
    Ok(())
}

/// Lists `%09d.data` files under `path` and parses their ids.
pub(crate) fn discover_ids(path: &Path) -> Result<Vec<i32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(id) = datafile::parse_id(name) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Truncates the highest-id data file at the last complete record boundary
/// if its tail is a partial write (§7, `AutoRecovery`). Returns whether a
/// truncation actually happened.
fn recover_tail(path: &Path, id: i32, config: &Config) -> Result<bool> {
    let file = DataFile::open_writable(path, id)?;
    if let Some(tail) = file.scan(config.max_key_size, config.max_value_size, |_, _| {})? {
        if tail < file.size() as i64 {
            log::warn!(
                "truncating {} from {} to {} bytes: incomplete trailing record",
                datafile::file_name(id),
                file.size(),
                tail
            );
            file.truncate(tail)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Loads the persisted index if it exists and `meta.index_up_to_date`,
/// else rebuilds the directory by scanning every data file in id order
/// (§4.5 step 7, §4.4).
fn load_or_rebuild_keydir(path: &Path, ids: &[i32], config: &Config, meta: &mut Metadata) -> Result<KeyDir> {
    if meta.index_up_to_date {
        match crate::index::load(path, config.max_key_size) {
            Ok(Some(keydir)) => return Ok(keydir),
            Ok(None) => {}
            Err(e) => log::warn!("index snapshot load failed ({e}), rebuilding from data files"),
        }
    }

    let mut keydir = KeyDir::new();
    for &id in ids {
        let file = DataFile::open_readonly(path, id)?;
        file.scan(config.max_key_size, config.max_value_size, |entry, offset| {
            if entry.is_tombstone() {
                keydir = keydir.delete(&entry.key);
            } else {
                let size = entry.encoded_len() as i64;
                keydir = keydir.insert(&entry.key, Item { file_id: id, offset, size });
            }
        })?;
    }
    meta.index_up_to_date = false;
    Ok(keydir)
}
