//! Merge/compaction (§4.6).
//!
//! Mutually exclusive with other merges, but designed not to block
//! readers: the engine write lock is held only while sealing the active
//! file at the start and while swapping the file set back in at the end.
//! The bulk of the work (copying live keys into a temporary database) runs
//! with no lock held at all, against a snapshot of the directory taken at
//! step 1.

use std::fs;
use std::path::Path;

use crate::config::Options;
use crate::datafile::DataFile;
use crate::engine::Db;
use crate::error::{Error, Result};
use crate::keydir::KeyDir;

impl Db {
    /// Runs a full merge, reclaiming space made obsolete by overwrites and
    /// tombstones (§4.6).
    pub fn merge(&self) -> Result<()> {
        self.check_writable_for_merge()?;

        // Step 1: seal the active file, open a fresh one, snapshot the live
        // keydir as of this moment.
        let (cutoff, snapshot) = {
            let mut state = self.state.write().unwrap();
            if state.is_merging {
                return Err(Error::MergeInProgress);
            }
            state.is_merging = true;

            let old_active_id = state.active.id();
            let sealed = state.active.make_readonly()?;
            state.readonly.insert(old_active_id, sealed);
            state.active = DataFile::open_writable(&self.path, old_active_id + 1)?;

            (old_active_id, state.keydir.clone())
        };

        log::info!("merge starting: cutoff file id {cutoff}, {} live keys snapshotted", snapshot.len());
        let result = self.run_merge(cutoff, &snapshot);

        // On any failure, clear the merging flag before propagating so a
        // later call isn't wedged forever.
        if let Err(e) = &result {
            self.state.write().unwrap().is_merging = false;
            log::error!("merge failed: {e}");
            return result;
        }
        result
    }

    fn check_writable_for_merge(&self) -> Result<()> {
        if self.readonly_mode {
            return Err(Error::DatabaseReadonly);
        }
        Ok(())
    }

    /// Steps 2-5 of §4.6: copy live pre-cutoff keys into a temporary
    /// database, then swap the file sets.
    ///
    /// The temporary database numbers its own files from 0. Since it holds
    /// a subset of the live bytes that occupied ids `0..=cutoff`, it never
    /// produces more than `cutoff + 1` files — so its ids never reach the
    /// real engine's post-cutoff active file at `cutoff + 1`.
    fn run_merge(&self, cutoff: i32, snapshot: &KeyDir) -> Result<()> {
        let temp_dir = self.path.join(format!("merge-{}", std::process::id()));
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }
        let temp_db = Db::open(
            &temp_dir,
            Options::new()
                .max_datafile_size(self.config.max_datafile_size)
                .max_key_size(self.config.max_key_size)
                .max_value_size(self.config.max_value_size)
                .sync_writes(self.config.sync_writes),
        )?;

        // Step 3: copy every live key written at or before the cutoff.
        // Keys already written into the post-cutoff active file are
        // skipped — they're newer than anything being merged and survive
        // step 5 untouched.
        snapshot.walk(|key, item| {
            if item.file_id > cutoff {
                return false;
            }
            match self.read_via(snapshot, key) {
                Ok(value) => {
                    if let Err(e) = temp_db.put(key, &value) {
                        log::warn!("merge: failed copying key {key:?}: {e}");
                    }
                }
                Err(e) => {
                    log::warn!("merge: failed reading key {key:?}, skipping: {e}");
                }
            }
            false
        });

        // Step 4: close the temporary instance so its data files and
        // index are flushed to disk. Its keydir maps every copied key to
        // its new, renumbered location and is taken before the instance is
        // consumed by close.
        let merged = temp_db.keydir_snapshot();
        temp_db.close()?;

        // Step 5: swap the file sets back in under the engine write lock.
        self.swap_in_merged(cutoff, &temp_dir, merged)
    }

    /// Reads `key` by resolving through `snapshot` instead of the engine's
    /// live directory, so the read observes the state as of merge step 1
    /// even if concurrent writers have since moved the key.
    fn read_via(&self, snapshot: &KeyDir, key: &[u8]) -> Result<Vec<u8>> {
        let item = snapshot.get(key).ok_or(Error::KeyNotFound)?;
        let state = self.state.read().unwrap();
        let file = self.resolve_file(&state, item.file_id)?;
        drop(state);
        let entry = file.read_at(item.offset, item.size)?;
        crate::codec::verify_checksum(&entry)?;
        Ok(entry.value)
    }

    /// Swaps the file sets and reconciles the key directory (§4.6 step 5).
    ///
    /// `merged` maps every key copied into the temporary database to its
    /// new, renumbered location, but it was built from the step-1 snapshot
    /// and knows nothing about writes or deletes made against post-cutoff
    /// files while the copy ran. The live `state.keydir` held here is the
    /// source of truth for what's still live: any key it still maps to a
    /// post-cutoff file was written during the merge window and keeps that
    /// mapping untouched; everything else is replaced by `merged`'s
    /// mapping, dropping keys `merged` copied but that were deleted out
    /// from under it before the swap.
    fn swap_in_merged(&self, cutoff: i32, temp_dir: &Path, merged: KeyDir) -> Result<()> {
        let mut state = self.state.write().unwrap();

        // Flush and drop every in-process handle before touching the
        // files on disk; the HashMap is about to be rebuilt from scratch.
        for (_, file) in state.readonly.drain() {
            drop(file);
        }

        // Only obsolete data files are removed here — config.json, meta.json
        // and the index sidecar belong to the live engine and are rewritten
        // below, not replaced from the temporary database's own copies.
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name_str = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = crate::datafile::parse_id(&name_str) {
                if id <= cutoff {
                    fs::remove_file(entry.path())?;
                }
            }
        }

        // Only the merged data files are pulled in; the temp database's own
        // config.json/meta.json/index are discarded with the rest of its
        // directory below.
        for entry in fs::read_dir(temp_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if crate::datafile::parse_id(&name.to_string_lossy()).is_none() {
                continue;
            }
            let dest = self.path.join(&name);
            fs::rename(entry.path(), &dest)?;
        }
        fs::remove_dir_all(temp_dir)?;

        let mut ids = crate::engine::discover_ids(&self.path)?;
        ids.sort_unstable();
        let active_id = state.active.id();
        let mut readonly = std::collections::HashMap::new();
        for id in ids.iter().copied().filter(|&id| id != active_id) {
            readonly.insert(id, DataFile::open_readonly(&self.path, id)?);
        }

        // Drop merged entries for keys no longer live, then overlay entries
        // still pointing at a post-cutoff file — both passes compare
        // against `state.keydir` as it stands right now, under the same
        // write lock that's about to install the result.
        let mut reconciled = merged;
        let mut stale = Vec::new();
        reconciled.walk(|key, _| {
            if state.keydir.get(key).is_none() {
                stale.push(key.to_vec());
            }
            false
        });
        for key in stale {
            reconciled = reconciled.delete(&key);
        }
        state.keydir.walk(|key, item| {
            if item.file_id > cutoff {
                reconciled = reconciled.insert(key, *item);
            }
            false
        });

        state.keydir = reconciled;
        state.readonly = readonly;
        state.meta.reclaimable_space = 0;
        state.is_merging = false;
        crate::index::save(&self.path, &state.keydir)?;
        state.meta.save(&self.path)?;

        log::info!("merge finished: {} data files remain", state.readonly.len() + 1);
        Ok(())
    }
}
