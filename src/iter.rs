//! Cursor iteration, prefix scan, and range scan over a directory snapshot
//! (§4.8). `ForEach`/`Scan`/`Range` are synchronous tree walks; `Iterator`
//! returns a cursor the caller drives by hand.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec;
use crate::datafile::DataFile;
use crate::engine::Db;
use crate::error::{Error, Result};
use crate::keydir::{Item, KeyDir};

impl Db {
    /// Calls `f` for every key in ascending order. Stops on the first
    /// `Err` returned by `f`, propagating it to the caller.
    pub fn for_each(&self, f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let (snapshot, files) = self.snapshot_for_read();
        walk(&snapshot, &files, f, |kd, visit| kd.walk(visit))
    }

    /// Calls `f` for every key with the given prefix, in ascending order.
    /// A zero-length prefix behaves like [`Db::for_each`].
    pub fn scan(&self, prefix: &[u8], f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let (snapshot, files) = self.snapshot_for_read();
        walk(&snapshot, &files, f, |kd, visit| kd.walk_prefix(prefix, visit))
    }

    /// Calls `f` for every key `k` with `start <= k <= end`, in ascending
    /// order. Returns [`Error::InvalidRange`] without calling `f` if
    /// `start > end`.
    pub fn range(&self, start: &[u8], end: &[u8], f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        if start > end {
            return Err(Error::InvalidRange);
        }
        let (snapshot, files) = self.snapshot_for_read();
        walk(&snapshot, &files, f, |kd, visit| kd.walk_range(start, end, visit))
    }

    /// Opens a cursor over the directory as of this call. Unaffected by
    /// subsequent writes, including those from a concurrent merge (§4.8,
    /// §5): the data files it can still read from are kept alive by the
    /// `Arc` clones captured here even if a later merge replaces the
    /// engine's own file set.
    pub fn iterator(&self, reverse: bool) -> DbIterator {
        let (snapshot, files) = self.snapshot_for_read();
        let cursor = if reverse { snapshot.reverse_iterator() } else { snapshot.iterator() };
        DbIterator { snapshot, reverse, cursor, files, closed: false }
    }

    fn snapshot_for_read(&self) -> (KeyDir, HashMap<i32, Arc<DataFile>>) {
        let state = self.state.read().unwrap();
        let mut files = state.readonly.clone();
        files.insert(state.active.id(), state.active.clone());
        (state.keydir.clone(), files)
    }
}

fn fetch(files: &HashMap<i32, Arc<DataFile>>, item: &Item) -> Result<Vec<u8>> {
    let file = files.get(&item.file_id).ok_or(Error::KeyNotFound)?;
    let entry = file.read_at(item.offset, item.size)?;
    codec::verify_checksum(&entry)?;
    Ok(entry.value)
}

/// Drives a `KeyDir` walk method with a value-fetching, `Result`-returning
/// visitor. `KeyDir::walk*`'s own visitor only reports "stop now" as a
/// bool (§4.3); any error from `f` or from resolving a value is captured
/// here and re-raised once the walk halts.
fn walk(
    snapshot: &KeyDir,
    files: &HashMap<i32, Arc<DataFile>>,
    mut f: impl FnMut(&[u8], &[u8]) -> Result<()>,
    run: impl FnOnce(&KeyDir, &mut dyn FnMut(&[u8], &Item) -> bool),
) -> Result<()> {
    let mut failure: Option<Error> = None;
    run(snapshot, &mut |key, item| match fetch(files, item).and_then(|value| f(key, &value)) {
        Ok(()) => false,
        Err(e) => {
            failure = Some(e);
            true
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A cursor over a directory snapshot taken at [`Db::iterator`] time.
pub struct DbIterator {
    snapshot: KeyDir,
    reverse: bool,
    cursor: crate::keydir::Cursor,
    files: HashMap<i32, Arc<DataFile>>,
    closed: bool,
}

impl DbIterator {
    /// Advances the cursor and returns the next `(key, value)` pair.
    /// Returns [`Error::IteratorClosed`] if the cursor was already closed,
    /// or [`Error::StopIteration`] on exhaustion (which implicitly closes
    /// it, per §4.8).
    pub fn next(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.closed {
            return Err(Error::IteratorClosed);
        }
        match self.cursor.next() {
            Some((key, item)) => {
                let value = fetch(&self.files, &item)?;
                Ok((key, value))
            }
            None => {
                self.closed = true;
                Err(Error::StopIteration)
            }
        }
    }

    /// Repositions the cursor at the first key with `prefix` (or one step
    /// past it, in reverse), without losing the snapshot it was opened
    /// against.
    pub fn seek_prefix(&mut self, prefix: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::IteratorClosed);
        }
        self.cursor = self.snapshot.seek_prefix(prefix, self.reverse);
        Ok(())
    }

    /// Invalidates the cursor; any further `next`/`seek_prefix` call
    /// returns [`Error::IteratorClosed`].
    pub fn close(&mut self) {
        self.closed = true;
    }
}
