//! The in-memory key directory: an immutable, persistent map from key bytes
//! to [`Item`] (§3, §4.3).

mod tree;

use std::sync::Arc;

/// A pointer to an entry on disk: which data file, at what offset, and how
/// many bytes the *encoded entry* (not just the value) occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub file_id: i32,
    pub offset: i64,
    pub size: i64,
}

/// A persistent, structurally-shared snapshot of the key directory.
///
/// Cloning a `KeyDir` is O(1) (an `Arc` bump); every mutating method
/// consumes `&self` and returns a new `KeyDir` sharing all unchanged nodes
/// with the original, so a reader that cloned a `KeyDir` before a write
/// keeps observing the pre-write state indefinitely.
#[derive(Clone)]
pub struct KeyDir {
    root: tree::Link,
    len: usize,
}

impl Default for KeyDir {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl KeyDir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Item> {
        tree::get(&self.root, key).copied()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn insert(&self, key: &[u8], value: Item) -> Self {
        let (new_root, is_new) = tree::insert(&self.root, key, value);
        Self { root: Some(new_root), len: if is_new { self.len + 1 } else { self.len } }
    }

    #[must_use]
    pub fn delete(&self, key: &[u8]) -> Self {
        let (new_root, removed) = tree::delete(&self.root, key);
        Self { root: new_root, len: if removed { self.len - 1 } else { self.len } }
    }

    /// In-order walk over every entry. The visitor returns `true` to stop
    /// early; the return value of `walk` itself reports whether it was
    /// stopped, never an error (callbacks plumb their own errors via a
    /// captured slot, per §4.3).
    pub fn walk(&self, mut visitor: impl FnMut(&[u8], &Item) -> bool) -> bool {
        tree::walk(&self.root, &mut visitor)
    }

    pub fn walk_prefix(&self, prefix: &[u8], mut visitor: impl FnMut(&[u8], &Item) -> bool) -> bool {
        tree::walk_prefix(&self.root, prefix, &mut visitor)
    }

    pub fn walk_range(&self, start: &[u8], end: &[u8], mut visitor: impl FnMut(&[u8], &Item) -> bool) -> bool {
        tree::walk_range(&self.root, start, end, &mut visitor)
    }

    pub fn iterator(&self) -> Cursor {
        Cursor(tree::Cursor::new(&self.root, false))
    }

    pub fn reverse_iterator(&self) -> Cursor {
        Cursor(tree::Cursor::new(&self.root, true))
    }

    pub fn seek_prefix(&self, prefix: &[u8], reverse: bool) -> Cursor {
        Cursor(tree::Cursor::seek_prefix(&self.root, prefix, reverse))
    }

    /// Opens a transaction handle that accumulates mutations against this
    /// snapshot and yields a new `KeyDir` on commit (§4.3, §4.7).
    pub fn txn(&self) -> Txn {
        Txn { keydir: self.clone() }
    }

    /// Recomputes `len` by a full traversal; used only by tests and the
    /// index-snapshot loader as a cross-check.
    #[cfg(test)]
    fn recount(&self) -> usize {
        tree::count(&self.root)
    }
}

/// A snapshot cursor positioned by [`KeyDir::iterator`],
/// [`KeyDir::reverse_iterator`], or [`KeyDir::seek_prefix`]. Unaffected by
/// subsequent writes to the directory it was created from.
pub struct Cursor(tree::Cursor);

impl Iterator for Cursor {
    type Item = (Vec<u8>, Item);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// A mutable handle over a `KeyDir` snapshot that accumulates in-place
/// mutations and produces a new root on [`Txn::commit`] (§4.3).
pub struct Txn {
    keydir: KeyDir,
}

impl Txn {
    pub fn get(&self, key: &[u8]) -> Option<Item> {
        self.keydir.get(key)
    }

    pub fn insert(&mut self, key: &[u8], value: Item) {
        self.keydir = self.keydir.insert(key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.keydir = self.keydir.delete(key);
    }

    pub fn commit(self) -> KeyDir {
        self.keydir
    }
}
