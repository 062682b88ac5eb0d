//! An append-only data file, identified by a monotonically increasing
//! integer id and named `%09d.data` (§4.2, §6).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use memmap2::Mmap;

use crate::codec::{self, Entry};
use crate::error::{Error, Result};

pub fn file_name(id: i32) -> String {
    format!("{id:09}.data")
}

pub fn path_for(dir: &Path, id: i32) -> PathBuf {
    dir.join(file_name(id))
}

/// Parses a `%09d.data` file name back into its id. Returns `None` for any
/// other file name (the caller uses this to filter directory listings).
pub fn parse_id(file_name: &str) -> Option<i32> {
    let stem = file_name.strip_suffix(".data")?;
    if stem.len() != 9 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

enum Backing {
    /// Disk-backed: a writer (absent once sealed readonly) and an mmap
    /// covering the file for random reads. The mmap is remapped whenever
    /// the writer extends the file past the last mapped length.
    OnDisk { writer: Option<File>, mmap: Option<Mmap>, mapped_len: u64 },
    /// Growable in-memory buffer backing transaction staging (`id == -1`).
    /// Never persisted.
    InMemory(Vec<u8>),
}

/// One data file: either the active (writable) file, a sealed readonly
/// file, or the in-memory staging buffer used by a transaction.
pub struct DataFile {
    id: i32,
    path: Option<PathBuf>,
    readonly: bool,
    inner: RwLock<Backing>,
    /// Logical length of the file; updated under `inner`'s write lock so a
    /// returned `(offset, n)` pair from `write` is self-consistent (§4.2,
    /// §5).
    size: RwLock<u64>,
}

impl DataFile {
    /// Opens (creating if necessary) a writable on-disk data file with
    /// the given id.
    pub fn open_writable(dir: &Path, id: i32) -> Result<Arc<Self>> {
        let path = path_for(dir, id);
        let writer = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        let len = writer.metadata()?.len();
        Ok(Arc::new(Self {
            id,
            path: Some(path),
            readonly: false,
            inner: RwLock::new(Backing::OnDisk { writer: Some(writer), mmap: None, mapped_len: 0 }),
            size: RwLock::new(len),
        }))
    }

    /// Opens an existing data file as readonly (random reads only).
    pub fn open_readonly(dir: &Path, id: i32) -> Result<Arc<Self>> {
        let path = path_for(dir, id);
        let file = OpenOptions::new().read(true).open(&path)?;
        let len = file.metadata()?.len();
        let mmap = if len > 0 { Some(unsafe { Mmap::map(&file)? }) } else { None };
        Ok(Arc::new(Self {
            id,
            path: Some(path),
            readonly: true,
            inner: RwLock::new(Backing::OnDisk { writer: None, mmap, mapped_len: len }),
            size: RwLock::new(len),
        }))
    }

    /// Creates a brand-new empty in-memory data file (transaction staging,
    /// `id == -1`).
    pub fn new_in_memory() -> Arc<Self> {
        Arc::new(Self {
            id: -1,
            path: None,
            readonly: false,
            inner: RwLock::new(Backing::InMemory(Vec::new())),
            size: RwLock::new(0),
        })
    }

    /// Returns a sibling handle to this file with writes disabled, sharing
    /// nothing mutable — used when sealing the active file during rotation
    /// or merge (§4.5, §4.6).
    pub fn make_readonly(&self) -> Result<Arc<Self>> {
        let path = self.path.as_ref().expect("make_readonly on in-memory file");
        Self::open_readonly(path.parent().unwrap(), self.id)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> String {
        match &self.path {
            Some(p) => p.file_name().unwrap().to_string_lossy().into_owned(),
            None => format!("<staging:{}>", self.id),
        }
    }

    pub fn size(&self) -> u64 {
        *self.size.read().unwrap()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Appends `entry` and returns `(offset, bytes_written)`.
    pub fn write(&self, entry: &Entry) -> Result<(i64, i64)> {
        if self.readonly {
            return Err(Error::Readonly);
        }
        let mut inner = self.inner.write().unwrap();
        let mut size = self.size.write().unwrap();
        let offset = *size as i64;
        let n = match &mut *inner {
            Backing::OnDisk { writer: Some(w), .. } => {
                let n = codec::encode(w, entry)?;
                w.flush()?;
                n
            }
            Backing::OnDisk { writer: None, .. } => return Err(Error::Readonly),
            Backing::InMemory(buf) => codec::encode(buf, entry)?,
        };
        *size += n as u64;
        Ok((offset, n as i64))
    }

    pub fn sync(&self) -> Result<()> {
        if let Backing::OnDisk { writer: Some(w), .. } = &*self.inner.read().unwrap() {
            w.sync_all()?;
        }
        Ok(())
    }

    /// Reads the entry at `(offset, size)`, where `size` is the on-disk
    /// serialized length of the entire entry (§3).
    pub fn read_at(&self, offset: i64, size: i64) -> Result<Entry> {
        let (offset, size) = (offset as u64, size as usize);
        let mut inner = self.inner.write().unwrap();
        match &mut *inner {
            Backing::OnDisk { mmap, mapped_len, .. } => {
                let file_len = *self.size.read().unwrap();
                if mmap.is_none() || *mapped_len < file_len {
                    let path = self.path.as_ref().unwrap();
                    let file = OpenOptions::new().read(true).open(path)?;
                    *mmap = if file_len > 0 { Some(unsafe { Mmap::map(&file)? }) } else { None };
                    *mapped_len = file_len;
                }
                let map = mmap.as_ref().ok_or(Error::Truncated)?;
                let end = offset as usize + size;
                if end > map.len() {
                    return Err(Error::Truncated);
                }
                decode_entry(&map[offset as usize..end])
            }
            Backing::InMemory(buf) => {
                let end = offset as usize + size;
                if end > buf.len() {
                    return Err(Error::Truncated);
                }
                decode_entry(&buf[offset as usize..end])
            }
        }
    }

    /// Sequentially scans the whole file from the start, invoking
    /// `visitor(entry, offset, bytes_consumed)` for each complete record.
    /// Used for index rebuild and crash recovery (§4.5, §7).
    ///
    /// If the tail of the file is an incomplete record, `visitor` is not
    /// called for it and the byte offset at which it begins is returned in
    /// `Ok(Some(pos))`; a clean end-of-file returns `Ok(None)`.
    pub fn scan(
        &self,
        max_key_size: u32,
        max_value_size: u64,
        mut visitor: impl FnMut(Entry, i64),
    ) -> Result<Option<i64>> {
        let path = self.path.as_ref().expect("scan on in-memory file");
        let file = OpenOptions::new().read(true).open(path)?;
        let mut reader = BufReader::new(file);
        let mut pos: i64 = 0;
        loop {
            match codec::decode(&mut reader, max_key_size, max_value_size) {
                Ok((entry, consumed)) => {
                    visitor(entry, pos);
                    pos += consumed as i64;
                }
                Err(Error::StopIteration) => return Ok(None),
                Err(Error::ShortHeader | Error::Truncated | Error::InvalidSize) => {
                    return Ok(Some(pos));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Truncates the underlying file to `len` bytes (crash recovery, §7).
    pub fn truncate(&self, len: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let mut size = self.size.write().unwrap();
        match &mut *inner {
            Backing::OnDisk { mmap, mapped_len, .. } => {
                let path = self.path.as_ref().unwrap();
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(len as u64)?;
                *mmap = None;
                *mapped_len = 0;
            }
            Backing::InMemory(buf) => buf.truncate(len as usize),
        }
        *size = len as u64;
        Ok(())
    }
}

fn decode_entry(buffer: &[u8]) -> Result<Entry> {
    if buffer.len() < codec::HEADER_SIZE {
        return Err(Error::Truncated);
    }
    let key_size = u32::from_be_bytes(buffer[0..4].try_into().unwrap()) as usize;
    codec::decode_at(&buffer[codec::HEADER_SIZE..], key_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_id_round_trip() {
        assert_eq!(parse_id(&file_name(42)), Some(42));
        assert_eq!(parse_id("index"), None);
        assert_eq!(parse_id("meta.json"), None);
        assert_eq!(parse_id("000000001.data"), Some(1));
    }

    #[test]
    fn write_then_read_at() {
        let dir = tempdir().unwrap();
        let df = DataFile::open_writable(dir.path(), 0).unwrap();
        let entry = Entry::new(b"k".to_vec(), b"v".to_vec());
        let (offset, n) = df.write(&entry).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(df.size(), n as u64);

        let got = df.read_at(offset, n).unwrap();
        assert_eq!(got, entry);
    }

    #[test]
    fn readonly_write_fails() {
        let dir = tempdir().unwrap();
        let df = DataFile::open_writable(dir.path(), 0).unwrap();
        df.write(&Entry::new(b"k".to_vec(), b"v".to_vec())).unwrap();
        let ro = df.make_readonly().unwrap();
        assert!(ro.is_readonly());
        let err = ro.write(&Entry::new(b"k2".to_vec(), b"v2".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Readonly));
    }

    #[test]
    fn scan_reports_truncated_tail() {
        let dir = tempdir().unwrap();
        let path;
        {
            let df = DataFile::open_writable(dir.path(), 0).unwrap();
            df.write(&Entry::new(b"a".to_vec(), b"1".to_vec())).unwrap();
            path = path_for(dir.path(), 0);
        }
        let full_len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full_len - 1).unwrap();
        drop(f);

        let df = DataFile::open_writable(dir.path(), 0).unwrap();
        let mut seen = 0;
        let tail = df.scan(64, 1 << 16, |_, _| seen += 1).unwrap();
        assert_eq!(seen, 0);
        assert_eq!(tail, Some(0));
    }

    #[test]
    fn in_memory_file_round_trip() {
        let df = DataFile::new_in_memory();
        let entry = Entry::new(b"staged".to_vec(), b"value".to_vec());
        let (offset, n) = df.write(&entry).unwrap();
        let got = df.read_at(offset, n).unwrap();
        assert_eq!(got, entry);
    }
}
