//! Serializes and deserializes the key directory to a sidecar `index` file
//! for fast restart (§4.4).
//!
//! ```text
//! [ key_size : u32 BE ][ key_bytes ]
//! [ file_id : u32 BE ][ offset : u64 BE ][ size : u64 BE ]
//! ```
//! repeated until EOF. Save writes to `temp_index` then atomically renames
//! it to `index`; the rename is the commit point. Load failures are
//! classified as index corruption (never surfaced to the caller): the
//! engine falls back to rebuilding from data files instead of aborting
//! open.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, IndexCorruption, Result};
use crate::keydir::{Item, KeyDir};

const INDEX_FILE: &str = "index";
const TEMP_INDEX_FILE: &str = "temp_index";

/// Writes `keydir` to `<dir>/temp_index`, then atomically renames it to
/// `<dir>/index`.
pub fn save(dir: &Path, keydir: &KeyDir) -> Result<()> {
    let temp_path = dir.join(TEMP_INDEX_FILE);
    {
        let file = File::create(&temp_path)?;
        let mut w = BufWriter::new(file);
        // `walk`'s visitor only returns "stop now"; an I/O error during the
        // write is captured here and re-raised once the walk halts (§4.3).
        let mut failure: Option<Error> = None;
        keydir.walk(|key, item| match write_entry(&mut w, key, item) {
            Ok(()) => false,
            Err(e) => {
                failure = Some(e);
                true
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        w.flush()?;
    }
    fs::rename(&temp_path, dir.join(INDEX_FILE))?;
    Ok(())
}

fn write_entry(w: &mut impl Write, key: &[u8], item: &Item) -> Result<()> {
    w.write_all(&(key.len() as u32).to_be_bytes())?;
    w.write_all(key)?;
    w.write_all(&(item.file_id as u32).to_be_bytes())?;
    w.write_all(&(item.offset as u64).to_be_bytes())?;
    w.write_all(&(item.size as u64).to_be_bytes())?;
    Ok(())
}

/// Loads `<dir>/index`. Returns `Ok(None)` if no snapshot file exists.
/// Returns `Err(Error::Index(_))` on any corruption — callers should treat
/// that as "rebuild from data files", not as a hard error.
pub fn load(dir: &Path, max_key_size: u32) -> Result<Option<KeyDir>> {
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path)?;
    let mut r = BufReader::new(file);
    let mut keydir = KeyDir::new();

    loop {
        let mut key_size_buf = [0u8; 4];
        let n = read_partial(&mut r, &mut key_size_buf)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(IndexCorruption::TruncatedKeySize.into());
        }
        let key_size = u32::from_be_bytes(key_size_buf);
        if key_size > max_key_size {
            return Err(IndexCorruption::KeySizeTooLarge.into());
        }
        let mut key = vec![0u8; key_size as usize];
        r.read_exact(&mut key).map_err(|_| IndexCorruption::TruncatedKeyData)?;

        let mut item_buf = [0u8; 4 + 8 + 8];
        r.read_exact(&mut item_buf).map_err(|_| IndexCorruption::TruncatedItem)?;
        let file_id = u32::from_be_bytes(item_buf[0..4].try_into().unwrap()) as i32;
        let offset = u64::from_be_bytes(item_buf[4..12].try_into().unwrap()) as i64;
        let size = u64::from_be_bytes(item_buf[12..20].try_into().unwrap()) as i64;

        keydir = keydir.insert(&key, Item { file_id, offset, size });
    }
    Ok(Some(keydir))
}

fn read_partial(r: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_index_returns_none() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path(), 64).unwrap().is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut kd = KeyDir::new();
        kd = kd.insert(b"a", Item { file_id: 0, offset: 10, size: 20 });
        kd = kd.insert(b"b", Item { file_id: 1, offset: 30, size: 5 });
        save(dir.path(), &kd).unwrap();

        assert!(!dir.path().join(TEMP_INDEX_FILE).exists());
        assert!(dir.path().join(INDEX_FILE).exists());

        let loaded = load(dir.path(), 64).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(b"a"), Some(Item { file_id: 0, offset: 10, size: 20 }));
        assert_eq!(loaded.get(b"b"), Some(Item { file_id: 1, offset: 30, size: 5 }));
    }

    #[test]
    fn truncated_key_data_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"short");
        fs::write(&path, &buf).unwrap();

        let err = load(dir.path(), 64).unwrap_err();
        assert!(matches!(err, Error::Index(IndexCorruption::TruncatedKeyData)));
    }

    #[test]
    fn oversized_key_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_be_bytes());
        fs::write(&path, &buf).unwrap();

        let err = load(dir.path(), 64).unwrap_err();
        assert!(matches!(err, Error::Index(IndexCorruption::KeySizeTooLarge)));
    }
}
