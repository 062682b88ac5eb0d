//! Encodes and decodes a single [`Entry`] to/from the data-file wire format.
//!
//! ```text
//! [ key_size   : u32 BE ]
//! [ value_size : u64 BE ]
//! [ key_bytes  : key_size ]
//! [ value_bytes: value_size ]
//! [ checksum   : u32 BE ]   // CRC-32/IEEE of value_bytes
//! ```

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Size in bytes of the fixed header (`key_size` + `value_size`).
pub const HEADER_SIZE: usize = 4 + 8;
/// Size in bytes of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 4;
/// Total framing overhead around the key/value payload of an entry.
pub const META_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// A single record: a key, a value, and the CRC-32 of the value.
///
/// A zero-length `value` with no separate flag is the tombstone marker
/// (§4.1): the wire format cannot distinguish "delete" from "put empty
/// value".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub checksum: u32,
}

impl Entry {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&value);
        Self { key, value, checksum }
    }

    /// True for the tombstone encoding: an empty value.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Total serialized length of this entry.
    pub fn encoded_len(&self) -> usize {
        META_OVERHEAD + self.key.len() + self.value.len()
    }
}

/// Writes `entry` to `w` and returns the number of bytes written.
pub fn encode<W: Write>(w: &mut W, entry: &Entry) -> Result<usize> {
    let key_size = entry.key.len() as u32;
    let value_size = entry.value.len() as u64;

    w.write_all(&key_size.to_be_bytes())?;
    w.write_all(&value_size.to_be_bytes())?;
    w.write_all(&entry.key)?;
    w.write_all(&entry.value)?;
    w.write_all(&entry.checksum.to_be_bytes())?;

    Ok(entry.encoded_len())
}

/// Reads and decodes the next entry from `r`.
///
/// Returns `(entry, bytes_consumed)`. The checksum is parsed but **not**
/// verified here; verification is the reader's responsibility once the
/// value bytes are in hand (§4.1), so the decoder stays cheap during index
/// rebuild.
pub fn decode<R: Read>(r: &mut R, max_key_size: u32, max_value_size: u64) -> Result<(Entry, usize)> {
    let mut header = [0u8; HEADER_SIZE];
    let n = read_partial(r, &mut header)?;
    if n == 0 {
        return Err(Error::StopIteration);
    }
    if n < HEADER_SIZE {
        return Err(Error::ShortHeader);
    }

    let key_size = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let value_size = u64::from_be_bytes(header[4..12].try_into().unwrap());

    if key_size == 0 || key_size > max_key_size || value_size > max_value_size {
        return Err(Error::InvalidSize);
    }

    let mut key = vec![0u8; key_size as usize];
    let mut value = vec![0u8; value_size as usize];
    let mut checksum_buf = [0u8; CHECKSUM_SIZE];

    r.read_exact(&mut key).map_err(truncated)?;
    r.read_exact(&mut value).map_err(truncated)?;
    r.read_exact(&mut checksum_buf).map_err(truncated)?;

    let checksum = u32::from_be_bytes(checksum_buf);
    let consumed = HEADER_SIZE + key_size as usize + value_size as usize + CHECKSUM_SIZE;
    Ok((Entry { key, value, checksum }, consumed))
}

/// Decodes an entry whose header has already been parsed by the caller
/// (e.g. when reading by offset via an `Item`): `buffer` holds exactly
/// `key_size + value_size + CHECKSUM_SIZE` bytes, with no leading header.
pub fn decode_at(buffer: &[u8], key_size: usize) -> Result<Entry> {
    if buffer.len() < key_size + CHECKSUM_SIZE {
        return Err(Error::Truncated);
    }
    let key = buffer[..key_size].to_vec();
    let value = buffer[key_size..buffer.len() - CHECKSUM_SIZE].to_vec();
    let checksum_bytes = &buffer[buffer.len() - CHECKSUM_SIZE..];
    let checksum = u32::from_be_bytes(checksum_bytes.try_into().unwrap());
    Ok(Entry { key, value, checksum })
}

/// Verifies `entry.checksum` against a fresh CRC-32 of `entry.value`.
pub fn verify_checksum(entry: &Entry) -> Result<()> {
    if crc32fast::hash(&entry.value) != entry.checksum {
        return Err(Error::ChecksumFailed);
    }
    Ok(())
}

/// Like `Read::read_exact`, but returns the number of bytes actually read
/// instead of erroring on a short read, so the caller can distinguish a
/// clean EOF (zero bytes consumed) from a partial header (a hard error).
fn read_partial<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn truncated(_: io::Error) -> Error {
    Error::Truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let entry = Entry::new(b"hello".to_vec(), b"world".to_vec());
        let mut buf = Vec::new();
        let n = encode(&mut buf, &entry).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(n, entry.encoded_len());

        let mut cursor = &buf[..];
        let (decoded, consumed) = decode(&mut cursor, 64, 1 << 16).unwrap();
        assert_eq!(consumed, n);
        assert_eq!(decoded, entry);
        verify_checksum(&decoded).unwrap();
    }

    #[test]
    fn tombstone_round_trip() {
        let entry = Entry::new(b"deleted".to_vec(), Vec::new());
        assert!(entry.is_tombstone());
        let mut buf = Vec::new();
        encode(&mut buf, &entry).unwrap();
        let mut cursor = &buf[..];
        let (decoded, _) = decode(&mut cursor, 64, 1 << 16).unwrap();
        assert!(decoded.is_tombstone());
    }

    #[test]
    fn empty_stream_is_stop_iteration() {
        let mut cursor: &[u8] = &[];
        let err = decode(&mut cursor, 64, 1 << 16).unwrap_err();
        assert!(matches!(err, Error::StopIteration));
    }

    #[test]
    fn partial_header_is_short_header() {
        let mut cursor: &[u8] = &[0, 0, 0, 5, 0, 0];
        let err = decode(&mut cursor, 64, 1 << 16).unwrap_err();
        assert!(matches!(err, Error::ShortHeader));
    }

    #[test]
    fn oversized_key_is_invalid_size() {
        let entry = Entry::new(vec![0u8; 100], b"v".to_vec());
        let mut buf = Vec::new();
        encode(&mut buf, &entry).unwrap();
        let mut cursor = &buf[..];
        let err = decode(&mut cursor, 64, 1 << 16).unwrap_err();
        assert!(matches!(err, Error::InvalidSize));
    }

    #[test]
    fn truncated_value_is_truncated() {
        let entry = Entry::new(b"k".to_vec(), b"some-value".to_vec());
        let mut buf = Vec::new();
        encode(&mut buf, &entry).unwrap();
        buf.truncate(buf.len() - 3);
        let mut cursor = &buf[..];
        let err = decode(&mut cursor, 64, 1 << 16).unwrap_err();
        assert!(matches!(err, Error::Truncated));
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut entry = Entry::new(b"k".to_vec(), b"v".to_vec());
        entry.checksum ^= 0xFFFF_FFFF;
        assert!(verify_checksum(&entry).is_err());
    }

    #[test]
    fn decode_at_slices_without_reparsing_header() {
        let entry = Entry::new(b"key".to_vec(), b"value".to_vec());
        let mut buf = Vec::new();
        encode(&mut buf, &entry).unwrap();
        let payload = &buf[HEADER_SIZE..];
        let decoded = decode_at(payload, entry.key.len()).unwrap();
        assert_eq!(decoded, entry);
    }
}
