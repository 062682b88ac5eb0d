//! End-to-end coverage of the engine's public surface: the scenarios and
//! testable properties around open/read/write/rotate/merge/recover.

use std::fs::{self, OpenOptions};
use std::io::Write;

use caskdb::{Db, Error, Options};

fn open(dir: &std::path::Path) -> Db {
    Db::open(dir, Options::new()).unwrap()
}

/// S1: Open empty dir -> Put -> Get -> Len -> Delete -> Get(KeyNotFound) -> Close.
#[test]
fn s1_basic_put_get_delete() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());

    db.put(b"foo", b"bar").unwrap();
    assert_eq!(db.get(b"foo").unwrap(), b"bar");
    assert_eq!(db.len(), 1);

    db.delete(b"foo").unwrap();
    assert!(matches!(db.get(b"foo").unwrap_err(), Error::KeyNotFound));
    assert_eq!(db.len(), 0);

    db.close().unwrap();
}

/// S2: reclaimable-space accounting after an overwrite and two deletes, one
/// of an existing key and one of an absent key.
#[test]
fn s2_reclaimable_space_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());

    db.put(b"hello", b"world").unwrap();
    assert_eq!(db.stats().unwrap().reclaimable, 0);

    db.put(b"hello", b"world").unwrap();
    assert_eq!(db.stats().unwrap().reclaimable, 26);

    db.delete(b"hello").unwrap();
    assert_eq!(db.stats().unwrap().reclaimable, 73);

    db.delete(b"hello1").unwrap();
    assert_eq!(db.stats().unwrap().reclaimable, 73);

    db.merge().unwrap();
    assert_eq!(db.stats().unwrap().reclaimable, 0);

    db.close().unwrap();
}

/// S3: repeated puts over a tiny `max_datafile_size` rotate the active
/// file; merge then compacts the file set down without losing the key.
#[test]
fn s3_rotation_then_merge_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path(), Options::new().max_datafile_size(32)).unwrap();

    for _ in 0..11 {
        db.put(b"foo", b"bar").unwrap();
    }
    let before = db.stats().unwrap();
    assert_eq!(before.keys, 1);
    assert!(before.datafiles >= 2, "expected rotation to have produced multiple sealed files");

    db.merge().unwrap();
    let after = db.stats().unwrap();
    assert_eq!(after.keys, 1);
    assert_eq!(after.reclaimable, 0);
    assert!(
        after.datafiles < before.datafiles,
        "merge should reduce the sealed file count: before={before:?} after={after:?}"
    );
    assert_eq!(db.get(b"foo").unwrap(), b"bar");

    db.close().unwrap();
}

/// S4: Scan visits exactly the keys matching a prefix; Range visits
/// exactly the inclusive lexicographic window.
#[test]
fn s4_scan_and_range() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());

    for k in ["1", "2", "3", "foo", "food", "fooz", "hello"] {
        db.put(k.as_bytes(), k.as_bytes()).unwrap();
    }
    let mut scanned = Vec::new();
    db.scan(b"fo", |k, _| {
        scanned.push(String::from_utf8(k.to_vec()).unwrap());
        Ok(())
    })
    .unwrap();
    scanned.sort();
    assert_eq!(scanned, vec!["foo", "food", "fooz"]);

    for i in 1..=9 {
        db.put(format!("foo_{i}").as_bytes(), b"v").unwrap();
    }
    let mut ranged = Vec::new();
    db.range(b"foo_3", b"foo_7", |k, _| {
        ranged.push(String::from_utf8(k.to_vec()).unwrap());
        Ok(())
    })
    .unwrap();
    assert_eq!(ranged, vec!["foo_3", "foo_4", "foo_5", "foo_6", "foo_7"]);

    db.close().unwrap();
}

/// S5: a truncated trailing record is recovered away on reopen with
/// `AutoRecovery`, and every other key survives intact.
#[test]
fn s5_crash_recovery_truncates_incomplete_tail() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        for i in 0..10 {
            db.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        db.close().unwrap();
    }

    let data_path = dir.path().join("000000000.data");
    let full_len = fs::metadata(&data_path).unwrap().len();
    let f = OpenOptions::new().write(true).open(&data_path).unwrap();
    f.set_len(full_len - 1).unwrap();
    drop(f);

    let db = Db::open(dir.path(), Options::new().auto_recovery(true)).unwrap();
    assert!(matches!(db.get(b"k9").unwrap_err(), Error::KeyNotFound));
    for i in 0..9 {
        assert_eq!(db.get(format!("k{i}").as_bytes()).unwrap(), format!("v{i}").as_bytes());
    }
    db.close().unwrap();
}

/// S6: disjoint-prefix concurrent writers converge to the union of their
/// writes with no error.
#[test]
fn s6_concurrent_disjoint_prefix_writers() {
    use std::sync::Arc;
    use std::thread;

    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(open(dir.path()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = db.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("t{t}-k{i}");
                    db.put(key.as_bytes(), key.as_bytes()).unwrap();
                    assert_eq!(db.get(key.as_bytes()).unwrap(), key.as_bytes());
                }
                let mut seen = 0;
                db.scan(format!("t{t}-").as_bytes(), |_, _| {
                    seen += 1;
                    Ok(())
                })
                .unwrap();
                assert_eq!(seen, 50);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(db.len(), 200);
}

/// Property 3 + 4: restart and index-rebuild equivalence.
#[test]
fn restart_and_index_rebuild_equivalence() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        for i in 0..20 {
            db.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        db.delete(b"k3").unwrap();
        db.close().unwrap();
    }

    let reopened = open(dir.path());
    assert_eq!(reopened.len(), 19);
    assert!(matches!(reopened.get(b"k3").unwrap_err(), Error::KeyNotFound));
    for i in (0..20).filter(|&i| i != 3) {
        assert_eq!(reopened.get(format!("k{i}").as_bytes()).unwrap(), format!("v{i}").as_bytes());
    }
    reopened.close().unwrap();

    fs::remove_file(dir.path().join("index")).unwrap();
    let rebuilt = open(dir.path());
    assert_eq!(rebuilt.len(), 19);
    for i in (0..20).filter(|&i| i != 3) {
        assert_eq!(rebuilt.get(format!("k{i}").as_bytes()).unwrap(), format!("v{i}").as_bytes());
    }
    rebuilt.close().unwrap();
}

/// Property 6: forward/reverse iteration order.
#[test]
fn iteration_order_is_strictly_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    for k in ["foo", "bar", "baz", "qux", "aardvark"] {
        db.put(k.as_bytes(), k.as_bytes()).unwrap();
    }

    let mut forward = Vec::new();
    let mut it = db.iterator(false);
    loop {
        match it.next() {
            Ok((k, _)) => forward.push(k),
            Err(Error::StopIteration) => break,
            Err(e) => panic!("{e}"),
        }
    }
    let mut sorted = forward.clone();
    sorted.sort();
    assert_eq!(forward, sorted);

    let mut reverse = Vec::new();
    let mut it = db.iterator(true);
    loop {
        match it.next() {
            Ok((k, _)) => reverse.push(k),
            Err(Error::StopIteration) => break,
            Err(e) => panic!("{e}"),
        }
    }
    let mut expected_reverse = sorted.clone();
    expected_reverse.reverse();
    assert_eq!(reverse, expected_reverse);
}

/// Property 7: key/value size bounds and the empty-key rejection.
#[test]
fn size_bounds_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path(), Options::new().max_key_size(4).max_value_size(4)).unwrap();

    assert!(matches!(db.put(b"", b"v").unwrap_err(), Error::EmptyKey));
    assert!(matches!(db.put(b"toolong", b"v").unwrap_err(), Error::KeyTooLarge));
    assert!(matches!(db.put(b"ok", b"toolong").unwrap_err(), Error::ValueTooLarge));
    db.put(b"ok", b"ok").unwrap();
}

/// Property 8: a flipped byte inside the value region is caught by the
/// checksum on the next read.
#[test]
fn checksum_enforcement_on_flipped_value_byte() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.put(b"k", b"value").unwrap();
    db.sync().unwrap();

    let data_path = dir.path().join("000000000.data");
    let mut bytes = fs::read(&data_path).unwrap();
    // Header is 12 bytes, then the 1-byte key, then the 5-byte value.
    let value_region_start = 12 + 1;
    bytes[value_region_start] ^= 0xFF;
    fs::write(&data_path, &bytes).unwrap();

    let err = db.get(b"k").unwrap_err();
    assert!(matches!(err, Error::ChecksumFailed));
}

/// Property 9: a second open of the same path is locked out, including
/// across a successful merge on the first handle.
#[test]
fn exclusive_open_across_merge() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.put(b"a", b"1").unwrap();

    let err = Db::open(dir.path(), Options::new()).unwrap_err();
    assert!(matches!(err, Error::DatabaseLocked));

    db.merge().unwrap();

    let err = Db::open(dir.path(), Options::new()).unwrap_err();
    assert!(matches!(err, Error::DatabaseLocked));

    db.close().unwrap();
    // Now that the lock is released, a fresh open succeeds.
    let reopened = Db::open(dir.path(), Options::new()).unwrap();
    assert_eq!(reopened.get(b"a").unwrap(), b"1");
}

/// Property 10: `Range` rejects an inverted window before invoking the
/// callback at all.
#[test]
fn range_rejects_inverted_window() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.put(b"m", b"v").unwrap();

    let mut called = false;
    let err = db
        .range(b"z", b"a", |_, _| {
            called = true;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRange));
    assert!(!called);
}

/// `AutoReadonly`: a second open under contention falls back to a readonly
/// handle instead of erroring, and rejects writes.
#[test]
fn auto_readonly_open_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.put(b"a", b"1").unwrap();

    let reader = Db::open(dir.path(), Options::new().auto_readonly(true)).unwrap();
    assert_eq!(reader.get(b"a").unwrap(), b"1");
    assert!(matches!(reader.put(b"b", b"2").unwrap_err(), Error::DatabaseReadonly));
}

/// Backup copies every file except the lock into a fresh directory that a
/// brand-new `Db::open` can read back.
#[test]
fn backup_is_independently_openable() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let db = open(src.path());
    for i in 0..5 {
        db.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
    }
    db.backup(dst.path()).unwrap();
    db.close().unwrap();

    let restored = Db::open(dst.path(), Options::new()).unwrap();
    for i in 0..5 {
        assert_eq!(restored.get(format!("k{i}").as_bytes()).unwrap(), format!("v{i}").as_bytes());
    }
}

/// `Batch`/`Write`: entries apply in order, not all-or-nothing.
#[test]
fn batch_write_applies_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.put(b"a", b"old").unwrap();

    let mut batch = caskdb::Batch::new();
    batch.put(b"a".to_vec(), b"new".to_vec());
    batch.put(b"b".to_vec(), b"2".to_vec());
    batch.delete(b"a".to_vec());
    db.write_batch(&batch).unwrap();

    assert!(matches!(db.get(b"a").unwrap_err(), Error::KeyNotFound));
    assert_eq!(db.get(b"b").unwrap(), b"2");
}

#[test]
fn for_each_visits_every_live_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    for i in 0..10 {
        db.put(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    db.delete(b"k5").unwrap();

    let mut count = 0;
    db.for_each(|_, _| {
        count += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 9);
}
