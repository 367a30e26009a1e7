use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::config::{Compression, Options, ReadOptions, WriteOptions, NUM_LEVELS};
use crate::batch::WriteBatch;
use crate::Error;

use super::Db;

fn small_options() -> Options {
    Options::new()
        .create_if_missing(true)
        .write_buffer_size(64 * 1024)
        .compression(Compression::None)
}

fn open(dir: &TempDir, options: Options) -> Db {
    Db::open(options, dir.path()).expect("failed to open database")
}

fn put(db: &Db, key: &[u8], value: &[u8]) {
    db.put(&WriteOptions::new(), key, value).expect("put failed");
}

fn get(db: &Db, key: &[u8]) -> Option<Vec<u8>> {
    db.get(&ReadOptions::new(), key).expect("get failed")
}

fn num_files_at_level(db: &Db, level: usize) -> usize {
    db.property(&format!("num-files-at-level{level}"))
        .unwrap()
        .parse()
        .unwrap()
}

fn total_table_files(db: &Db) -> usize {
    (0..NUM_LEVELS).map(|l| num_files_at_level(db, l)).sum()
}

/// Seeds every level with a small [a..z]-spanning file so later flushes
/// stay at level 0.
fn fill_levels(db: &Db, smallest: &[u8], largest: &[u8]) {
    for _ in 0..NUM_LEVELS {
        put(db, smallest, b"begin");
        put(db, largest, b"end");
        db.flush_memtable().unwrap();
    }
}

fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_open_honors_create_flags() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        Db::open(Options::new(), dir.path()),
        Err(Error::NotFound(_))
    ));

    let db = open(&dir, Options::new().create_if_missing(true));
    drop(db);

    assert!(matches!(
        Db::open(
            Options::new().create_if_missing(true).error_if_exists(true),
            dir.path()
        ),
        Err(Error::InvalidArgument(_))
    ));

    // Plain reopen works.
    let _db = Db::open(Options::new(), dir.path()).unwrap();
}

#[test]
fn test_second_open_blocked_by_lock() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    assert!(matches!(
        Db::open(Options::new(), dir.path()),
        Err(Error::Io(_))
    ));
    drop(db);
    let _db = Db::open(Options::new(), dir.path()).unwrap();
}

#[test]
fn test_put_get_delete() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());

    assert_eq!(get(&db, b"foo"), None);
    put(&db, b"foo", b"v1");
    assert_eq!(get(&db, b"foo"), Some(b"v1".to_vec()));
    put(&db, b"foo", b"v2");
    assert_eq!(get(&db, b"foo"), Some(b"v2".to_vec()));
    db.delete(&WriteOptions::new(), b"foo").unwrap();
    assert_eq!(get(&db, b"foo"), None);
    // Deleting an absent key is fine.
    db.delete(&WriteOptions::new(), b"never-there").unwrap();
}

#[test]
fn test_empty_key_and_value() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    put(&db, b"", b"empty-key");
    put(&db, b"empty-value", b"");
    assert_eq!(get(&db, b""), Some(b"empty-key".to_vec()));
    assert_eq!(get(&db, b"empty-value"), Some(Vec::new()));
    db.flush_memtable().unwrap();
    assert_eq!(get(&db, b""), Some(b"empty-key".to_vec()));
    assert_eq!(get(&db, b"empty-value"), Some(Vec::new()));
}

#[test]
fn test_long_keys_and_large_values() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    let long_key = vec![b'k'; 250];
    let big_value = vec![b'v'; 300 * 1024];
    put(&db, &long_key, &big_value);
    assert_eq!(get(&db, &long_key), Some(big_value.clone()));
    db.flush_memtable().unwrap();
    assert_eq!(get(&db, &long_key), Some(big_value));
}

#[test]
fn test_get_from_all_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());

    put(&db, b"table-key", b"from-table");
    db.flush_memtable().unwrap();
    assert!(total_table_files(&db) >= 1);
    put(&db, b"mem-key", b"from-mem");

    assert_eq!(get(&db, b"table-key"), Some(b"from-table".to_vec()));
    assert_eq!(get(&db, b"mem-key"), Some(b"from-mem".to_vec()));
    // Newer memtable write shadows the flushed value.
    put(&db, b"table-key", b"updated");
    assert_eq!(get(&db, b"table-key"), Some(b"updated".to_vec()));
}

#[test]
fn test_write_batch_is_atomic_unit() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    put(&db, b"baz", b"old");

    let mut batch = WriteBatch::new();
    batch.put(b"foo", b"f");
    batch.put(b"bar", b"b");
    batch.delete(b"baz");
    db.write(&WriteOptions::new(), batch).unwrap();

    assert_eq!(get(&db, b"foo"), Some(b"f".to_vec()));
    assert_eq!(get(&db, b"bar"), Some(b"b".to_vec()));
    assert_eq!(get(&db, b"baz"), None);

    // Survives recovery as a unit.
    drop(db);
    let db = open(&dir, small_options());
    assert_eq!(get(&db, b"foo"), Some(b"f".to_vec()));
    assert_eq!(get(&db, b"bar"), Some(b"b".to_vec()));
    assert_eq!(get(&db, b"baz"), None);
}

#[test]
fn test_reopen_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    put(&db, b"k1", b"v1");
    put(&db, b"k2", b"v2");
    db.flush_memtable().unwrap();
    put(&db, b"k3", b"v3");
    drop(db);

    for _ in 0..3 {
        let db = open(&dir, small_options());
        assert_eq!(get(&db, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(get(&db, b"k2"), Some(b"v2".to_vec()));
        assert_eq!(get(&db, b"k3"), Some(b"v3".to_vec()));
        drop(db);
    }
}

#[test]
fn test_recovery_across_wal_rotation() {
    let dir = tempfile::tempdir().unwrap();
    // Default-sized buffer; the 10MB value forces rotation mid-stream.
    let db = open(
        &dir,
        Options::new()
            .create_if_missing(true)
            .compression(Compression::None),
    );
    let big1 = vec![b'x'; 10_000_000];
    let big2 = vec![b'y'; 1000];
    put(&db, b"foo", b"v1");
    put(&db, b"big1", &big1);
    put(&db, b"big2", &big2);
    put(&db, b"bar", b"v2");
    drop(db);

    let db = open(&dir, Options::new());
    assert_eq!(get(&db, b"foo"), Some(b"v1".to_vec()));
    assert_eq!(get(&db, b"bar"), Some(b"v2".to_vec()));
    assert_eq!(get(&db, b"big1"), Some(big1));
    assert_eq!(get(&db, b"big2"), Some(big2));
}

#[test]
fn test_snapshot_layering() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());

    put(&db, b"foo", b"v1");
    let s1 = db.snapshot();
    put(&db, b"foo", b"v2");
    let s2 = db.snapshot();
    put(&db, b"foo", b"v3");
    let s3 = db.snapshot();
    put(&db, b"foo", b"v4");

    let at = |snapshot: &crate::snapshot::Snapshot| {
        db.get(&ReadOptions::new().snapshot(snapshot.clone()), b"foo")
            .unwrap()
    };
    assert_eq!(at(&s1), Some(b"v1".to_vec()));
    assert_eq!(at(&s2), Some(b"v2".to_vec()));
    assert_eq!(at(&s3), Some(b"v3".to_vec()));
    assert_eq!(get(&db, b"foo"), Some(b"v4".to_vec()));

    db.release_snapshot(s3);
    assert_eq!(at(&s1), Some(b"v1".to_vec()));
    assert_eq!(at(&s2), Some(b"v2".to_vec()));
    assert_eq!(get(&db, b"foo"), Some(b"v4".to_vec()));

    db.release_snapshot(s1);
    assert_eq!(at(&s2), Some(b"v2".to_vec()));
    assert_eq!(get(&db, b"foo"), Some(b"v4".to_vec()));

    db.release_snapshot(s2);
    assert_eq!(get(&db, b"foo"), Some(b"v4".to_vec()));
}

#[test]
fn test_snapshot_survives_flush_and_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    put(&db, b"k", b"v1");
    let snap = db.snapshot();
    put(&db, b"k", b"v2");
    db.flush_memtable().unwrap();
    db.compact_range(None, None).unwrap();

    assert_eq!(
        db.get(&ReadOptions::new().snapshot(snap.clone()), b"k").unwrap(),
        Some(b"v1".to_vec())
    );
    assert_eq!(get(&db, b"k"), Some(b"v2".to_vec()));
    db.release_snapshot(snap);
}

#[test]
fn test_iterator_order_and_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    let keys: Vec<String> = (0..200).map(|i| format!("key{i:04}")).collect();
    // Insert shuffled; half before a flush, half after.
    let mut shuffled = keys.clone();
    let mut rng = StdRng::seed_from_u64(7);
    for i in (1..shuffled.len()).rev() {
        shuffled.swap(i, rng.gen_range(0..=i));
    }
    for (i, key) in shuffled.iter().enumerate() {
        put(&db, key.as_bytes(), format!("v{i}").as_bytes());
        if i == 100 {
            db.flush_memtable().unwrap();
        }
    }

    let mut iter = db.iter(ReadOptions::new()).unwrap();
    let mut forward = Vec::new();
    iter.seek_to_first();
    while iter.valid() {
        forward.push(iter.key().to_vec());
        iter.next();
    }
    let expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
    assert_eq!(forward, expected);
    iter.status().unwrap();

    let mut backward = Vec::new();
    iter.seek_to_last();
    while iter.valid() {
        backward.push(iter.key().to_vec());
        iter.prev();
    }
    backward.reverse();
    assert_eq!(backward, expected);
}

#[test]
fn test_iterator_hides_deletions_and_respects_seek() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    put(&db, b"a", b"1");
    put(&db, b"b", b"2");
    put(&db, b"c", b"3");
    db.delete(&WriteOptions::new(), b"b").unwrap();

    let mut iter = db.iter(ReadOptions::new()).unwrap();
    iter.seek(b"a");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"a");
    iter.next();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"c", "deleted key must be skipped");
    iter.next();
    assert!(!iter.valid());

    // Seeking into the tombstone lands on the next live key.
    iter.seek(b"b");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"c");

    // Reverse across the tombstone.
    iter.seek_to_last();
    assert_eq!(iter.key(), b"c");
    iter.prev();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"a");
    iter.prev();
    assert!(!iter.valid());
}

#[test]
fn test_iterator_pins_its_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    put(&db, b"a", b"old-a");
    put(&db, b"m", b"old-m");

    let mut iter = db.iter(ReadOptions::new()).unwrap();
    put(&db, b"a", b"new-a");
    put(&db, b"z", b"late-arrival");
    db.delete(&WriteOptions::new(), b"m").unwrap();

    iter.seek_to_first();
    assert_eq!(iter.key(), b"a");
    assert_eq!(iter.value(), b"old-a");
    iter.next();
    assert_eq!(iter.key(), b"m", "later delete is invisible");
    assert_eq!(iter.value(), b"old-m");
    iter.next();
    assert!(!iter.valid(), "later insert is invisible");
}

#[test]
fn test_hidden_values_removed_by_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(
        &dir,
        Options::new()
            .create_if_missing(true)
            .compression(Compression::None),
    );
    fill_levels(&db, b"a", b"z");
    // Let the level-0 backlog drain so the flush below is the only
    // level-0 resident.
    wait_until(|| num_files_at_level(&db, 0) < crate::config::L0_COMPACTION_TRIGGER - 1);

    let big = vec![b'x'; 50_000];
    put(&db, b"foo", &big);
    put(&db, b"pastfoo", b"v");
    let snap = db.snapshot();
    put(&db, b"foo", b"tiny");
    put(&db, b"pastfoo2", b"v2");
    db.flush_memtable().unwrap();

    // Both versions of foo are on disk while the snapshot lives.
    let entries = db.all_entries(b"foo").unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], b"tiny");
    assert_eq!(entries[1], big);
    let sizes = db.approximate_sizes(&[(b"", b"pastfoo")]).unwrap();
    assert!(sizes[0] >= 50_000, "big value should dominate: {}", sizes[0]);

    db.release_snapshot(snap);
    db.compact_range_at_level(0, None, Some(b"x")).unwrap();
    db.compact_range_at_level(1, None, Some(b"x")).unwrap();
    assert_eq!(db.all_entries(b"foo").unwrap(), vec![b"tiny".to_vec()]);

    let sizes = db.approximate_sizes(&[(b"", b"pastfoo")]).unwrap();
    assert!(sizes[0] < 1000, "hidden value not reclaimed: {}", sizes[0]);
}

#[test]
fn test_deletion_collapse_across_base_level() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());

    // v1 pushes to the deepest memtable-output level.
    put(&db, b"foo", b"v1");
    db.flush_memtable().unwrap();
    let last = crate::config::MAX_MEM_COMPACT_LEVEL;
    assert_eq!(num_files_at_level(&db, last), 1);

    // An [a..z] file lands one level up.
    put(&db, b"a", b"begin");
    put(&db, b"z", b"end");
    db.flush_memtable().unwrap();
    assert_eq!(num_files_at_level(&db, last - 1), 1);

    // The tombstone + v2 stay at level 0 (they overlap [a..z]).
    db.delete(&WriteOptions::new(), b"foo").unwrap();
    put(&db, b"foo", b"v2");
    db.flush_memtable().unwrap();
    assert_eq!(num_files_at_level(&db, 0), 1);
    assert_eq!(
        db.all_entries(b"foo").unwrap(),
        vec![b"v2".to_vec(), b"DEL".to_vec(), b"v1".to_vec()]
    );

    // Compacting 0 -> 1 drops the shadowed tombstone but must keep v1,
    // which still lives deeper.
    db.compact_range_at_level(last - 2, None, Some(b"z")).unwrap();
    assert_eq!(
        db.all_entries(b"foo").unwrap(),
        vec![b"v2".to_vec(), b"v1".to_vec()]
    );
    assert_eq!(get(&db, b"foo"), Some(b"v2".to_vec()));

    // Merging into the base level collapses to the single live value.
    db.compact_range_at_level(last - 1, None, Some(b"z")).unwrap();
    assert_eq!(db.all_entries(b"foo").unwrap(), vec![b"v2".to_vec()]);
    assert_eq!(get(&db, b"foo"), Some(b"v2".to_vec()));
}

#[test]
fn test_wal_sync_failure_poisons_writes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    let faults = db.fail_points();

    faults.set_wal_sync_error(true);
    // Non-sync writes do not touch fsync and still succeed.
    db.put(&WriteOptions::new().sync(false), b"k1", b"v1").unwrap();
    // The first sync write fails and latches the database.
    assert!(db.put(&WriteOptions::new().sync(true), b"k2", b"v2").is_err());

    faults.set_wal_sync_error(false);
    // Still poisoned after the fault clears.
    assert!(db.put(&WriteOptions::new().sync(false), b"k3", b"v3").is_err());

    assert_eq!(get(&db, b"k1"), Some(b"v1".to_vec()));
    assert_eq!(get(&db, b"k2"), None);
    assert_eq!(get(&db, b"k3"), None);

    // Reopen clears the latch.
    drop(db);
    let db = open(&dir, small_options());
    assert_eq!(get(&db, b"k1"), Some(b"v1".to_vec()));
    put(&db, b"k3", b"v3");
    assert_eq!(get(&db, b"k3"), Some(b"v3".to_vec()));
}

#[test]
fn test_manifest_failure_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());

    put(&db, b"foo", b"bar");
    db.flush_memtable().unwrap();
    assert_eq!(get(&db, b"foo"), Some(b"bar".to_vec()));

    // Build overlap so a merging compaction has inputs.
    put(&db, b"a", b"1");
    put(&db, b"zz", b"2");
    db.flush_memtable().unwrap();
    put(&db, b"foo", b"bar2");
    db.flush_memtable().unwrap();

    let faults = db.fail_points();
    faults.set_manifest_write_error(true);
    let result = db.compact_range_at_level(0, None, None);
    assert!(result.is_err(), "compaction should fail with manifest fault");
    assert_eq!(get(&db, b"foo"), Some(b"bar2".to_vec()));
    faults.set_manifest_write_error(false);
    assert_eq!(get(&db, b"foo"), Some(b"bar2".to_vec()));

    drop(db);
    let db = open(&dir, small_options());
    assert_eq!(get(&db, b"foo"), Some(b"bar2".to_vec()));
    assert_eq!(get(&db, b"a"), Some(b"1".to_vec()));
}

#[test]
fn test_level0_trigger_starts_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    // Overlapping level-0 files past the trigger.
    for round in 0..6 {
        put(&db, b"a", format!("a{round}").as_bytes());
        put(&db, b"z", format!("z{round}").as_bytes());
        db.flush_memtable().unwrap();
    }
    wait_until(|| num_files_at_level(&db, 0) < crate::config::L0_COMPACTION_TRIGGER);
    assert_eq!(get(&db, b"a"), Some(b"a5".to_vec()));
    assert_eq!(get(&db, b"z"), Some(b"z5".to_vec()));
}

#[test]
fn test_levels_stay_disjoint_under_load() {
    use crate::comparator::Comparator;
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    let mut rng = StdRng::seed_from_u64(42);
    for i in 0..4000u32 {
        let key = format!("key{:06}", rng.gen_range(0..10_000u32));
        let value = vec![b'v'; rng.gen_range(10..500)];
        put(&db, key.as_bytes(), &value);
        if i % 500 == 499 {
            db.flush_memtable().unwrap();
        }
    }
    db.compact_range(None, None).unwrap();

    let state = db.inner.state.lock().unwrap();
    let version = state.versions.current();
    let icmp = &db.inner.icmp;
    for level in 1..NUM_LEVELS {
        for pair in version.files[level].windows(2) {
            assert_eq!(
                icmp.compare(pair[0].largest.data(), pair[1].smallest.data()),
                std::cmp::Ordering::Less,
                "files overlap at level {level}"
            );
        }
    }
}

#[test]
fn test_randomized_against_model() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xa5a5);

    for step in 0..3000 {
        let key = format!("k{:03}", rng.gen_range(0..250u32)).into_bytes();
        if rng.gen_bool(0.75) {
            let value = format!("v{step}").into_bytes();
            put(&db, &key, &value);
            model.insert(key, value);
        } else {
            db.delete(&WriteOptions::new(), &key).unwrap();
            model.remove(&key);
        }
        if rng.gen_bool(0.01) {
            db.flush_memtable().unwrap();
        }
        if rng.gen_bool(0.05) {
            let probe = format!("k{:03}", rng.gen_range(0..250u32)).into_bytes();
            assert_eq!(get(&db, &probe), model.get(&probe).cloned(), "step {step}");
        }
    }

    // Full scan agrees with the model in both directions.
    let mut iter = db.iter(ReadOptions::new()).unwrap();
    iter.seek_to_first();
    let mut scanned = Vec::new();
    while iter.valid() {
        scanned.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(scanned, expected);

    // And survives a reopen unchanged.
    drop(iter);
    drop(db);
    let db = open(&dir, small_options());
    for (key, value) in &model {
        assert_eq!(get(&db, key), Some(value.clone()));
    }
}

#[test]
fn test_compaction_preserves_snapshot_reads() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    for i in 0..50 {
        put(&db, format!("key{i:03}").as_bytes(), b"first");
    }
    let snap = db.snapshot();
    for i in 0..50 {
        put(&db, format!("key{i:03}").as_bytes(), b"second");
    }
    db.flush_memtable().unwrap();
    db.compact_range(None, None).unwrap();

    let snap_opts = ReadOptions::new().snapshot(snap.clone());
    for i in 0..50 {
        let key = format!("key{i:03}");
        assert_eq!(
            db.get(&snap_opts, key.as_bytes()).unwrap(),
            Some(b"first".to_vec()),
            "snapshot read changed by compaction for {key}"
        );
        assert_eq!(get(&db, key.as_bytes()), Some(b"second".to_vec()));
    }
    db.release_snapshot(snap);
}

#[test]
fn test_reuse_logs_keeps_memtable() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options().reuse_logs(true));
    put(&db, b"alpha", b"1");
    put(&db, b"beta", b"2");
    drop(db);

    let db = open(&dir, small_options().reuse_logs(true));
    assert_eq!(get(&db, b"alpha"), Some(b"1".to_vec()));
    assert_eq!(get(&db, b"beta"), Some(b"2".to_vec()));
    // Nothing was forced to disk to answer those reads.
    assert_eq!(total_table_files(&db), 0);

    put(&db, b"gamma", b"3");
    drop(db);
    let db = open(&dir, small_options().reuse_logs(true));
    assert_eq!(get(&db, b"alpha"), Some(b"1".to_vec()));
    assert_eq!(get(&db, b"gamma"), Some(b"3".to_vec()));
}

#[test]
fn test_property_queries() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    assert_eq!(num_files_at_level(&db, 0), 0);

    let usage_before: usize = db
        .property("approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    put(&db, b"some-key", &vec![b'x'; 4096]);
    let usage_after: usize = db
        .property("approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    assert!(usage_after > usage_before);

    put(&db, b"a", b"1");
    put(&db, b"z", b"2");
    db.flush_memtable().unwrap();
    assert_eq!(total_table_files(&db), 1);

    assert!(db.property("stats").is_some());
    assert!(db.property("sstables").unwrap().contains("level"));
    assert!(db.property("nonsense").is_none());
    assert!(db.property("num-files-at-level99").is_none());
}

#[test]
fn test_compact_range_squashes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    for i in 0..300 {
        put(&db, format!("key{i:04}").as_bytes(), &vec![b'v'; 200]);
        if i % 60 == 59 {
            db.flush_memtable().unwrap();
        }
    }
    db.delete(&WriteOptions::new(), b"key0000").unwrap();
    db.compact_range(None, None).unwrap();

    assert_eq!(num_files_at_level(&db, 0), 0);
    assert_eq!(get(&db, b"key0000"), None);
    assert_eq!(get(&db, b"key0123"), Some(vec![b'v'; 200]));
    // The tombstone is fully collapsed once everything reached the base.
    assert!(db.all_entries(b"key0000").unwrap().is_empty());
}

#[test]
fn test_obsolete_files_are_collected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, small_options());
    for round in 0..5 {
        for i in 0..50 {
            put(&db, format!("key{i:03}").as_bytes(), format!("v{round}").as_bytes());
        }
        db.flush_memtable().unwrap();
    }
    db.compact_range(None, None).unwrap();

    // Every table file on disk must be referenced by the live version.
    let state = db.inner.state.lock().unwrap();
    let mut referenced = std::collections::HashSet::new();
    let version = state.versions.current();
    for files in &version.files {
        for file in files {
            referenced.insert(file.number);
        }
    }
    drop(state);

    for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
        let name = entry.file_name();
        let name = name.to_str().unwrap();
        if let Some((crate::filenames::FileType::Table, number)) =
            crate::filenames::parse_file_name(name)
        {
            assert!(
                referenced.contains(&number),
                "unreferenced table file {name} left on disk"
            );
        }
    }
}

#[test]
fn test_writes_block_and_recover_under_l0_pressure() {
    let dir = tempfile::tempdir().unwrap();
    // Tiny buffer: every few writes rotate a memtable, leaning on the
    // slowdown/stop machinery while compaction keeps up.
    let db = open(
        &dir,
        Options::new()
            .create_if_missing(true)
            .write_buffer_size(4 * 1024)
            .compression(Compression::None),
    );
    for i in 0..400u32 {
        put(&db, format!("key{i:05}").as_bytes(), &vec![b'p'; 512]);
    }
    for i in (0..400u32).step_by(37) {
        assert_eq!(
            get(&db, format!("key{i:05}").as_bytes()),
            Some(vec![b'p'; 512])
        );
    }
}

#[test]
fn test_ordered_write_visibility() {
    // Writes acknowledged before a get must be visible to it (no
    // snapshot supplied).
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(open(&dir, small_options()));
    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            for i in 0..500u32 {
                db.put(
                    &WriteOptions::new(),
                    b"counter",
                    i.to_string().as_bytes(),
                )
                .unwrap();
            }
        })
    };
    let mut last_seen = -1i64;
    while !writer.is_finished() {
        if let Some(value) = get(&db, b"counter") {
            let seen: i64 = String::from_utf8(value).unwrap().parse().unwrap();
            assert!(seen >= last_seen, "counter went backwards");
            last_seen = seen;
        }
    }
    writer.join().unwrap();
    assert_eq!(get(&db, b"counter"), Some(b"499".to_vec()));
}

#[test]
fn test_concurrent_readers_and_writer() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(open(&dir, small_options()));
    for i in 0..100 {
        put(&db, format!("stable{i:03}").as_bytes(), b"fixed");
    }

    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            for i in 0..1000u32 {
                db.put(
                    &WriteOptions::new(),
                    format!("churn{:03}", i % 50).as_bytes(),
                    &vec![b'c'; 128],
                )
                .unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|seed| {
            let db = db.clone();
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..500 {
                    let key = format!("stable{:03}", rng.gen_range(0..100u32));
                    assert_eq!(
                        db.get(&ReadOptions::new(), key.as_bytes()).unwrap(),
                        Some(b"fixed".to_vec())
                    );
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}
