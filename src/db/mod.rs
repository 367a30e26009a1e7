//! The database façade.
//!
//! `Db` ties the pieces together: writes funnel through a FIFO writer
//! queue into the write-ahead log and memtable; reads resolve against
//! the memtables and the current version; one background thread flushes
//! immutable memtables and runs compactions.
//!
//! A single mutex guards all mutable state (`DbState`); one condition
//! variable is signalled at every state change, and writers, stalls,
//! manual compactions, and the background worker all wait on it. Bulk
//! I/O (log appends, table builds, compaction merges) happens with the
//! mutex released; only manifest edits are applied under it.

mod compact;
mod iter;
#[cfg(test)]
mod tests;
mod write;

pub use iter::DbIterator;

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::batch::WriteBatch;
use crate::config::{Options, ReadOptions, WriteOptions, NUM_LEVELS};
use crate::error::Result;
use crate::filenames::{current_file_name, log_file_name, set_current_file};
use crate::flock::DbLock;
use crate::keys::{InternalKeyComparator, LookupKey};
use crate::memtable::{MemGet, MemTable};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table_cache::TableCache;
use crate::version::set::VersionSet;
use crate::version::version::VersionGet;
use crate::version::VersionEdit;
use crate::wal::{LogReader, LogWriter};
use crate::Error;

/// Test-only failure injection switches consulted by the WAL-sync and
/// manifest-write paths.
#[derive(Default)]
pub(crate) struct FailPoints {
    wal_sync: AtomicBool,
    manifest_write: AtomicBool,
}

impl FailPoints {
    pub(crate) fn set_wal_sync_error(&self, enabled: bool) {
        self.wal_sync.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn wal_sync_enabled(&self) -> bool {
        self.wal_sync.load(Ordering::SeqCst)
    }

    pub(crate) fn set_manifest_write_error(&self, enabled: bool) {
        self.manifest_write.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn manifest_write_enabled(&self) -> bool {
        self.manifest_write.load(Ordering::SeqCst)
    }
}

/// Background worker lifecycle; transitions happen under the mutex and
/// every change signals the shared condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackgroundState {
    Idle,
    Scheduled,
    Running,
}

/// A requested manual compaction of one level, resumed in bounded slices.
pub(crate) struct ManualCompaction {
    pub level: usize,
    pub done: bool,
    pub begin: Option<crate::keys::InternalKey>,
    pub end: Option<crate::keys::InternalKey>,
    /// First failure, handed back to the waiting caller.
    pub error: Option<Error>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub(crate) struct DbState {
    pub mem: Arc<MemTable>,
    pub imm: Option<Arc<MemTable>>,
    pub log: Option<LogWriter>,
    pub log_file_number: u64,
    pub versions: VersionSet,
    pub snapshots: SnapshotList,
    pub writers: VecDeque<write::WriterRef>,
    pub background_state: BackgroundState,
    pub background_error: Option<Error>,
    pub manual_compaction: Option<ManualCompaction>,
    pub stats: [CompactionStats; NUM_LEVELS],
}

pub(crate) struct DbInner {
    pub options: Arc<Options>,
    pub icmp: InternalKeyComparator,
    pub path: PathBuf,
    pub table_cache: Arc<TableCache>,
    pub fail_points: Arc<FailPoints>,
    pub state: Mutex<DbState>,
    /// Signalled at every state change; writers, stalls, and the
    /// background worker all wait here.
    pub cv: Condvar,
    /// Fast path for the compaction loop to notice a pending memtable
    /// flush without taking the mutex every key.
    pub has_imm: AtomicBool,
    pub shutting_down: AtomicBool,
    _lock: DbLock,
}

/// An open database. Cloneable handles are not provided; share a `Db`
/// behind an `Arc` if multiple threads need it (all methods take
/// `&self`).
pub struct Db {
    inner: Arc<DbInner>,
    bg_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Db {
    /// Opens (or creates) the database at `path`, holding its directory
    /// lock until the handle drops.
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Db> {
        let options = Arc::new(options);
        let path = path.as_ref().to_path_buf();
        let icmp = InternalKeyComparator::new(options.comparator.clone());

        fs::create_dir_all(&path)?;
        let lock = DbLock::acquire(&path)?;

        let fail_points = Arc::new(FailPoints::default());
        let table_cache = Arc::new(TableCache::new(
            path.clone(),
            options.clone(),
            icmp.clone(),
        ));
        let mut versions = VersionSet::new(
            path.clone(),
            options.clone(),
            icmp.clone(),
            fail_points.clone(),
        );

        let current_exists = current_file_name(&path).exists();
        if !current_exists {
            if !options.create_if_missing {
                return Err(Error::NotFound(format!(
                    "{}: does not exist (create_if_missing is false)",
                    path.display()
                )));
            }
            bootstrap_new_db(&path, &icmp)?;
            tracing::info!(path = %path.display(), "created new database");
        } else if options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                path.display()
            )));
        }

        versions.recover()?;

        // Replay every log the manifest still depends on, oldest first.
        let mut edit = VersionEdit::new();
        let mut max_sequence = 0u64;
        let mut recovered = RecoveredMemtable::default();
        let log_numbers = collect_recovery_logs(&path, &versions)?;
        for (i, &number) in log_numbers.iter().enumerate() {
            let is_last = i + 1 == log_numbers.len();
            replay_log_file(
                &path,
                &options,
                &icmp,
                &table_cache,
                &mut versions,
                number,
                is_last,
                &mut edit,
                &mut max_sequence,
                &mut recovered,
            )?;
            // Recovered sequences may be ahead of the manifest.
            versions.mark_file_number_used(number);
        }
        if versions.last_sequence() < max_sequence {
            versions.set_last_sequence(max_sequence);
        }

        // Install the write front: either the log kept by `reuse_logs` or
        // a fresh one.
        let (mem, log, log_file_number) = match recovered.reusable.take() {
            Some((mem, log, number)) => (mem, log, number),
            None => {
                if let Some(mem) = recovered.pending.take() {
                    write::write_level0_table(
                        &path, &options, &icmp, &table_cache, &mut versions, &mem, None, &mut edit,
                    )?;
                }
                let number = versions.new_file_number();
                let log = LogWriter::create(&log_file_name(&path, number))?;
                (
                    Arc::new(MemTable::new(icmp.clone())),
                    log,
                    number,
                )
            }
        };

        edit.set_prev_log_number(0);
        edit.set_log_number(log_file_number);
        versions.log_and_apply(&mut edit)?;

        let inner = Arc::new(DbInner {
            options,
            icmp,
            path,
            table_cache,
            fail_points,
            state: Mutex::new(DbState {
                mem,
                imm: None,
                log: Some(log),
                log_file_number,
                versions,
                snapshots: SnapshotList::default(),
                writers: VecDeque::new(),
                background_state: BackgroundState::Idle,
                background_error: None,
                manual_compaction: None,
                stats: [CompactionStats::default(); NUM_LEVELS],
            }),
            cv: Condvar::new(),
            has_imm: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            _lock: lock,
        });

        {
            let mut state = inner.state.lock()?;
            compact::remove_obsolete_files(&inner, &mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        let bg_inner = inner.clone();
        let bg_thread = std::thread::Builder::new()
            .name("tephradb-bg".to_string())
            .spawn(move || compact::background_main(bg_inner))
            .map_err(|e| Error::Io(format!("cannot spawn background worker: {e}")))?;

        Ok(Db {
            inner,
            bg_thread: Mutex::new(Some(bg_thread)),
        })
    }

    /// Stores `key -> value`.
    pub fn put(&self, wopts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(wopts, batch)
    }

    /// Removes `key` if present.
    pub fn delete(&self, wopts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(wopts, batch)
    }

    /// Commits a batch atomically.
    pub fn write(&self, wopts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        write::write(&self.inner, wopts, Some(batch))
    }

    /// Reads the newest value visible at the chosen snapshot.
    pub fn get(&self, ropts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (sequence, mem, imm, version) = {
            let state = self.inner.state.lock()?;
            (
                ropts
                    .snapshot
                    .as_ref()
                    .map(|s| s.sequence())
                    .unwrap_or_else(|| state.versions.last_sequence()),
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        let lookup = LookupKey::new(key, sequence);
        match mem.get(&lookup) {
            MemGet::Found(value) => return Ok(Some(value)),
            MemGet::Deleted => return Ok(None),
            MemGet::NotFound => {}
        }
        if let Some(imm) = imm {
            match imm.get(&lookup) {
                MemGet::Found(value) => return Ok(Some(value)),
                MemGet::Deleted => return Ok(None),
                MemGet::NotFound => {}
            }
        }

        let (outcome, charge) = version.get(ropts, &lookup, &self.inner.table_cache)?;
        if version.update_stats(charge) {
            let mut state = self.inner.state.lock()?;
            self.inner.maybe_schedule_compaction(&mut state);
        }
        match outcome {
            VersionGet::Found(value) => Ok(Some(value)),
            VersionGet::Deleted | VersionGet::Missing => Ok(None),
        }
    }

    /// Ordered cursor over the user-visible keys at a snapshot fixed now
    /// (or at `ropts.snapshot`).
    pub fn iter(&self, ropts: ReadOptions) -> Result<DbIterator> {
        iter::new_db_iterator(&self.inner, ropts)
    }

    /// Pins the current sequence for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock().unwrap();
        let sequence = state.versions.last_sequence();
        state.snapshots.acquire(sequence)
    }

    /// Releases a pin taken with `snapshot`.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        let mut state = self.inner.state.lock().unwrap();
        state.snapshots.release(&snapshot);
    }

    /// Flushes the memtable, then compacts every level overlapping
    /// `[begin, end]` down the tree.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut max_level_with_files = 1;
        {
            let state = self.inner.state.lock()?;
            let version = state.versions.current();
            for level in 1..NUM_LEVELS {
                if version.some_file_overlaps_range(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }
        self.flush_memtable()?;
        for level in 0..max_level_with_files {
            self.compact_range_at_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Observable engine surface for debugging and tests.
    pub fn property(&self, name: &str) -> Option<String> {
        let state = self.inner.state.lock().ok()?;
        if let Some(rest) = name.strip_prefix("num-files-at-level") {
            let level: usize = rest.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }
        match name {
            "stats" => {
                let mut out = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = state.versions.num_level_files(level);
                    let stats = state.stats[level];
                    if files > 0 || stats.micros > 0 {
                        out.push_str(&format!(
                            "{:>3} {:>8} {:>8.0} {:>9.3} {:>8.2} {:>9.2}\n",
                            level,
                            files,
                            state.versions.num_level_bytes(level) as f64 / 1048576.0,
                            stats.micros as f64 / 1e6,
                            stats.bytes_read as f64 / 1048576.0,
                            stats.bytes_written as f64 / 1048576.0,
                        ));
                    }
                }
                Some(out)
            }
            "sstables" => {
                let version = state.versions.current();
                let mut out = String::new();
                for (level, files) in version.files.iter().enumerate() {
                    out.push_str(&format!("--- level {level} ---\n"));
                    for file in files {
                        out.push_str(&format!(
                            " {}:{}[{:?} .. {:?}]\n",
                            file.number, file.file_size, file.smallest, file.largest
                        ));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let mut total = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /// Approximate on-disk bytes each `[start, limit)` range occupies.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Result<Vec<u64>> {
        let version = {
            let state = self.inner.state.lock()?;
            state.versions.current()
        };
        let mut sizes = Vec::with_capacity(ranges.len());
        for &(start, limit) in ranges {
            let start_key = crate::keys::InternalKey::new(
                start,
                crate::keys::MAX_SEQUENCE,
                crate::keys::ValueType::Value,
            );
            let limit_key = crate::keys::InternalKey::new(
                limit,
                crate::keys::MAX_SEQUENCE,
                crate::keys::ValueType::Value,
            );
            let start_offset = self.approximate_offset(&version, &start_key)?;
            let limit_offset = self.approximate_offset(&version, &limit_key)?;
            sizes.push(limit_offset.saturating_sub(start_offset));
        }
        Ok(sizes)
    }

    fn approximate_offset(
        &self,
        version: &Arc<crate::version::Version>,
        ikey: &crate::keys::InternalKey,
    ) -> Result<u64> {
        use crate::comparator::Comparator;
        let icmp = &self.inner.icmp;
        let mut result = 0u64;
        for (level, files) in version.files.iter().enumerate() {
            for file in files {
                if icmp.compare(file.largest.data(), ikey.data()) != std::cmp::Ordering::Greater {
                    // Entirely before the probe key.
                    result += file.file_size;
                } else if icmp.compare(file.smallest.data(), ikey.data())
                    == std::cmp::Ordering::Greater
                {
                    // Entirely after; deeper files in a sorted level are
                    // too.
                    if level > 0 {
                        break;
                    }
                } else {
                    let table = self
                        .inner
                        .table_cache
                        .find_table(file.number, file.file_size)?;
                    result += table.approximate_offset_of(ikey.data());
                }
            }
        }
        Ok(result)
    }

    /// Forces the current memtable into a level-0 table and waits for the
    /// flush to finish.
    pub(crate) fn flush_memtable(&self) -> Result<()> {
        write::write(&self.inner, &WriteOptions::default(), None)?;
        let mut state = self.inner.state.lock()?;
        while state.imm.is_some() && state.background_error.is_none() {
            state = self.inner.cv.wait(state)?;
        }
        match &state.background_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Schedules a manual compaction of one level and waits for it.
    pub(crate) fn compact_range_at_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        use crate::keys::{InternalKey, ValueType, MAX_SEQUENCE};
        debug_assert!(level + 1 < NUM_LEVELS);

        let manual = ManualCompaction {
            level,
            done: false,
            begin: begin.map(|b| InternalKey::new(b, MAX_SEQUENCE, ValueType::Value)),
            end: end.map(|e| InternalKey::new(e, 0, ValueType::Deletion)),
            error: None,
        };

        let mut state = self.inner.state.lock()?;
        while state.manual_compaction.is_some() {
            state = self.inner.cv.wait(state)?;
        }
        state.manual_compaction = Some(manual);
        self.inner.maybe_schedule_compaction(&mut state);
        loop {
            if self.inner.shutting_down.load(Ordering::Acquire) {
                break;
            }
            if let Some(e) = &state.background_error {
                let e = e.clone();
                state.manual_compaction = None;
                self.inner.cv.notify_all();
                return Err(e);
            }
            match &state.manual_compaction {
                Some(m) if m.done => break,
                Some(_) => state = self.inner.cv.wait(state)?,
                None => break,
            }
        }
        let result = match state.manual_compaction.take().and_then(|m| m.error) {
            Some(e) => Err(e),
            None => Ok(()),
        };
        self.inner.cv.notify_all();
        result
    }

    #[cfg(test)]
    pub(crate) fn fail_points(&self) -> Arc<FailPoints> {
        self.inner.fail_points.clone()
    }

    /// Every stored entry (all sequences) for one user key, newest
    /// first; exercises the raw internal ordering in tests.
    #[cfg(test)]
    pub(crate) fn all_entries(&self, user_key: &[u8]) -> Result<Vec<Vec<u8>>> {
        use crate::iterator::Iter;
        use crate::keys::{extract_user_key, ParsedInternalKey, ValueType};

        let (mut merged, _pins, _seq) = iter::internal_iterator(&self.inner, ReadOptions::new())?;
        let lookup = LookupKey::new(user_key, crate::keys::MAX_SEQUENCE);
        let mut out = Vec::new();
        merged.seek(lookup.internal_key());
        while merged.valid() {
            if extract_user_key(merged.key()) != user_key {
                break;
            }
            let parsed = ParsedInternalKey::parse(merged.key())?;
            match parsed.value_type {
                ValueType::Value => out.push(merged.value().to_vec()),
                ValueType::Deletion => out.push(b"DEL".to_vec()),
            }
            merged.next();
        }
        Ok(out)
    }
}

impl DbInner {
    /// Wakes the worker when there is background work and none is queued.
    pub(crate) fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.background_state != BackgroundState::Idle {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) || state.background_error.is_some() {
            return;
        }
        let manual_pending = state
            .manual_compaction
            .as_ref()
            .is_some_and(|m| !m.done);
        if state.imm.is_none() && !manual_pending && !state.versions.needs_compaction() {
            return;
        }
        state.background_state = BackgroundState::Scheduled;
        self.cv.notify_all();
    }

    /// Latches the first background error; all mutating calls fail with
    /// it until the database is reopened.
    pub(crate) fn record_background_error(&self, state: &mut DbState, error: Error) {
        if state.background_error.is_none() {
            tracing::error!(error = %error, "latching background error");
            state.background_error = Some(error);
            self.cv.notify_all();
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        {
            // Wake everyone; waiting writers bail out on shutdown.
            let _state = self.inner.state.lock();
            self.inner.cv.notify_all();
        }
        if let Some(handle) = self.bg_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Writes the bootstrap manifest + CURRENT for an empty database.
fn bootstrap_new_db(path: &Path, icmp: &InternalKeyComparator) -> Result<()> {
    use crate::comparator::Comparator;
    use crate::filenames::manifest_file_name;

    let mut edit = VersionEdit::new();
    edit.set_comparator_name(icmp.user_comparator().name());
    edit.set_log_number(0);
    edit.set_next_file_number(2);
    edit.set_last_sequence(0);

    let manifest_path = manifest_file_name(path, 1);
    let mut writer = LogWriter::create(&manifest_path)?;
    let mut record = Vec::new();
    edit.encode_to(&mut record);
    let result = writer.add_record(&record).and_then(|_| writer.sync());
    drop(writer);
    match result {
        Ok(()) => set_current_file(path, 1),
        Err(e) => {
            let _ = fs::remove_file(&manifest_path);
            Err(e)
        }
    }
}

/// Log numbers recovery must replay, in order: everything at or after
/// the manifest's log, plus the previous log while a flush was mid-way.
fn collect_recovery_logs(path: &Path, versions: &VersionSet) -> Result<Vec<u64>> {
    use crate::filenames::{parse_file_name, FileType};
    let min_log = versions.log_number();
    let prev_log = versions.prev_log_number();
    let mut numbers = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((FileType::Log, number)) = parse_file_name(name) {
            if number >= min_log || number == prev_log {
                numbers.push(number);
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

#[derive(Default)]
struct RecoveredMemtable {
    /// Memtable with replayed entries not yet flushed.
    pending: Option<Arc<MemTable>>,
    /// Set when `reuse_logs` keeps the final log + memtable alive.
    reusable: Option<(Arc<MemTable>, LogWriter, u64)>,
}

/// Replays one log into memtables, flushing level-0 tables whenever the
/// write buffer fills. Honors `reuse_logs` for the final log.
#[allow(clippy::too_many_arguments)]
fn replay_log_file(
    path: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
    table_cache: &Arc<TableCache>,
    versions: &mut VersionSet,
    number: u64,
    is_last: bool,
    edit: &mut VersionEdit,
    max_sequence: &mut u64,
    recovered: &mut RecoveredMemtable,
) -> Result<()> {
    let log_path = log_file_name(path, number);
    let mut reader = LogReader::open(&log_path)?;
    let mut mem: Option<Arc<MemTable>> = recovered.pending.take();
    let mut compactions = 0;
    let mut clean_tail = true;

    tracing::info!(log = number, "replaying write-ahead log");
    loop {
        let record = match reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                if options.paranoid_checks {
                    return Err(e);
                }
                tracing::warn!(log = number, error = %e, "dropping torn log tail");
                clean_tail = false;
                break;
            }
        };
        let mut batch = WriteBatch::new();
        batch.set_contents(&record)?;

        let mem_ref = mem.get_or_insert_with(|| Arc::new(MemTable::new(icmp.clone())));
        batch.insert_into(mem_ref)?;
        let last_sequence = batch.sequence() + batch.count() as u64 - 1;
        if last_sequence > *max_sequence {
            *max_sequence = last_sequence;
        }

        if mem_ref.approximate_memory_usage() > options.write_buffer_size {
            compactions += 1;
            let full = mem.take().unwrap();
            // Recovery flushes always land at level 0.
            write::write_level0_table(
                path, options, icmp, table_cache, versions, &full, None, edit,
            )?;
        }
    }

    // Keep appending to the final log when allowed and it replayed
    // cleanly without forcing a flush.
    if options.reuse_logs && is_last && compactions == 0 && clean_tail {
        let mem = mem.unwrap_or_else(|| Arc::new(MemTable::new(icmp.clone())));
        if mem.approximate_memory_usage() <= options.write_buffer_size {
            let log = LogWriter::open_for_append(&log_path)?;
            tracing::info!(log = number, "reusing write-ahead log");
            recovered.reusable = Some((mem, log, number));
            return Ok(());
        }
        recovered.pending = Some(mem);
        return Ok(());
    }

    recovered.pending = mem;
    Ok(())
}
