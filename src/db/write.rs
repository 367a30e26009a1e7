//! The write path: FIFO writer queue with group commit.
//!
//! Writers park themselves on the queue; the front writer becomes the
//! group leader, absorbs compatible followers into one batch, reserves
//! the sequence range, and performs the log append + memtable insert
//! with the mutex released. Followers wake to find their work done and
//! share the leader's status.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::batch::WriteBatch;
use crate::config::{
    Options, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
};
use crate::error::Result;
use crate::filenames::{log_file_name, table_file_name};
use crate::keys::InternalKeyComparator;
use crate::memtable::MemTable;
use crate::sstable::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::set::VersionSet;
use crate::version::{Version, VersionEdit};
use crate::wal::LogWriter;
use crate::Error;

use super::{DbInner, DbState};

/// Max bytes a write group may grow to.
const MAX_WRITE_GROUP_SIZE: usize = 1 << 20;
/// Small writes cap group growth so a tiny write is not delayed behind a
/// megabyte of piggybacked work.
const SMALL_WRITE_SLACK: usize = 128 << 10;

pub(crate) struct Writer {
    /// `None` for the flush marker that only forces memtable rotation.
    pub batch: Option<WriteBatch>,
    pub sync: bool,
    pub done: bool,
    pub status: Option<Result<()>>,
}

pub(crate) type WriterRef = Arc<Mutex<Writer>>;

/// Commits `batch` (or just forces room when `batch` is `None`).
pub(crate) fn write(
    inner: &Arc<DbInner>,
    wopts: &WriteOptions,
    batch: Option<WriteBatch>,
) -> Result<()> {
    let force = batch.is_none();
    let me: WriterRef = Arc::new(Mutex::new(Writer {
        batch,
        sync: wopts.sync,
        done: false,
        status: None,
    }));

    let mut state = inner.state.lock()?;
    state.writers.push_back(me.clone());
    loop {
        {
            let writer = me.lock()?;
            if writer.done {
                return writer.status.clone().unwrap_or(Ok(()));
            }
        }
        if state
            .writers
            .front()
            .is_some_and(|front| Arc::ptr_eq(front, &me))
        {
            break;
        }
        state = inner.cv.wait(state)?;
    }

    // This writer is now the group leader.
    let (mut state, room) = make_room_for_write(inner, state, force);
    let mut status = room;
    let mut last_writer = me.clone();

    if status.is_ok() && !force {
        let last_sequence = state.versions.last_sequence();
        let (group, group_last) = build_batch_group(&mut state, &me);
        let mut group = group;
        last_writer = group_last;
        group.set_sequence(last_sequence + 1);
        let count = group.count() as u64;

        // Log and apply with the mutex released; leadership keeps other
        // writers out, and concurrent readers see the memtable grow only
        // below the published sequence.
        let mut log = state.log.take().expect("log writer present");
        let mem = state.mem.clone();
        let sync = me.lock()?.sync;
        drop(state);

        let mut sync_error = false;
        let mut write_status = log.add_record(group.contents());
        if write_status.is_ok() && sync {
            write_status = if inner.fail_points.wal_sync_enabled() {
                Err(Error::Io("simulated log sync failure".to_string()))
            } else {
                log.sync()
            };
            if write_status.is_err() {
                sync_error = true;
            }
        }
        if write_status.is_ok() {
            write_status = group.insert_into(&mem);
        }

        state = inner.state.lock()?;
        state.log = Some(log);
        state.versions.set_last_sequence(last_sequence + count);
        if sync_error {
            // The log may be half-written; every future write must fail
            // until the database is reopened and the tail truncated by
            // replay.
            let error = write_status.clone().unwrap_err();
            inner.record_background_error(&mut state, error);
        }
        status = write_status;
    }

    // Pop the whole group, handing each member the shared status.
    loop {
        let front = state.writers.pop_front().expect("group member present");
        let is_last = Arc::ptr_eq(&front, &last_writer);
        if !Arc::ptr_eq(&front, &me) {
            let mut writer = front.lock()?;
            writer.done = true;
            writer.status = Some(status.clone());
        }
        if is_last {
            break;
        }
    }
    inner.cv.notify_all();
    status
}

/// Absorbs queued writers behind the leader into one batch, bounded by
/// size and sync compatibility. Returns the combined batch and the last
/// absorbed writer.
fn build_batch_group(state: &mut DbState, leader: &WriterRef) -> (WriteBatch, WriterRef) {
    let leader_guard = leader.lock().unwrap();
    let leader_sync = leader_guard.sync;
    let mut result = leader_guard.batch.clone().expect("leader has a batch");
    drop(leader_guard);

    let mut max_size = MAX_WRITE_GROUP_SIZE;
    if result.approximate_size() <= SMALL_WRITE_SLACK {
        max_size = result.approximate_size() + SMALL_WRITE_SLACK;
    }

    let mut size = result.approximate_size();
    let mut last = leader.clone();
    for candidate in state.writers.iter().skip(1) {
        let writer = candidate.lock().unwrap();
        if writer.sync && !leader_sync {
            // A sync write must not ride a non-sync commit.
            break;
        }
        if let Some(batch) = &writer.batch {
            size += batch.approximate_size();
            if size > max_size {
                break;
            }
            result.append(batch);
        }
        last = candidate.clone();
    }
    (result, last)
}

/// Ensures the memtable can absorb the next write, stalling or rotating
/// as needed. Runs with the mutex held; sleeps and waits release it.
fn make_room_for_write<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
    mut force: bool,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    let mut allow_delay = !force;
    loop {
        if let Some(error) = state.background_error.clone() {
            return (state, Err(error));
        }
        if allow_delay && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER {
            // Soft stall: give the compactor a millisecond per write
            // instead of stopping the world when level 0 fills.
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            allow_delay = false;
            state = match inner.state.lock() {
                Ok(guard) => guard,
                Err(e) => return (e.into_inner(), Err(Error::Io("poisoned lock".to_string()))),
            };
            continue;
        }
        if !force
            && state.mem.approximate_memory_usage() <= inner.options.write_buffer_size
        {
            return (state, Ok(()));
        }
        if state.imm.is_some() {
            // Previous rotation still flushing.
            tracing::debug!("write stalled waiting for memtable flush");
            state = inner.cv.wait(state).unwrap();
            continue;
        }
        if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
            tracing::warn!("write stalled: too many level-0 files");
            state = inner.cv.wait(state).unwrap();
            continue;
        }

        // Rotate: seal the current memtable behind a fresh log.
        let new_log_number = state.versions.new_file_number();
        let log = match LogWriter::create(&log_file_name(&inner.path, new_log_number)) {
            Ok(log) => log,
            Err(e) => {
                state.versions.reuse_file_number(new_log_number);
                return (state, Err(e));
            }
        };
        state.log = Some(log);
        state.log_file_number = new_log_number;
        let old_mem = std::mem::replace(
            &mut state.mem,
            Arc::new(MemTable::new(inner.icmp.clone())),
        );
        state.imm = Some(old_mem);
        inner
            .has_imm
            .store(true, std::sync::atomic::Ordering::Release);
        force = false;
        inner.maybe_schedule_compaction(&mut state);
    }
}

/// Builds a table from a memtable and records it in `edit`, choosing the
/// deepest safe level when a base version is provided (flush path) and
/// level 0 otherwise (recovery path).
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_level0_table(
    path: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
    table_cache: &Arc<TableCache>,
    versions: &mut VersionSet,
    mem: &Arc<MemTable>,
    base: Option<&Version>,
    edit: &mut VersionEdit,
) -> Result<()> {
    let file_number = versions.new_file_number();
    versions.pending_outputs.insert(file_number);

    let result = build_table_file(path, options, icmp, table_cache, file_number, mem);

    versions.pending_outputs.remove(&file_number);
    match result {
        Ok(Some((file_size, smallest, largest))) => {
            let smallest = crate::keys::InternalKey::decoded_from(&smallest);
            let largest = crate::keys::InternalKey::decoded_from(&largest);
            let level = match base {
                Some(base) => base
                    .pick_level_for_memtable_output(smallest.user_key(), largest.user_key()),
                None => 0,
            };
            tracing::info!(
                file = file_number,
                size = file_size,
                level,
                "level-0 table build finished"
            );
            edit.add_file(level, file_number, file_size, smallest, largest);
            Ok(())
        }
        Ok(None) => {
            // Nothing to write; hand the number back.
            versions.reuse_file_number(file_number);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(table_file_name(path, file_number));
            Err(e)
        }
    }
}

/// Serializes a memtable into table file `file_number`. Returns `None`
/// for an empty memtable, else the file size and its key range. Pure
/// file work; callers hold no locks.
pub(crate) fn build_table_file(
    path: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
    table_cache: &Arc<TableCache>,
    file_number: u64,
    mem: &Arc<MemTable>,
) -> Result<Option<(u64, Vec<u8>, Vec<u8>)>> {
    use crate::iterator::Iter;

    let mut iter = mem.iter();
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }
    tracing::info!(file = file_number, "table build started");
    let file_path = table_file_name(path, file_number);
    let file = File::create(&file_path)?;
    let mut builder = TableBuilder::new(options.clone(), icmp.clone(), file)?;
    let smallest = iter.key().to_vec();
    let mut largest = Vec::new();
    while iter.valid() {
        largest.clear();
        largest.extend_from_slice(iter.key());
        builder.add(iter.key(), iter.value())?;
        iter.next();
    }
    let file_size = builder.finish()?;
    // Confirm the result is readable before publishing it.
    table_cache.find_table(file_number, file_size)?;
    tracing::info!(file = file_number, size = file_size, "table build finished");
    Ok(Some((file_size, smallest, largest)))
}
