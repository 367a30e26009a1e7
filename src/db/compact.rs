//! Background work: memtable flushes, compaction execution, and
//! obsolete-file collection.
//!
//! One worker thread waits on the shared condition variable for the
//! Scheduled state, performs whatever work is pending (an immutable
//! memtable always goes first), and loops. All I/O happens with the
//! mutex released; only planning and result installation hold it.

use std::cmp::Ordering as CmpOrdering;
use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::filenames::{parse_file_name, table_file_name, FileType};
use crate::iterator::Iter;
use crate::keys::{InternalKey, ParsedInternalKey, ValueType};
use crate::sstable::TableBuilder;
use crate::version::{Compaction, VersionEdit};
use crate::Error;

use super::write::build_table_file;
use super::{BackgroundState, DbInner, DbState};

pub(crate) fn background_main(inner: Arc<DbInner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        while !inner.shutting_down.load(Ordering::Acquire)
            && state.background_state != BackgroundState::Scheduled
        {
            state = inner.cv.wait(state).unwrap();
        }
        if inner.shutting_down.load(Ordering::Acquire) {
            break;
        }
        state.background_state = BackgroundState::Running;
        state = background_compaction(&inner, state);
        state.background_state = BackgroundState::Idle;
        // The round may have unlocked more work (or a waiter).
        inner.maybe_schedule_compaction(&mut state);
        inner.cv.notify_all();
    }
}

fn background_compaction<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
) -> MutexGuard<'a, DbState> {
    if state.imm.is_some() {
        return compact_memtable(inner, state);
    }

    let is_manual = state
        .manual_compaction
        .as_ref()
        .is_some_and(|m| !m.done);

    let compaction = if is_manual {
        let (level, begin, end) = {
            let m = state.manual_compaction.as_ref().unwrap();
            (m.level, m.begin.clone(), m.end.clone())
        };
        let compaction = state
            .versions
            .compact_range(level, begin.as_ref(), end.as_ref());
        if compaction.is_none() {
            state.manual_compaction.as_mut().unwrap().done = true;
        } else {
            let range = compaction
                .as_ref()
                .map(|c| (c.inputs[0].len(), c.inputs[1].len()));
            tracing::info!(level, inputs = ?range, "manual compaction slice");
        }
        compaction
    } else {
        state.versions.pick_compaction()
    };

    let mut manual_resume: Option<InternalKey> = None;
    let mut failure: Option<Error> = None;

    match compaction {
        None => {}
        Some(mut c) if !is_manual && c.is_trivial_move() => {
            // Move the file down a level without rewriting it.
            let file = c.input(0, 0).clone();
            c.edit.delete_file(c.level, file.number);
            c.edit.add_file(
                c.level + 1,
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            );
            match state.versions.log_and_apply(&mut c.edit) {
                Ok(()) => {
                    tracing::info!(
                        file = file.number,
                        from = c.level,
                        to = c.level + 1,
                        size = file.file_size,
                        "trivial move"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "trivial move failed");
                    failure = Some(e);
                }
            }
            c.release_inputs();
        }
        Some(c) => {
            // Remember where this slice ends so a manual compaction can
            // resume behind it.
            let resume = c.inputs[0]
                .last()
                .map(|f| f.largest.clone());
            let (new_state, result) = do_compaction_work(inner, state, c);
            state = new_state;
            match result {
                Ok(()) => manual_resume = resume,
                Err(e) => {
                    if !inner.shutting_down.load(Ordering::Acquire) {
                        tracing::warn!(error = %e, "compaction failed; will retry");
                    }
                    failure = Some(e);
                }
            }
        }
    }

    if is_manual {
        // The waiter may have abandoned the request (latched error,
        // shutdown); only report to it if it is still registered.
        if let Some(m) = state.manual_compaction.as_mut() {
            if let Some(e) = failure {
                m.error = Some(e);
                m.done = true;
            } else if !m.done {
                // Compacted a prefix of the range; resume past it.
                m.begin = manual_resume;
            }
        }
        inner.cv.notify_all();
    } else if failure.is_some() && !inner.shutting_down.load(Ordering::Acquire) {
        // Pause before the retry in case the failure is environmental;
        // an immediate reschedule would spin.
        drop(state);
        std::thread::sleep(std::time::Duration::from_millis(100));
        state = inner.state.lock().unwrap();
    }

    state
}

/// Flushes the immutable memtable into a table and retires its log.
pub(crate) fn compact_memtable<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
) -> MutexGuard<'a, DbState> {
    let imm = state.imm.clone().expect("immutable memtable present");
    let base = state.versions.current();
    let log_number = state.log_file_number;
    let file_number = state.versions.new_file_number();
    state.versions.pending_outputs.insert(file_number);
    drop(state);

    let built = build_table_file(
        &inner.path,
        &inner.options,
        &inner.icmp,
        &inner.table_cache,
        file_number,
        &imm,
    );

    let mut state = inner.state.lock().unwrap();
    state.versions.pending_outputs.remove(&file_number);

    let result: Result<()> = match built {
        Ok(Some((file_size, smallest, largest))) => {
            let smallest = InternalKey::decoded_from(&smallest);
            let largest = InternalKey::decoded_from(&largest);
            let level = base.pick_level_for_memtable_output(smallest.user_key(), largest.user_key());
            tracing::info!(file = file_number, level, size = file_size, "memtable flushed");
            let mut edit = VersionEdit::new();
            edit.add_file(level, file_number, file_size, smallest, largest);
            // The sealed log (and anything older) is no longer needed.
            edit.set_prev_log_number(0);
            edit.set_log_number(log_number);
            state.versions.log_and_apply(&mut edit)
        }
        Ok(None) => {
            state.versions.reuse_file_number(file_number);
            let mut edit = VersionEdit::new();
            edit.set_prev_log_number(0);
            edit.set_log_number(log_number);
            state.versions.log_and_apply(&mut edit)
        }
        Err(e) => {
            let _ = std::fs::remove_file(table_file_name(&inner.path, file_number));
            Err(e)
        }
    };

    match result {
        Ok(()) => {
            state.imm = None;
            inner.has_imm.store(false, Ordering::Release);
            remove_obsolete_files(inner, &mut state);
            inner.cv.notify_all();
        }
        Err(e) => {
            inner.record_background_error(&mut state, e);
        }
    }
    state
}

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

struct OutputBuilder {
    builder: TableBuilder,
    number: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

/// Merges the compaction inputs into new tables at `level + 1`,
/// collapsing shadowed entries and dead tombstones, then installs the
/// edit. The mutex is released for the whole merge.
fn do_compaction_work<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
    mut c: Compaction,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    let start = Instant::now();
    tracing::info!(
        level = c.level,
        upper = c.num_input_files(0),
        lower = c.num_input_files(1),
        "compaction started"
    );

    // Entries below every live snapshot can collapse to just the newest.
    let smallest_snapshot = state
        .snapshots
        .oldest()
        .unwrap_or_else(|| state.versions.last_sequence());
    let bytes_read: u64 = c.inputs.iter().flatten().map(|f| f.file_size).sum();

    let mut input = state.versions.make_input_iterator(&c, &inner.table_cache);
    drop(state);

    let ucmp = inner.icmp.user_comparator().clone();
    let mut status: Result<()> = Ok(());
    let mut outputs: Vec<CompactionOutput> = Vec::new();
    let mut allocated_numbers: Vec<u64> = Vec::new();
    let mut current: Option<OutputBuilder> = None;
    let mut last_user_key: Option<Vec<u8>> = None;
    let mut last_sequence_for_key = u64::MAX;

    input.seek_to_first();
    while status.is_ok() && input.valid() {
        if inner.shutting_down.load(Ordering::Acquire) {
            status = Err(Error::Io("database shutting down".to_string()));
            break;
        }

        // A filled memtable outranks the merge; service it mid-stream.
        if inner.has_imm.load(Ordering::Acquire) {
            let guard = inner.state.lock().unwrap();
            let guard = if guard.imm.is_some() {
                compact_memtable(inner, guard)
            } else {
                guard
            };
            drop(guard);
            inner.cv.notify_all();
        }

        // Tracks grandparent overlap even between output files, so the
        // check runs for every key regardless of builder state.
        let key = input.key().to_vec();
        if c.should_stop_before(&key) && current.is_some() {
            finish_output(inner, &mut current, &mut outputs, &mut status);
            if status.is_err() {
                break;
            }
        }

        let mut drop_entry = false;
        match ParsedInternalKey::parse(&key) {
            Err(_) => {
                // Keep unparseable keys; hiding them would mask the
                // corruption from reads.
                last_user_key = None;
                last_sequence_for_key = u64::MAX;
            }
            Ok(ikey) => {
                let first_occurrence = last_user_key
                    .as_deref()
                    .map_or(true, |last| ucmp.compare(ikey.user_key, last) != CmpOrdering::Equal);
                if first_occurrence {
                    last_user_key = Some(ikey.user_key.to_vec());
                    last_sequence_for_key = u64::MAX;
                }

                if last_sequence_for_key <= smallest_snapshot {
                    // A newer entry for this user key is already at or
                    // below the oldest snapshot; nothing can see this one.
                    drop_entry = true;
                } else if ikey.value_type == ValueType::Deletion
                    && ikey.sequence <= smallest_snapshot
                    && c.is_base_level_for_key(ikey.user_key)
                {
                    // Tombstone with nothing left to hide.
                    drop_entry = true;
                }
                last_sequence_for_key = ikey.sequence;
            }
        }

        if !drop_entry {
            if current.is_none() {
                match open_compaction_output(inner, &mut allocated_numbers) {
                    Ok(builder) => current = Some(builder),
                    Err(e) => {
                        status = Err(e);
                        break;
                    }
                }
            }
            let out = current.as_mut().unwrap();
            if out.builder.num_entries() == 0 {
                out.smallest = key.clone();
            }
            out.largest.clear();
            out.largest.extend_from_slice(&key);
            if let Err(e) = out.builder.add(&key, input.value()) {
                status = Err(e);
                break;
            }
            if out.builder.file_size() >= c.max_output_file_size() {
                finish_output(inner, &mut current, &mut outputs, &mut status);
                if status.is_err() {
                    break;
                }
            }
        }

        input.next();
    }

    if status.is_ok() && current.is_some() {
        finish_output(inner, &mut current, &mut outputs, &mut status);
    }
    if status.is_ok() {
        status = input.status();
    }
    if let Some(mut unfinished) = current.take() {
        unfinished.builder.abandon();
    }
    drop(input);

    let bytes_written: u64 = outputs.iter().map(|o| o.file_size).sum();
    let mut state = inner.state.lock().unwrap();
    let stats = &mut state.stats[(c.level + 1).min(crate::config::NUM_LEVELS - 1)];
    stats.micros += start.elapsed().as_micros() as u64;
    stats.bytes_read += bytes_read;
    stats.bytes_written += bytes_written;

    if status.is_ok() {
        status = install_compaction_results(&mut state, &mut c, &outputs);
    }

    for number in &allocated_numbers {
        state.versions.pending_outputs.remove(number);
    }
    if status.is_err() {
        // Partial outputs are garbage; reclaim them now rather than
        // waiting for the next sweep.
        for number in &allocated_numbers {
            inner.table_cache.evict(*number);
            let _ = std::fs::remove_file(table_file_name(&inner.path, *number));
        }
    } else {
        tracing::info!(
            level = c.level,
            outputs = outputs.len(),
            bytes_read,
            bytes_written,
            elapsed_ms = start.elapsed().as_millis() as u64,
            summary = %state.versions.level_summary(),
            "compaction finished"
        );
    }

    // Unpin the input version first so its files count as dead below.
    c.release_inputs();
    remove_obsolete_files(inner, &mut state);
    (state, status)
}

fn open_compaction_output(
    inner: &Arc<DbInner>,
    allocated: &mut Vec<u64>,
) -> Result<OutputBuilder> {
    let number = {
        let mut state = inner.state.lock()?;
        let number = state.versions.new_file_number();
        state.versions.pending_outputs.insert(number);
        number
    };
    allocated.push(number);
    let file = File::create(table_file_name(&inner.path, number))?;
    Ok(OutputBuilder {
        builder: TableBuilder::new(inner.options.clone(), inner.icmp.clone(), file)?,
        number,
        smallest: Vec::new(),
        largest: Vec::new(),
    })
}

fn finish_output(
    inner: &Arc<DbInner>,
    current: &mut Option<OutputBuilder>,
    outputs: &mut Vec<CompactionOutput>,
    status: &mut Result<()>,
) {
    let Some(mut out) = current.take() else { return };
    debug_assert!(out.builder.num_entries() > 0);
    match out.builder.finish() {
        Ok(file_size) => {
            // Reject unreadable outputs before they reach the manifest.
            if let Err(e) = inner.table_cache.find_table(out.number, file_size) {
                *status = Err(e);
                return;
            }
            outputs.push(CompactionOutput {
                number: out.number,
                file_size,
                smallest: out.smallest,
                largest: out.largest,
            });
        }
        Err(e) => *status = Err(e),
    }
}

fn install_compaction_results(
    state: &mut DbState,
    c: &mut Compaction,
    outputs: &[CompactionOutput],
) -> Result<()> {
    c.add_input_deletions();
    let level = c.level;
    for output in outputs {
        c.edit.add_file(
            level + 1,
            output.number,
            output.file_size,
            InternalKey::decoded_from(&output.smallest),
            InternalKey::decoded_from(&output.largest),
        );
    }
    state.versions.log_and_apply(&mut c.edit)
}

/// Deletes every file in the directory that no live version, pending
/// operation, or singleton role still needs.
pub(crate) fn remove_obsolete_files(inner: &Arc<DbInner>, state: &mut DbState) {
    if state.background_error.is_some() {
        // The file set may not reflect reality; deleting anything now
        // risks taking committed state with it.
        return;
    }
    let live = state.versions.live_files();
    let log_number = state.versions.log_number();
    let prev_log_number = state.versions.prev_log_number();
    let manifest_number = state.versions.manifest_file_number();

    let Ok(entries) = std::fs::read_dir(&inner.path) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((ftype, number)) = parse_file_name(name) else {
            continue;
        };
        let keep = match ftype {
            FileType::Log => number >= log_number || number == prev_log_number,
            FileType::Manifest => number >= manifest_number,
            FileType::Table => live.contains(&number),
            FileType::Temp => live.contains(&number),
            FileType::Current | FileType::Lock => true,
        };
        if !keep {
            if ftype == FileType::Table {
                inner.table_cache.evict(number);
            }
            tracing::debug!(file = name, ?ftype, "deleting obsolete file");
            let _ = std::fs::remove_file(inner.path.join(name));
        }
    }
}
