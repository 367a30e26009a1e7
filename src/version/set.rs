//! The version set: the authoritative description of which table files
//! exist, persisted as a log of edits in the MANIFEST.
//!
//! Applying an edit builds the successor version in memory, appends the
//! edit to the manifest, syncs it, swaps CURRENT when the manifest is
//! fresh, and only then installs the successor. A failure anywhere
//! before the install leaves the predecessor version current; the next
//! successful edit starts a fresh manifest.

use std::collections::HashSet;
use std::cmp::Ordering;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use itertools::Itertools;

use crate::config::{Options, L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::db::FailPoints;
use crate::error::Result;
use crate::filenames::{manifest_file_name, read_current_file, set_current_file};
use crate::iterator::{Iter, MergingIterator};
use crate::keys::{InternalKey, InternalKeyComparator};
use crate::comparator::Comparator;
use crate::table_cache::TableCache;
use crate::wal::{LogReader, LogWriter};
use crate::Error;

use super::compaction::Compaction;
use super::edit::{FileMetaHandle, VersionEdit};
use super::version::{total_file_size, Version};

pub struct VersionSet {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    fail_points: Arc<FailPoints>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: u64,
    /// Current WAL number, and the previous one while it is still needed
    /// by an in-flight memtable flush (zero when unused).
    log_number: u64,
    prev_log_number: u64,

    current: Arc<Version>,
    /// Versions still referenced by iterators; pruned lazily.
    live: Vec<Weak<Version>>,

    manifest_log: Option<LogWriter>,
    compact_pointers: Vec<Option<InternalKey>>,

    /// File numbers reserved by in-flight flushes/compactions; garbage
    /// collection must not touch them.
    pub pending_outputs: HashSet<u64>,
}

impl VersionSet {
    pub fn new(
        db_path: PathBuf,
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        fail_points: Arc<FailPoints>,
    ) -> Self {
        let mut current = Version::new(options.clone(), icmp.clone());
        finalize(&mut current);
        VersionSet {
            db_path,
            options,
            icmp,
            fail_points,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            current: Arc::new(current),
            live: Vec::new(),
            manifest_log: None,
            compact_pointers: vec![None; NUM_LEVELS],
            pending_outputs: HashSet::new(),
        }
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: u64) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = number;
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Returns an unused number to the counter, valid only for the most
    /// recently allocated one.
    pub fn reuse_file_number(&mut self, number: u64) {
        if number + 1 == self.next_file_number {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.files[level].len()
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.current.files[level])
    }

    /// One-line per-level file census for operational logs.
    pub fn level_summary(&self) -> String {
        format!(
            "files[ {} ]",
            self.current
                .files
                .iter()
                .map(|files| files.len().to_string())
                .join(" ")
        )
    }

    /// Applies `edit` to the current version: persist to the manifest,
    /// then install the successor. Called with the database mutex held.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(n) => debug_assert!(n >= self.log_number && n < self.next_file_number),
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }

        let manifest_created = self.manifest_log.is_none();
        let prev_manifest_number = self.manifest_file_number;
        if manifest_created {
            self.manifest_file_number = self.new_file_number();
        }

        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut version = Version::new(self.options.clone(), self.icmp.clone());
        {
            let base = self.current.clone();
            let mut builder = VersionBuilder::new(&self.icmp, &base);
            builder.accumulate(edit, &mut self.compact_pointers);
            builder.save_to(&mut version)?;
        }
        finalize(&mut version);

        let manifest_path = manifest_file_name(&self.db_path, self.manifest_file_number);
        let write_result: Result<()> = (|| {
            if self.manifest_log.is_none() {
                let mut writer = LogWriter::create(&manifest_path)?;
                self.write_snapshot(&mut writer)?;
                self.manifest_log = Some(writer);
            }
            if self.fail_points.manifest_write_enabled() {
                return Err(Error::Io("simulated manifest write failure".to_string()));
            }
            let mut record = Vec::new();
            edit.encode_to(&mut record);
            let writer = self.manifest_log.as_mut().unwrap();
            writer.add_record(&record)?;
            writer.sync()?;
            if manifest_created {
                set_current_file(&self.db_path, self.manifest_file_number)?;
            }
            Ok(())
        })();

        match write_result {
            Ok(()) => {
                self.install(version);
                self.log_number = edit.log_number.unwrap();
                self.prev_log_number = edit.prev_log_number.unwrap();
                tracing::debug!(summary = %self.level_summary(), "installed version edit");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "manifest write failed; keeping current version");
                // Drop the writer: the next edit starts a fresh manifest.
                self.manifest_log = None;
                if manifest_created {
                    let _ = fs::remove_file(&manifest_path);
                    // CURRENT still names the previous manifest; garbage
                    // collection must keep honoring it.
                    self.manifest_file_number = prev_manifest_number;
                }
                Err(e)
            }
        }
    }

    fn install(&mut self, version: Version) {
        let version = Arc::new(version);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
        self.live.retain(|weak| weak.strong_count() > 0);
    }

    /// Serializes the full current state as one edit, the first record of
    /// every manifest.
    fn write_snapshot(&self, writer: &mut LogWriter) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = pointer {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for file in files {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        writer.add_record(&record)?;
        Ok(())
    }

    /// Rebuilds state by replaying the manifest named by CURRENT.
    pub fn recover(&mut self) -> Result<()> {
        let manifest_path = read_current_file(&self.db_path)?;
        let mut reader = LogReader::open(&manifest_path)?;

        let base = Version::new(self.options.clone(), self.icmp.clone());
        let mut builder = VersionBuilder::new(&self.icmp, &base);

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        loop {
            let record = match reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    return Err(Error::Corruption(format!(
                        "manifest {}: {e}",
                        manifest_path.display()
                    )));
                }
            };
            let edit = VersionEdit::decode_from(&record)?;
            if let Some(name) = &edit.comparator_name {
                let ours = self.icmp.user_comparator().name();
                if name != ours {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: database uses {name}, options supply {ours}"
                    )));
                }
            }
            builder.accumulate(&edit, &mut self.compact_pointers);
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("manifest has no next-file entry".to_string()))?;
        let log_number = log_number
            .ok_or_else(|| Error::Corruption("manifest has no log-number entry".to_string()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::Corruption("manifest has no last-sequence entry".to_string()))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = Version::new(self.options.clone(), self.icmp.clone());
        builder.save_to(&mut version)?;
        finalize(&mut version);

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.install(version);

        tracing::info!(
            manifest = %manifest_path.display(),
            last_sequence,
            log_number,
            summary = %self.level_summary(),
            "recovered version state"
        );
        Ok(())
    }

    /// Every table file referenced by a live version or reserved by an
    /// in-flight operation.
    pub fn live_files(&mut self) -> HashSet<u64> {
        let mut live: HashSet<u64> = self.pending_outputs.iter().copied().collect();
        self.live.retain(|weak| weak.strong_count() > 0);
        for weak in &self.live {
            if let Some(version) = weak.upgrade() {
                for files in &version.files {
                    for file in files {
                        live.insert(file.number);
                    }
                }
            }
        }
        for files in &self.current.files {
            for file in files {
                live.insert(file.number);
            }
        }
        live
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    /// Chooses the next compaction: size-triggered levels first, then a
    /// file whose seek budget ran out.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let size_triggered = current.compaction_score >= 1.0;

        let mut compaction = if size_triggered {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);
            let mut c = Compaction::new(&self.options, level);
            // Resume after the last compacted key in this level, wrapping
            // to the start when nothing lies beyond it.
            for file in &current.files[level] {
                let past_pointer = match &self.compact_pointers[level] {
                    Some(pointer) => {
                        self.icmp.compare(file.largest.data(), pointer.data())
                            == Ordering::Greater
                    }
                    None => true,
                };
                if past_pointer {
                    c.inputs[0].push(file.clone());
                    break;
                }
            }
            if c.inputs[0].is_empty() {
                if let Some(file) = current.files[level].first() {
                    c.inputs[0].push(file.clone());
                }
            }
            if c.inputs[0].is_empty() {
                return None;
            }
            c
        } else if let Some((file, level)) = current.file_to_compact() {
            let mut c = Compaction::new(&self.options, level);
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        compaction.input_version = Some(current.clone());

        if compaction.level == 0 {
            // Level-0 files overlap each other; widen to every file
            // touching the seed's range.
            let (smallest, largest) = get_range(&self.icmp, &compaction.inputs[0]);
            compaction.inputs[0] =
                current.overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Plans a manual compaction of `level` over a key range. Input size
    /// is bounded at levels > 0 so one call does not rewrite the world.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        if level > 0 {
            let limit = self.options.max_file_size;
            let mut total = 0;
            for (i, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }
        let mut compaction = Compaction::new(&self.options, level);
        compaction.input_version = Some(current);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Completes a compaction plan: the overlapping files one level down,
    /// a possible re-expansion of the upper level, and the grandparents.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let current = compaction.input_version.clone().expect("version pinned");
        let level = compaction.level;

        let (smallest, largest) = get_range(&self.icmp, &compaction.inputs[0]);
        compaction.inputs[1] =
            current.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        let (mut all_start, mut all_limit) = get_range2(
            &self.icmp,
            &compaction.inputs[0],
            &compaction.inputs[1],
        );

        // Try growing the upper level while that does not change the set
        // of lower-level inputs and stays under the expansion budget.
        if !compaction.inputs[1].is_empty() {
            let expanded0 = current.overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > compaction.inputs[0].len()
                && inputs1_size + expanded0_size
                    < self.options.expanded_compaction_byte_size_limit()
            {
                let (new_start, new_limit) = get_range(&self.icmp, &expanded0);
                let expanded1 =
                    current.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                if expanded1.len() == compaction.inputs[1].len() {
                    tracing::debug!(
                        level,
                        from = compaction.inputs[0].len(),
                        to = expanded0.len(),
                        "expanded compaction inputs"
                    );
                    compaction.inputs[0] = expanded0;
                    compaction.inputs[1] = expanded1;
                    let ranges = get_range2(
                        &self.icmp,
                        &compaction.inputs[0],
                        &compaction.inputs[1],
                    );
                    all_start = ranges.0;
                    all_limit = ranges.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents =
                current.overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Future compactions of this level resume past the chosen range,
        // even if this one fails and retries.
        let (_, largest) = get_range(&self.icmp, &compaction.inputs[0]);
        self.compact_pointers[level] = Some(largest.clone());
        compaction.edit.set_compact_pointer(level, largest);
    }

    /// Merged cursor over every input file of a compaction.
    pub fn make_input_iterator(
        &self,
        compaction: &Compaction,
        cache: &Arc<TableCache>,
    ) -> MergingIterator {
        let ropts = crate::config::ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            snapshot: None,
        };
        let mut children: Vec<Box<dyn Iter>> = Vec::new();
        if compaction.level == 0 {
            for file in &compaction.inputs[0] {
                children.push(cache.iter(ropts.clone(), file.number, file.file_size));
            }
        } else if !compaction.inputs[0].is_empty() {
            children.push(Box::new(super::version::LevelFileIterator::new(
                self.icmp.clone(),
                ropts.clone(),
                cache.clone(),
                compaction.inputs[0].clone(),
            )));
        }
        if !compaction.inputs[1].is_empty() {
            children.push(Box::new(super::version::LevelFileIterator::new(
                self.icmp.clone(),
                ropts,
                cache.clone(),
                compaction.inputs[1].clone(),
            )));
        }
        MergingIterator::new(self.icmp.clone(), children)
    }
}

/// Computes the size-based compaction score of a freshly built version.
/// Level 0 scores on file count, deeper levels on total bytes.
pub(crate) fn finalize(version: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0f64;
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            version.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            total_file_size(&version.files[level]) as f64 / Options::max_bytes_for_level(level)
        };
        if score > best_score {
            best_score = score;
            best_level = level;
        }
    }
    version.compaction_level = best_level;
    version.compaction_score = best_score;
}

/// Smallest and largest internal key across `files`.
fn get_range(
    icmp: &InternalKeyComparator,
    files: &[FileMetaHandle],
) -> (InternalKey, InternalKey) {
    debug_assert!(!files.is_empty());
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for file in &files[1..] {
        if icmp.compare(file.smallest.data(), smallest.data()) == Ordering::Less {
            smallest = file.smallest.clone();
        }
        if icmp.compare(file.largest.data(), largest.data()) == Ordering::Greater {
            largest = file.largest.clone();
        }
    }
    (smallest, largest)
}

fn get_range2(
    icmp: &InternalKeyComparator,
    a: &[FileMetaHandle],
    b: &[FileMetaHandle],
) -> (InternalKey, InternalKey) {
    let mut all: Vec<FileMetaHandle> = Vec::with_capacity(a.len() + b.len());
    all.extend_from_slice(a);
    all.extend_from_slice(b);
    get_range(icmp, &all)
}

/// Applies a run of edits to a base version.
struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<FileMetaHandle>,
}

pub(crate) struct VersionBuilder<'a> {
    icmp: InternalKeyComparator,
    base: &'a Version,
    levels: Vec<LevelState>,
}

impl<'a> VersionBuilder<'a> {
    pub fn new(icmp: &InternalKeyComparator, base: &'a Version) -> Self {
        VersionBuilder {
            icmp: icmp.clone(),
            base,
            levels: (0..NUM_LEVELS)
                .map(|_| LevelState {
                    deleted: HashSet::new(),
                    added: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn accumulate(
        &mut self,
        edit: &VersionEdit,
        compact_pointers: &mut Vec<Option<InternalKey>>,
    ) {
        for (level, key) in &edit.compact_pointers {
            compact_pointers[*level] = Some(key.clone());
        }
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted.insert(*number);
        }
        for (level, file) in &edit.new_files {
            let mut file = file.clone();
            file.init_allowed_seeks();
            self.levels[*level].deleted.remove(&file.number);
            self.levels[*level].added.push(Arc::new(file));
        }
    }

    /// Produces the successor version and checks that levels above zero
    /// stay disjoint.
    pub fn save_to(self, version: &mut Version) -> Result<()> {
        for (level, state) in self.levels.into_iter().enumerate() {
            let mut files: Vec<FileMetaHandle> = self.base.files[level]
                .iter()
                .filter(|f| !state.deleted.contains(&f.number))
                .cloned()
                .collect();
            for file in state.added {
                if !state.deleted.contains(&file.number) {
                    files.push(file);
                }
            }
            if level == 0 {
                // Newest data has the highest number; keep insertion order
                // stable by number.
                files.sort_by_key(|f| f.number);
            } else {
                files.sort_by(|a, b| self.icmp.compare(a.smallest.data(), b.smallest.data()));
                for pair in files.windows(2) {
                    if self.icmp.compare(pair[0].largest.data(), pair[1].smallest.data())
                        != Ordering::Less
                    {
                        return Err(Error::Corruption(format!(
                            "overlapping tables {} and {} at level {level}",
                            pair[0].number, pair[1].number
                        )));
                    }
                }
            }
            version.files[level] = files;
        }
        Ok(())
    }
}
