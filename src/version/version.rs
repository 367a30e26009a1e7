//! Immutable snapshots of the on-disk file set.
//!
//! A `Version` lists, per level, the table files that existed when it was
//! installed. Reads resolve against one version for their whole
//! lifetime; shared `Arc` handles keep a version (and through it, its
//! files) alive for as long as any iterator references it.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use crate::config::{Options, ReadOptions, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::error::Result;
use crate::iterator::Iter;
use crate::keys::{
    extract_user_key, InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey,
    ValueType, MAX_SEQUENCE,
};
use crate::table_cache::TableCache;
use crate::comparator::Comparator;

use super::edit::FileMetaHandle;

/// Outcome of a point probe against one version.
pub enum VersionGet {
    Found(Vec<u8>),
    Deleted,
    Missing,
}

/// A file whose seek budget should be charged for a read that had to
/// look past it.
pub type SeekCharge = Option<(FileMetaHandle, usize)>;

pub struct Version {
    pub(crate) icmp: InternalKeyComparator,
    pub(crate) options: Arc<Options>,
    /// Table files per level. Level 0 is ordered by file number; deeper
    /// levels are disjoint and ordered by smallest key.
    pub(crate) files: Vec<Vec<FileMetaHandle>>,
    /// Seek-triggered compaction seed, latched by `update_stats`.
    pub(crate) file_to_compact: Mutex<SeekCharge>,
    /// Highest size-based compaction score and the level it belongs to;
    /// computed once when the version is installed.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
}

impl Version {
    pub fn new(options: Arc<Options>, icmp: InternalKeyComparator) -> Self {
        Version {
            icmp,
            options,
            files: vec![Vec::new(); NUM_LEVELS],
            file_to_compact: Mutex::new(None),
            compaction_score: -1.0,
            compaction_level: 0,
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Point lookup walking level 0 newest-first, then one candidate file
    /// per deeper level. Besides the outcome, reports the file to charge
    /// when more than one file had to be consulted.
    pub fn get(
        &self,
        ropts: &ReadOptions,
        key: &LookupKey,
        cache: &TableCache,
    ) -> Result<(VersionGet, SeekCharge)> {
        let ikey = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator();

        let mut probe = GetProbe {
            last_file_read: None,
            charge: None,
        };

        // Level 0 files may overlap; gather matches and consult newest
        // first.
        let mut level0: Vec<FileMetaHandle> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, extract_user_key(f.smallest.data())) != Ordering::Less
                    && ucmp.compare(user_key, extract_user_key(f.largest.data()))
                        != Ordering::Greater
            })
            .cloned()
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));

        for file in level0 {
            if let Some(outcome) = probe.consult(self, ropts, cache, &file, 0, ikey, user_key)? {
                return Ok((outcome, probe.charge));
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, ikey);
            if index >= files.len() {
                continue;
            }
            let file = files[index].clone();
            if ucmp.compare(user_key, extract_user_key(file.smallest.data())) == Ordering::Less {
                continue;
            }
            if let Some(outcome) =
                probe.consult(self, ropts, cache, &file, level, ikey, user_key)?
            {
                return Ok((outcome, probe.charge));
            }
        }

        Ok((VersionGet::Missing, probe.charge))
    }

    /// Applies a seek charge. Returns true when the charged file just
    /// exhausted its budget and became a compaction seed. Files at the
    /// deepest level have nowhere to merge into and are never seeded.
    pub fn update_stats(&self, charge: SeekCharge) -> bool {
        if let Some((file, level)) = charge {
            if file.charge_seek() && level + 1 < NUM_LEVELS {
                let mut seed = self.file_to_compact.lock().unwrap();
                if seed.is_none() {
                    *seed = Some((file, level));
                    return true;
                }
            }
        }
        false
    }

    pub fn file_to_compact(&self) -> SeekCharge {
        self.file_to_compact.lock().unwrap().clone()
    }

    /// True when some file in `level` overlaps the user-key range
    /// `[smallest, largest]` (either bound may be open).
    pub fn some_file_overlaps_range(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        let ucmp = self.icmp.user_comparator();
        let files = &self.files[level];
        if level == 0 {
            // Possibly-overlapping files: scan them all.
            return files.iter().any(|f| {
                !before_file(ucmp, largest_user_key, f) && !after_file(ucmp, smallest_user_key, f)
            });
        }

        // Disjoint sorted files: binary search on the lower bound.
        let index = match smallest_user_key {
            Some(smallest) => {
                let small_key = InternalKey::new(smallest, MAX_SEQUENCE, ValueType::Value);
                find_file(&self.icmp, files, small_key.data())
            }
            None => 0,
        };
        if index >= files.len() {
            return false;
        }
        !before_file(ucmp, largest_user_key, &files[index])
    }

    /// Level a fresh memtable flush should land on: level 0 when its
    /// range overlaps there, otherwise pushed down while no overlap
    /// exists and the grandparent overlap stays modest.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.some_file_overlaps_range(0, Some(smallest_user_key), Some(largest_user_key)) {
            return level;
        }
        let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE, ValueType::Value);
        let limit = InternalKey::new(largest_user_key, 0, ValueType::Deletion);
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.some_file_overlaps_range(
                level + 1,
                Some(smallest_user_key),
                Some(largest_user_key),
            ) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let grandparents = self.overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&grandparents) > self.options.max_grandparent_overlap_bytes() {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Files in `level` whose user-key ranges touch `[begin, end]`. At
    /// level 0 an overlapping file widens the search range, since its
    /// neighbors may overlap it in turn.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<FileMetaHandle> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());
        let mut inputs = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = self.files[level][i].clone();
            i += 1;
            let file_start = extract_user_key(file.smallest.data());
            let file_limit = extract_user_key(file.largest.data());
            if user_begin
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                continue;
            }
            if user_end
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                continue;
            }
            if level == 0 {
                // Overlapping level: this file may drag the range wider;
                // restart with the union.
                let mut restart = false;
                if let Some(b) = &user_begin {
                    if ucmp.compare(file_start, b) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(e) = &user_end {
                    if ucmp.compare(file_limit, e) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(file);
        }
        inputs
    }

    /// Child iterators covering this version: one per level-0 file plus a
    /// concatenating iterator per deeper level.
    pub fn add_iterators(
        &self,
        ropts: &ReadOptions,
        cache: &Arc<TableCache>,
        out: &mut Vec<Box<dyn Iter>>,
    ) {
        for file in &self.files[0] {
            out.push(cache.iter(ropts.clone(), file.number, file.file_size));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                out.push(Box::new(LevelFileIterator::new(
                    self.icmp.clone(),
                    ropts.clone(),
                    cache.clone(),
                    self.files[level].clone(),
                )));
            }
        }
    }
}

/// Bookkeeping for one point lookup: which file was read last, and
/// which file (if any) should pay a seek for the read having to go past
/// it.
struct GetProbe {
    last_file_read: SeekCharge,
    charge: SeekCharge,
}

impl GetProbe {
    #[allow(clippy::too_many_arguments)]
    fn consult(
        &mut self,
        version: &Version,
        ropts: &ReadOptions,
        cache: &TableCache,
        file: &FileMetaHandle,
        level: usize,
        ikey: &[u8],
        user_key: &[u8],
    ) -> Result<Option<VersionGet>> {
        if self.charge.is_none() && self.last_file_read.is_some() {
            // Second file consulted for this read; the first one pays.
            self.charge = self.last_file_read.take();
        }
        self.last_file_read = Some((file.clone(), level));

        let ucmp = version.icmp.user_comparator();
        match cache.get(ropts, file.number, file.file_size, ikey)? {
            Some((found_key, value)) => {
                let parsed = ParsedInternalKey::parse(&found_key)?;
                if ucmp.compare(parsed.user_key, user_key) == Ordering::Equal {
                    match parsed.value_type {
                        ValueType::Value => Ok(Some(VersionGet::Found(value))),
                        ValueType::Deletion => Ok(Some(VersionGet::Deleted)),
                    }
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

/// Index of the first file whose largest key is at or after `ikey`.
/// Files must be disjoint and sorted by smallest key.
pub fn find_file(icmp: &InternalKeyComparator, files: &[FileMetaHandle], ikey: &[u8]) -> usize {
    let mut left = 0;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.data(), ikey) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

pub fn total_file_size(files: &[FileMetaHandle]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// True when the whole file sorts after `largest_user_key`.
fn before_file(
    ucmp: &Arc<dyn Comparator>,
    largest_user_key: Option<&[u8]>,
    file: &FileMetaHandle,
) -> bool {
    largest_user_key.is_some_and(|largest| {
        ucmp.compare(largest, extract_user_key(file.smallest.data())) == Ordering::Less
    })
}

/// True when the whole file sorts before `smallest_user_key`.
fn after_file(
    ucmp: &Arc<dyn Comparator>,
    smallest_user_key: Option<&[u8]>,
    file: &FileMetaHandle,
) -> bool {
    smallest_user_key.is_some_and(|smallest| {
        ucmp.compare(smallest, extract_user_key(file.largest.data())) == Ordering::Greater
    })
}

/// Walks the disjoint files of one level in order, opening each table
/// through the cache as the cursor reaches it.
pub struct LevelFileIterator {
    icmp: InternalKeyComparator,
    ropts: ReadOptions,
    cache: Arc<TableCache>,
    files: Vec<FileMetaHandle>,
    /// `files.len()` means invalid.
    index: usize,
    table_iter: Option<Box<dyn Iter>>,
}

impl LevelFileIterator {
    pub fn new(
        icmp: InternalKeyComparator,
        ropts: ReadOptions,
        cache: Arc<TableCache>,
        files: Vec<FileMetaHandle>,
    ) -> Self {
        let index = files.len();
        LevelFileIterator {
            icmp,
            ropts,
            cache,
            files,
            index,
            table_iter: None,
        }
    }

    fn open_current(&mut self) {
        self.table_iter = if self.index < self.files.len() {
            let file = &self.files[self.index];
            Some(
                self.cache
                    .iter(self.ropts.clone(), file.number, file.file_size),
            )
        } else {
            None
        };
    }

    fn skip_forward(&mut self) {
        while self.table_iter.as_ref().map_or(false, |t| !t.valid()) {
            if self.index + 1 >= self.files.len() {
                self.index = self.files.len();
                self.table_iter = None;
                return;
            }
            self.index += 1;
            self.open_current();
            if let Some(iter) = &mut self.table_iter {
                iter.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while self.table_iter.as_ref().map_or(false, |t| !t.valid()) {
            if self.index == 0 {
                self.index = self.files.len();
                self.table_iter = None;
                return;
            }
            self.index -= 1;
            self.open_current();
            if let Some(iter) = &mut self.table_iter {
                iter.seek_to_last();
            }
        }
    }
}

impl Iter for LevelFileIterator {
    fn valid(&self) -> bool {
        self.table_iter.as_ref().is_some_and(|t| t.valid())
    }

    fn seek_to_first(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = 0;
        self.open_current();
        if let Some(iter) = &mut self.table_iter {
            iter.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.index = self.files.len() - 1;
        self.open_current();
        if let Some(iter) = &mut self.table_iter {
            iter.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        if self.index >= self.files.len() {
            self.table_iter = None;
            return;
        }
        self.open_current();
        if let Some(iter) = &mut self.table_iter {
            iter.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.table_iter {
            iter.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.table_iter {
            iter.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.table_iter.as_ref().expect("iterator not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.table_iter.as_ref().expect("iterator not valid").value()
    }

    fn status(&self) -> Result<()> {
        if let Some(iter) = &self.table_iter {
            iter.status()?;
        }
        Ok(())
    }
}
