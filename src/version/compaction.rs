use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::config::{Options, NUM_LEVELS};
use crate::keys::extract_user_key;

use super::edit::{FileMetaHandle, VersionEdit};
use super::version::{total_file_size, Version};

/// A planned compaction: the input files at `level` and `level + 1`, the
/// grandparent files used to bound output size, and the edit under
/// construction.
pub struct Compaction {
    pub level: usize,
    pub inputs: [Vec<FileMetaHandle>; 2],
    pub grandparents: Vec<FileMetaHandle>,
    /// The version the inputs came from, kept alive for the duration.
    pub input_version: Option<Arc<Version>>,
    pub edit: VersionEdit,

    max_output_file_size: u64,
    max_grandparent_overlap: u64,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursor for is_base_level_for_key; valid because
    // compaction visits keys in ascending order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub fn new(options: &Options, level: usize) -> Self {
        Compaction {
            level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            input_version: None,
            edit: VersionEdit::new(),
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap: options.max_grandparent_overlap_bytes(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &FileMetaHandle {
        &self.inputs[which][i]
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// A single file at `level` with nothing to merge below and little
    /// grandparent overlap can simply move down a level.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Marks every input file as deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number);
            }
        }
    }

    /// True when no file at any level below the output could contain
    /// `user_key`; tombstones for such keys can be dropped outright.
    ///
    /// Callers visit keys in ascending order, so each level's cursor only
    /// ever moves forward.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let version = self
            .input_version
            .as_ref()
            .expect("compaction has no input version");
        let ucmp = version.icmp.user_comparator();
        for level in self.level + 2..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, extract_user_key(file.largest.data()))
                    != Ordering::Greater
                {
                    if ucmp.compare(user_key, extract_user_key(file.smallest.data()))
                        != Ordering::Less
                    {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the output reaching `internal_key` would overlap too
    /// many grandparent bytes, so the current output file should close
    /// first.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        let version = self
            .input_version
            .as_ref()
            .expect("compaction has no input version");
        let icmp = &version.icmp;
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.data(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Lets go of the pinned input version once the compaction is done.
    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }
}
