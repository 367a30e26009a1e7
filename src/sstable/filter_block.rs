//! Filter block: one filter per 2 KiB region of data-block offsets.
//!
//! ```text
//! filter_block := filter* offset(u32 LE)* offsets_start(u32 LE) base_lg(u8)
//! ```
//!
//! The filter for a data block starting at file offset `o` is entry
//! `o >> base_lg` of the offset array; regions with no keys get an empty
//! filter slot.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::filter::FilterPolicy;

/// Every filter covers a 2 KiB window of data offsets.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened pending keys plus their start offsets.
    keys: Vec<u8>,
    starts: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called when a data block begins at `block_offset`; emits filters
    /// for every region the file has moved past.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while (self.filter_offsets.len() as u64) < filter_index {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.starts.is_empty() {
            self.generate_filter();
        }
        let offsets_start = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, offset);
            self.result.extend_from_slice(&buf);
        }
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, offsets_start);
        self.result.extend_from_slice(&buf);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.starts.is_empty() {
            // Region with no keys; its offset entry points at an empty
            // filter.
            return;
        }
        self.starts.push(self.keys.len());
        let key_slices: Vec<&[u8]> = self
            .starts
            .windows(2)
            .map(|w| &self.keys[w[0]..w[1]])
            .collect();
        self.policy.create_filter(&key_slices, &mut self.result);
        self.keys.clear();
        self.starts.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Start of the offset array.
    offsets_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Returns `None` when the block is structurally unusable; the caller
    /// then reads without filtering.
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Vec<u8>) -> Option<Self> {
        if contents.len() < 5 {
            return None;
        }
        let base_lg = contents[contents.len() - 1];
        let offsets_start =
            LittleEndian::read_u32(&contents[contents.len() - 5..contents.len() - 1]) as usize;
        if offsets_start > contents.len() - 5 {
            return None;
        }
        let num_filters = (contents.len() - 5 - offsets_start) / 4;
        Some(FilterBlockReader {
            policy,
            data: contents,
            offsets_start,
            num_filters,
            base_lg,
        })
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // No filter for this region; do not skip the block.
            return true;
        }
        let entry = self.offsets_start + index * 4;
        let start = LittleEndian::read_u32(&self.data[entry..entry + 4]) as usize;
        let limit = if index + 1 < self.num_filters {
            LittleEndian::read_u32(&self.data[entry + 4..entry + 8]) as usize
        } else {
            self.offsets_start
        };
        if start == limit {
            // Empty filter covers no keys.
            return false;
        }
        if start > limit || limit > self.offsets_start {
            return true;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}
