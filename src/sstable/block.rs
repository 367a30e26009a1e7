//! Block codec for sorted tables.
//!
//! A block is a run of key/value entries with shared-prefix key
//! compression, restarted every `block_restart_interval` entries so a
//! reader can binary-search without decoding from the top:
//!
//! ```text
//! entry   := shared(varint32) non_shared(varint32) value_len(varint32)
//!            key_delta value
//! block   := entry* restart_offset(u32 LE)* num_restarts(u32 LE)
//! ```
//!
//! Entries at a restart point store their full key (`shared == 0`).

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::coding::{get_varint32, put_varint32};
use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::Iter;
use crate::Error;

const RESTART_ENTRY_SIZE: usize = 4;

/// Accumulates ascending key/value entries into a serialized block.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        BlockBuilder {
            restart_interval: restart_interval.max(1),
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Appends an entry. Keys must arrive in ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, (key.len() - shared) as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        self.counter += 1;
    }

    /// Appends the restart array and returns the serialized block.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, restart);
            self.buffer.extend_from_slice(&buf);
        }
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, self.restarts.len() as u32);
        self.buffer.extend_from_slice(&buf);
        self.finished = true;
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Serialized size if finished now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * RESTART_ENTRY_SIZE + RESTART_ENTRY_SIZE
    }
}

/// A decoded, immutable block.
pub struct Block {
    data: Arc<Vec<u8>>,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < RESTART_ENTRY_SIZE {
            return Err(Error::Corruption("block too small".to_string()));
        }
        let num_restarts = LittleEndian::read_u32(&contents[contents.len() - RESTART_ENTRY_SIZE..]);
        let max_restarts = (contents.len() - RESTART_ENTRY_SIZE) / RESTART_ENTRY_SIZE;
        if num_restarts as usize > max_restarts {
            return Err(Error::Corruption("block restart count overruns".to_string()));
        }
        let restart_offset =
            contents.len() - RESTART_ENTRY_SIZE * (num_restarts as usize + 1);
        Ok(Block {
            data: Arc::new(contents),
            restart_offset,
            num_restarts,
        })
    }

    pub fn iter(&self, cmp: Arc<dyn Comparator>) -> BlockIterator {
        BlockIterator {
            cmp,
            data: self.data.clone(),
            restart_offset: self.restart_offset,
            num_restarts: self.num_restarts,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value_range: (0, 0),
            status: Ok(()),
        }
    }
}

/// Cursor over one block.
pub struct BlockIterator {
    cmp: Arc<dyn Comparator>,
    data: Arc<Vec<u8>>,
    /// Start of the restart array; also the "one past the end" position.
    restart_offset: usize,
    num_restarts: u32,
    /// Byte offset of the current entry; `restart_offset` means invalid.
    current: usize,
    restart_index: u32,
    key: Vec<u8>,
    value_range: (usize, usize),
    status: Result<()>,
}

impl BlockIterator {
    fn restart_point(&self, index: u32) -> usize {
        LittleEndian::read_u32(
            &self.data[self.restart_offset + RESTART_ENTRY_SIZE * index as usize..],
        ) as usize
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        self.current = self.restart_point(index);
        self.value_range = (self.current, self.current);
    }

    fn corrupted(&mut self) {
        self.status = Err(Error::Corruption("bad entry in block".to_string()));
        self.current = self.restart_offset;
        self.restart_index = self.num_restarts;
        self.key.clear();
    }

    /// Decodes the entry at `value_range.1` (the position after the
    /// previous entry's value) into `key`/`value_range`. Returns false at
    /// the end of the entry area or on corruption.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.value_range.1;
        if self.current >= self.restart_offset {
            self.current = self.restart_offset;
            self.restart_index = self.num_restarts;
            return false;
        }

        let mut input = &self.data[self.current..self.restart_offset];
        let before = input.len();
        let (shared, non_shared, value_len) = match (
            get_varint32(&mut input),
            get_varint32(&mut input),
            get_varint32(&mut input),
        ) {
            (Ok(a), Ok(b), Ok(c)) => (a as usize, b as usize, c as usize),
            _ => {
                self.corrupted();
                return false;
            }
        };
        let header_len = before - input.len();
        if shared > self.key.len() || input.len() < non_shared + value_len {
            self.corrupted();
            return false;
        }

        let key_start = self.current + header_len;
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.data[key_start..key_start + non_shared]);
        let value_start = key_start + non_shared;
        self.value_range = (value_start, value_start + value_len);

        while self.restart_index + 1 < self.num_restarts
            && self.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }
}

impl Iter for BlockIterator {
    fn valid(&self) -> bool {
        self.current < self.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.num_restarts - 1);
        // Walk to the final entry of the block.
        while self.parse_next_entry() && self.value_range.1 < self.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.num_restarts == 0 {
            return;
        }
        // Binary search for the last restart point with key < target.
        let mut left = 0u32;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            self.seek_to_restart_point(mid);
            if !self.parse_next_entry() {
                return;
            }
            if self.cmp.compare(&self.key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.seek_to_restart_point(left);
        // Linear scan to the first entry >= target.
        while self.parse_next_entry() {
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Find the restart point strictly before the current entry, then
        // scan forward to the entry preceding it.
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // Already at the first entry.
                self.current = self.restart_offset;
                self.restart_index = self.num_restarts;
                self.key.clear();
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.value_range.1 < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.data[self.value_range.0..self.value_range.1]
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        Block::new(builder.finish().to_vec()).unwrap()
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    #[test]
    fn test_forward_scan() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"apple", b"1"),
            (b"apricot", b"2"),
            (b"banana", b"3"),
            (b"blueberry", b"4"),
            (b"cherry", b"5"),
        ];
        for interval in [1, 2, 16] {
            let block = build_block(&entries, interval);
            let mut iter = block.iter(cmp());
            iter.seek_to_first();
            for (k, v) in &entries {
                assert!(iter.valid());
                assert_eq!(iter.key(), *k);
                assert_eq!(iter.value(), *v);
                iter.next();
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_seek() {
        let entries: Vec<(&[u8], &[u8])> =
            vec![(b"b", b"1"), (b"d", b"2"), (b"f", b"3"), (b"h", b"4")];
        let block = build_block(&entries, 2);
        let mut iter = block.iter(cmp());

        iter.seek(b"d");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"d");

        iter.seek(b"e");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"f");

        iter.seek(b"a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"b");

        iter.seek(b"z");
        assert!(!iter.valid());
    }

    #[test]
    fn test_reverse_scan() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"a", b"1"),
            (b"ab", b"2"),
            (b"abc", b"3"),
            (b"b", b"4"),
            (b"ba", b"5"),
        ];
        for interval in [1, 3, 16] {
            let block = build_block(&entries, interval);
            let mut iter = block.iter(cmp());
            iter.seek_to_last();
            for (k, v) in entries.iter().rev() {
                assert!(iter.valid(), "interval {interval}");
                assert_eq!(iter.key(), *k);
                assert_eq!(iter.value(), *v);
                iter.prev();
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_empty_value_and_long_shared_prefix() {
        let long_a = vec![b'a'; 300];
        let mut long_b = long_a.clone();
        long_b.push(b'b');
        let entries: Vec<(&[u8], &[u8])> = vec![(&long_a, b""), (&long_b, b"v")];
        let block = build_block(&entries, 16);
        let mut iter = block.iter(cmp());
        iter.seek(&long_b);
        assert!(iter.valid());
        assert_eq!(iter.key(), long_b.as_slice());
        assert_eq!(iter.value(), b"v");
    }

    #[test]
    fn test_corrupt_block_rejected() {
        assert!(Block::new(vec![]).is_err());
        // num_restarts claims more than the block can hold.
        let mut bogus = vec![0u8; 8];
        LittleEndian::write_u32(&mut bogus[4..], 100);
        assert!(Block::new(bogus).is_err());
    }

    #[test]
    fn test_size_estimate_tracks_finish() {
        let mut builder = BlockBuilder::new(4);
        builder.add(b"k1", b"v1");
        builder.add(b"k2", b"v2");
        let estimate = builder.current_size_estimate();
        assert_eq!(builder.finish().len(), estimate);
    }
}
