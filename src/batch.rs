//! Atomic write batches.
//!
//! A `WriteBatch` buffers puts and deletes that later commit as one
//! atomic unit. The in-memory representation is exactly the bytes that
//! land in the write-ahead log:
//!
//! ```text
//!  +---------------------+
//!  | sequence (u64, LE)  |  starting sequence for the batch
//!  +---------------------+
//!  | count (u32, LE)     |
//!  +---------------------+
//!  | count entries       |
//!  +---------------------+
//!
//! entry := 0x01 varint32-klen key varint32-vlen value   (put)
//!        | 0x00 varint32-klen key                       (delete)
//! ```
//!
//! Entry `i` of a batch commits at `sequence + i`.

use byteorder::{ByteOrder, LittleEndian};

use crate::coding::{get_length_prefixed_slice, put_length_prefixed_slice};
use crate::error::Result;
use crate::keys::ValueType;
use crate::memtable::MemTable;
use crate::Error;

pub(crate) const BATCH_HEADER_SIZE: usize = 12;

#[derive(Clone)]
pub struct WriteBatch {
    contents: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self {
            contents: vec![0; BATCH_HEADER_SIZE],
        }
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a `key -> value` mapping.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.contents.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.contents, key);
        put_length_prefixed_slice(&mut self.contents, value);
    }

    /// Buffers a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.contents.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.contents, key);
    }

    /// Removes all buffered operations.
    pub fn clear(&mut self) {
        self.contents.clear();
        self.contents.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Appends the operations of `other` to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.contents
            .extend_from_slice(&other.contents[BATCH_HEADER_SIZE..]);
    }

    /// Number of buffered operations.
    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.contents[8..BATCH_HEADER_SIZE])
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Bytes this batch adds to the log and memtable.
    pub fn approximate_size(&self) -> usize {
        self.contents.len()
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.contents[8..BATCH_HEADER_SIZE], count);
    }

    pub(crate) fn sequence(&self) -> u64 {
        LittleEndian::read_u64(&self.contents[..8])
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        LittleEndian::write_u64(&mut self.contents[..8], sequence);
    }

    /// The serialized batch, as written to the log.
    pub(crate) fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Adopts serialized contents, e.g. a record replayed from a log.
    pub(crate) fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(Error::Corruption("write batch too small".to_string()));
        }
        self.contents.clear();
        self.contents.extend_from_slice(contents);
        Ok(())
    }

    /// Walks the buffered operations in insertion order. The callback
    /// receives the value type, key, and (for puts) the value.
    pub(crate) fn iterate<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(ValueType, &[u8], &[u8]),
    {
        let mut input = &self.contents[BATCH_HEADER_SIZE..];
        let mut found = 0u32;
        while !input.is_empty() {
            found += 1;
            let tag = input[0];
            input = &input[1..];
            match ValueType::from_u8(tag)
                .map_err(|_| Error::Corruption("unknown write batch tag".to_string()))?
            {
                ValueType::Value => {
                    let key = get_length_prefixed_slice(&mut input)?;
                    let value = get_length_prefixed_slice(&mut input)?;
                    handler(ValueType::Value, key, value);
                }
                ValueType::Deletion => {
                    let key = get_length_prefixed_slice(&mut input)?;
                    handler(ValueType::Deletion, key, &[]);
                }
            }
        }
        if found != self.count() {
            return Err(Error::Corruption(
                "write batch count does not match contents".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies every operation to `mem`, stamping entry `i` with
    /// `self.sequence() + i`.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut sequence = self.sequence();
        self.iterate(|vtype, key, value| {
            mem.add(sequence, vtype, key, value);
            sequence += 1;
        })
    }
}
