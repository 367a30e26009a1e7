//! Manifest records.
//!
//! A `VersionEdit` is the delta between two versions of the file set,
//! serialized as tagged fields so old readers skip nothing and new
//! fields can be added behind fresh tags:
//!
//! ```text
//! field := tag(varint32) payload
//! tags:  1 comparator name    2 log number        3 next file number
//!        4 last sequence      5 compact pointer   6 deleted file
//!        7 new file           9 previous log number
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::coding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};
use crate::error::Result;
use crate::keys::InternalKey;
use crate::Error;

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// Metadata for one table file.
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Point-lookup misses this file may absorb before it becomes a
    /// compaction seed.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let mut meta = FileMetaData {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(0),
        };
        meta.init_allowed_seeks();
        meta
    }

    /// One seek costs about as much as compacting 16KiB, so a file earns
    /// one miss per 16KiB before merging it becomes the cheaper choice.
    pub fn init_allowed_seeks(&mut self) {
        let seeks = (self.file_size / 16384).max(100) as i64;
        self.allowed_seeks = AtomicI64::new(seeks);
    }

    /// Charges one seek; true when the budget just ran out.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) == 1
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        FileMetaData {
            number: self.number,
            file_size: self.file_size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.file_size == other.file_size
            && self.smallest == other.smallest
            && self.largest == other.largest
    }
}

/// Delta applied to a version to produce its successor; also the record
/// format of the manifest.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(sequence);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files
            .push((level, FileMetaData::new(number, file_size, smallest, largest)));
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            put_varint32(dst, TAG_COMPARATOR);
            put_length_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(dst, TAG_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(dst, TAG_PREV_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint32(dst, TAG_LAST_SEQUENCE);
            put_varint64(dst, n);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(dst, TAG_COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key.data());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(dst, TAG_DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(dst, TAG_NEW_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, file.number);
            put_varint64(dst, file.file_size);
            put_length_prefixed_slice(dst, file.smallest.data());
            put_length_prefixed_slice(dst, file.largest.data());
        }
    }

    pub fn decode_from(mut input: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        while !input.is_empty() {
            let tag = get_varint32(&mut input)?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed_slice(&mut input)?;
                    edit.comparator_name = Some(
                        String::from_utf8(name.to_vec()).map_err(|_| {
                            Error::Corruption("comparator name is not utf-8".to_string())
                        })?,
                    );
                }
                TAG_LOG_NUMBER => edit.log_number = Some(get_varint64(&mut input)?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(get_varint64(&mut input)?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(get_varint64(&mut input)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(get_varint64(&mut input)?),
                TAG_COMPACT_POINTER => {
                    let level = get_varint32(&mut input)? as usize;
                    let key = get_length_prefixed_slice(&mut input)?;
                    edit.compact_pointers
                        .push((level, InternalKey::decoded_from(key)));
                }
                TAG_DELETED_FILE => {
                    let level = get_varint32(&mut input)? as usize;
                    let number = get_varint64(&mut input)?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = get_varint32(&mut input)? as usize;
                    let number = get_varint64(&mut input)?;
                    let file_size = get_varint64(&mut input)?;
                    let smallest = InternalKey::decoded_from(get_length_prefixed_slice(&mut input)?);
                    let largest = InternalKey::decoded_from(get_length_prefixed_slice(&mut input)?);
                    edit.new_files.push((
                        level,
                        FileMetaData::new(number, file_size, smallest, largest),
                    ));
                }
                unknown => {
                    return Err(Error::Corruption(format!(
                        "unknown manifest record tag {unknown}"
                    )));
                }
            }
        }
        Ok(edit)
    }
}

/// Shared handle to file metadata; versions and compactions co-own these.
pub type FileMetaHandle = Arc<FileMetaData>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ValueType;

    fn key(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user_key, seq, ValueType::Value)
    }

    fn roundtrip(edit: &VersionEdit) -> VersionEdit {
        let mut buf = Vec::new();
        edit.encode_to(&mut buf);
        VersionEdit::decode_from(&buf).expect("decode failed")
    }

    #[test]
    fn test_empty_roundtrip() {
        let edit = VersionEdit::new();
        assert_eq!(roundtrip(&edit), edit);
    }

    #[test]
    fn test_full_roundtrip() {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("tephradb.BytewiseComparator");
        edit.set_log_number(100);
        edit.set_prev_log_number(99);
        edit.set_next_file_number(200);
        edit.set_last_sequence(300);
        edit.set_compact_pointer(1, key(b"ptr", 7));
        edit.delete_file(2, 42);
        edit.delete_file(3, 43);
        edit.add_file(0, 50, 1024, key(b"aaa", 5), key(b"zzz", 1));
        assert_eq!(roundtrip(&edit), edit);
    }

    #[test]
    fn test_repeated_roundtrip_is_stable() {
        let mut edit = VersionEdit::new();
        edit.set_log_number(8);
        edit.add_file(1, 9, 512, key(b"k1", 3), key(b"k2", 2));
        let mut encoded = Vec::new();
        edit.encode_to(&mut encoded);
        for _ in 0..3 {
            let decoded = VersionEdit::decode_from(&encoded).unwrap();
            let mut re_encoded = Vec::new();
            decoded.encode_to(&mut re_encoded);
            assert_eq!(re_encoded, encoded);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = Vec::new();
        put_varint32(&mut buf, 55);
        assert!(VersionEdit::decode_from(&buf).is_err());
    }

    #[test]
    fn test_truncated_field_rejected() {
        let mut edit = VersionEdit::new();
        edit.add_file(1, 9, 512, key(b"k1", 3), key(b"k2", 2));
        let mut buf = Vec::new();
        edit.encode_to(&mut buf);
        buf.truncate(buf.len() - 2);
        assert!(VersionEdit::decode_from(&buf).is_err());
    }

    #[test]
    fn test_seek_budget_floor() {
        let small = FileMetaData::new(1, 100, key(b"a", 1), key(b"b", 1));
        assert_eq!(small.allowed_seeks.load(Ordering::Relaxed), 100);
        let big = FileMetaData::new(2, 10 * 1024 * 1024, key(b"a", 1), key(b"b", 1));
        assert_eq!(big.allowed_seeks.load(Ordering::Relaxed), 640);
    }
}
