//! Internal key codec.
//!
//! Every entry the engine stores is keyed by an internal key: the user
//! key followed by an 8-byte little-endian trailer packing a 56-bit
//! sequence number with an 8-bit value type:
//!
//! ```text
//! +----------------+---------------------------------+
//! | user key (var) | sequence << 8 | type  (u64, LE) |
//! +----------------+---------------------------------+
//! ```
//!
//! Internal keys order by user key ascending (under the user-supplied
//! comparator), then sequence descending, then type descending, so the
//! newest entry for a user key sorts first. A `LookupKey` is the largest
//! possible internal key for a `(user_key, sequence)` pair; seeking to it
//! lands on the newest entry visible at that sequence.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::comparator::Comparator;
use crate::error::Result;
use crate::Error;

/// Largest sequence number that fits the 56-bit trailer slot.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Trailer type byte used when building seek targets. Sorts after every
/// real value type at the same sequence, so a seek lands on the newest
/// visible entry rather than skipping past it.
pub const TYPE_FOR_SEEK: u8 = 0xff;

const TRAILER_SIZE: usize = 8;

/// Kind of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// A tombstone hiding any older value for the same user key.
    Deletion = 0,
    /// A live value.
    Value = 1,
}

impl ValueType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            _ => Err(crate::corruption!("unknown value type {byte}")),
        }
    }
}

/// Packs a sequence number and value type into the u64 trailer.
pub fn pack_sequence_and_type(sequence: u64, vtype: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | vtype as u64
}

/// Appends the encoded internal key for `(user_key, sequence, vtype)`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], sequence: u64, vtype: ValueType) {
    dst.extend_from_slice(user_key);
    let mut trailer = [0u8; TRAILER_SIZE];
    LittleEndian::write_u64(&mut trailer, pack_sequence_and_type(sequence, vtype));
    dst.extend_from_slice(&trailer);
}

/// The user-key portion of an encoded internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TRAILER_SIZE);
    &internal_key[..internal_key.len() - TRAILER_SIZE]
}

/// An internal key decomposed into its parts, borrowing the user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: u64,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    /// Splits an encoded internal key. Fails on short keys or an
    /// unknown type byte.
    pub fn parse(internal_key: &'a [u8]) -> Result<Self> {
        if internal_key.len() < TRAILER_SIZE {
            return Err(Error::Corruption("internal key too short".to_string()));
        }
        let (user_key, trailer) = internal_key.split_at(internal_key.len() - TRAILER_SIZE);
        let packed = LittleEndian::read_u64(trailer);
        let value_type = ValueType::from_u8((packed & 0xff) as u8)?;
        Ok(ParsedInternalKey {
            user_key,
            sequence: packed >> 8,
            value_type,
        })
    }
}

/// An owned, encoded internal key.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InternalKey {
    data: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], sequence: u64, vtype: ValueType) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut data, user_key, sequence, vtype);
        InternalKey { data }
    }

    /// Wraps an already-encoded internal key.
    pub fn decoded_from(encoded: &[u8]) -> Self {
        InternalKey {
            data: encoded.to_vec(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ParsedInternalKey::parse(&self.data) {
            Ok(parsed) => write!(
                f,
                "{:?}@{}:{:?}",
                String::from_utf8_lossy(parsed.user_key),
                parsed.sequence,
                parsed.value_type
            ),
            Err(_) => write!(f, "(bad){:?}", self.data),
        }
    }
}

/// Seek target for a point lookup: the largest internal key with the
/// given user key and sequence.
pub struct LookupKey {
    data: Vec<u8>,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: u64) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        data.extend_from_slice(user_key);
        let mut trailer = [0u8; TRAILER_SIZE];
        LittleEndian::write_u64(&mut trailer, (sequence << 8) | TYPE_FOR_SEEK as u64);
        data.extend_from_slice(&trailer);
        LookupKey { data }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.data
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.data)
    }
}

/// Orders encoded internal keys: user key ascending through the wrapped
/// user comparator, then trailer (sequence, type) descending.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let atrailer = LittleEndian::read_u64(&a[a.len() - TRAILER_SIZE..]);
                let btrailer = LittleEndian::read_u64(&b[b.len() - TRAILER_SIZE..]);
                // Higher sequence sorts first.
                btrailer.cmp(&atrailer)
            }
            ord => ord,
        }
    }

    fn name(&self) -> &str {
        "tephradb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let tmp = self.user.find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len() && self.user.compare(user_start, &tmp) == Ordering::Less {
            // Shortened physically and still a valid separator; give it the
            // maximum trailer so it sorts before all real entries for the
            // shortened user key.
            let mut sep = tmp;
            let mut trailer = [0u8; TRAILER_SIZE];
            LittleEndian::write_u64(
                &mut trailer,
                (MAX_SEQUENCE << 8) | TYPE_FOR_SEEK as u64,
            );
            sep.extend_from_slice(&trailer);
            debug_assert!(self.compare(start, &sep) == Ordering::Less);
            debug_assert!(self.compare(&sep, limit) == Ordering::Less);
            sep
        } else {
            start.to_vec()
        }
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let tmp = self.user.find_short_successor(user_key);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            let mut succ = tmp;
            let mut trailer = [0u8; TRAILER_SIZE];
            LittleEndian::write_u64(
                &mut trailer,
                (MAX_SEQUENCE << 8) | TYPE_FOR_SEEK as u64,
            );
            succ.extend_from_slice(&trailer);
            succ
        } else {
            key.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn ikey(user_key: &[u8], seq: u64, vtype: ValueType) -> Vec<u8> {
        let mut k = Vec::new();
        append_internal_key(&mut k, user_key, seq, vtype);
        k
    }

    #[test]
    fn test_pack_roundtrip() {
        let cases: &[(&[u8], u64, ValueType)] = &[
            (b"", 0, ValueType::Value),
            (b"foo", 1, ValueType::Value),
            (b"foo", 100, ValueType::Deletion),
            (b"a\x00b", MAX_SEQUENCE, ValueType::Value),
        ];
        for &(user_key, seq, vtype) in cases {
            let encoded = ikey(user_key, seq, vtype);
            let parsed = ParsedInternalKey::parse(&encoded).unwrap();
            assert_eq!(parsed.user_key, user_key);
            assert_eq!(parsed.sequence, seq);
            assert_eq!(parsed.value_type, vtype);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParsedInternalKey::parse(b"short").is_err());
        // Trailer with an unknown type byte.
        let mut bad = b"key".to_vec();
        let mut trailer = [0u8; 8];
        LittleEndian::write_u64(&mut trailer, (7 << 8) | 0x42);
        bad.extend_from_slice(&trailer);
        assert!(ParsedInternalKey::parse(&bad).is_err());
    }

    #[test]
    fn test_internal_key_ordering() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        // Ascending by user key, descending by sequence, descending by type.
        let ordered = vec![
            ikey(b"a", 100, ValueType::Value),
            ikey(b"a", 99, ValueType::Value),
            ikey(b"a", 99, ValueType::Deletion),
            ikey(b"b", 3, ValueType::Value),
            ikey(b"b", 2, ValueType::Deletion),
            ikey(b"c", MAX_SEQUENCE, ValueType::Value),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                icmp.compare(&pair[0], &pair[1]),
                Ordering::Less,
                "{:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_lookup_key_seeks_newest_visible() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let lookup = LookupKey::new(b"foo", 50);
        // Entries at or below the snapshot sort at-or-after the lookup key;
        // newer entries sort before it.
        assert_eq!(
            icmp.compare(lookup.internal_key(), &ikey(b"foo", 50, ValueType::Value)),
            Ordering::Less
        );
        assert_eq!(
            icmp.compare(&ikey(b"foo", 51, ValueType::Value), lookup.internal_key()),
            Ordering::Less
        );
        assert_eq!(
            icmp.compare(lookup.internal_key(), &ikey(b"fop", 1, ValueType::Value)),
            Ordering::Less
        );
    }

    #[test]
    fn test_separator_keeps_internal_order() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let start = ikey(b"abc1", 100, ValueType::Value);
        let limit = ikey(b"abd9", 20, ValueType::Value);
        let sep = icmp.find_shortest_separator(&start, &limit);
        assert!(icmp.compare(&start, &sep) != Ordering::Greater);
        assert_eq!(icmp.compare(&sep, &limit), Ordering::Less);
        assert!(sep.len() <= start.len());
    }
}
