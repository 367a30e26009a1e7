//! In-memory sorted table absorbing writes before flush.
//!
//! Backed by `crossbeam_skiplist::SkipMap`, which gives lock-free
//! concurrent readers against the single writer the engine guarantees.
//! Keys are encoded internal keys ordered through the internal-key
//! comparator, so entries for one user key sit newest-first and a seek
//! from a `LookupKey` lands on the newest entry visible at its sequence.
//!
//! A memtable is never mutated after rotation; the skiplist's append-only
//! structure keeps cursors valid while later writes continue.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::Iter;
use crate::keys::{
    append_internal_key, extract_user_key, InternalKeyComparator, LookupKey, ParsedInternalKey,
    ValueType,
};
use crate::Error;

/// Skiplist key: an encoded internal key carrying its ordering.
///
/// The comparator handle rides along in every key so the `Ord` impl the
/// skiplist needs can reach the user comparator.
struct MemKey {
    data: Vec<u8>,
    icmp: Arc<InternalKeyComparator>,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.data, &other.data)
    }
}

/// Result of a point probe: distinguishes "present", "deleted here", and
/// "not in this memtable" so the read path knows whether to keep looking
/// in older sources.
pub enum MemGet {
    Found(Vec<u8>),
    Deleted,
    NotFound,
}

pub struct MemTable {
    icmp: Arc<InternalKeyComparator>,
    /// Shared with live iterators, which outlive the table wrapper.
    data: Arc<SkipMap<MemKey, Vec<u8>>>,
    memory_usage: AtomicUsize,
}

impl MemTable {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        MemTable {
            icmp: Arc::new(icmp),
            data: Arc::new(SkipMap::new()),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Inserts an entry. Called only from the write path, which admits a
    /// single effective writer at a time.
    pub fn add(&self, sequence: u64, vtype: ValueType, user_key: &[u8], value: &[u8]) {
        let mut key = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut key, user_key, sequence, vtype);
        self.memory_usage
            .fetch_add(key.len() + value.len(), AtomicOrdering::Relaxed);
        self.data.insert(
            MemKey {
                data: key,
                icmp: self.icmp.clone(),
            },
            value.to_vec(),
        );
    }

    /// Probes for the newest entry visible at the lookup key's sequence.
    pub fn get(&self, key: &LookupKey) -> MemGet {
        let seek = MemKey {
            data: key.internal_key().to_vec(),
            icmp: self.icmp.clone(),
        };
        // The first entry at or after the seek position either belongs to
        // this user key (and decides the outcome) or to a later one.
        if let Some(entry) = self.data.range((Bound::Included(&seek), Bound::Unbounded)).next() {
            let found = &entry.key().data;
            if self
                .icmp
                .compare_user_keys(extract_user_key(found), key.user_key())
                == Ordering::Equal
            {
                match ParsedInternalKey::parse(found) {
                    Ok(parsed) if parsed.value_type == ValueType::Value => {
                        return MemGet::Found(entry.value().clone());
                    }
                    _ => return MemGet::Deleted,
                }
            }
        }
        MemGet::NotFound
    }

    /// Bytes consumed by keys and values. Decides rotation.
    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cursor over the internal keys. Stays valid while writes continue.
    pub fn iter(&self) -> MemTableIterator {
        MemTableIterator {
            data: self.data.clone(),
            icmp: self.icmp.clone(),
            current: None,
        }
    }
}

/// Forward/backward cursor over a memtable.
///
/// Holds the current position as an owned key and re-seeks the skiplist
/// for each step, the same stateless-range pattern the skiplist supports
/// natively; each step is a logarithmic probe.
pub struct MemTableIterator {
    data: Arc<SkipMap<MemKey, Vec<u8>>>,
    icmp: Arc<InternalKeyComparator>,
    /// Encoded internal key + value at the current position.
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemTableIterator {
    fn seek_key(&self, data: &[u8]) -> MemKey {
        MemKey {
            data: data.to_vec(),
            icmp: self.icmp.clone(),
        }
    }
}

impl Iter for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.current = self
            .data
            .front()
            .map(|e| (e.key().data.clone(), e.value().clone()));
    }

    fn seek_to_last(&mut self) {
        self.current = self
            .data
            .back()
            .map(|e| (e.key().data.clone(), e.value().clone()));
    }

    fn seek(&mut self, target: &[u8]) {
        let seek = self.seek_key(target);
        self.current = self
            .data
            .range((Bound::Included(&seek), Bound::Unbounded))
            .next()
            .map(|e| (e.key().data.clone(), e.value().clone()));
    }

    fn next(&mut self) {
        let Some((key, _)) = &self.current else {
            return;
        };
        let seek = self.seek_key(key);
        self.current = self
            .data
            .range((Bound::Excluded(&seek), Bound::Unbounded))
            .next()
            .map(|e| (e.key().data.clone(), e.value().clone()));
    }

    fn prev(&mut self) {
        let Some((key, _)) = &self.current else {
            return;
        };
        let seek = self.seek_key(key);
        self.current = self
            .data
            .range((Bound::Unbounded, Bound::Excluded(&seek)))
            .next_back()
            .map(|e| (e.key().data.clone(), e.value().clone()));
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

impl MemTable {
    /// Replays the table into an error if the comparator rejects a key;
    /// used by recovery diagnostics.
    pub fn validate(&self) -> Result<()> {
        for entry in self.data.iter() {
            ParsedInternalKey::parse(&entry.key().data)
                .map_err(|_| Error::Corruption("memtable holds unparseable key".to_string()))?;
        }
        Ok(())
    }
}
