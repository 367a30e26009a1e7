//! The user-facing iterator: internal entries filtered to the visible
//! key space.
//!
//! The merged internal stream carries every sequence of every key plus
//! tombstones. This wrapper collapses it to user semantics: newest
//! visible entry per key, deleted keys hidden, both directions
//! supported. Forward motion reads directly off the merged cursor;
//! reverse motion buffers the winning entry while the cursor backs
//! through older versions of the same key.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::config::ReadOptions;
use crate::error::Result;
use crate::iterator::{Iter, MergingIterator};
use crate::keys::{extract_user_key, LookupKey, ParsedInternalKey, ValueType};
use crate::snapshot::Snapshot;
use crate::version::Version;
use crate::Error;

use super::DbInner;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Keeps everything an iterator reads alive: the version (and through
/// it the table files), the memtables (held by their child cursors), and
/// a snapshot pin released when the iterator drops.
pub(crate) struct IterPins {
    pub(crate) _version: Arc<Version>,
    pub(crate) inner: Arc<DbInner>,
    pub(crate) snapshot: Option<Snapshot>,
}

impl Drop for IterPins {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Ok(mut state) = self.inner.state.lock() {
                state.snapshots.release(&snapshot);
            }
        }
    }
}

/// Builds the merged internal cursor over the current memtables and
/// version. Returns the cursor, the pins keeping its sources alive, and
/// the latest committed sequence at the time of construction.
pub(crate) fn internal_iterator(
    inner: &Arc<DbInner>,
    ropts: ReadOptions,
) -> Result<(MergingIterator, IterPins, u64)> {
    let state = inner.state.lock()?;
    let mut children: Vec<Box<dyn Iter>> = Vec::new();
    children.push(Box::new(state.mem.iter()));
    if let Some(imm) = &state.imm {
        children.push(Box::new(imm.iter()));
    }
    let version = state.versions.current();
    version.add_iterators(&ropts, &inner.table_cache, &mut children);
    let latest_sequence = state.versions.last_sequence();
    drop(state);

    Ok((
        MergingIterator::new(inner.icmp.clone(), children),
        IterPins {
            _version: version,
            inner: inner.clone(),
            snapshot: None,
        },
        latest_sequence,
    ))
}

pub(crate) fn new_db_iterator(inner: &Arc<DbInner>, ropts: ReadOptions) -> Result<DbIterator> {
    let explicit_snapshot = ropts.snapshot.clone();
    let (merged, mut pins, latest_sequence) = internal_iterator(inner, ropts)?;
    let sequence = match &explicit_snapshot {
        Some(snapshot) => snapshot.sequence(),
        None => {
            // Pin the implied snapshot so compaction keeps its entries
            // until the iterator goes away.
            let mut state = inner.state.lock()?;
            pins.snapshot = Some(state.snapshots.acquire(latest_sequence));
            latest_sequence
        }
    };

    Ok(DbIterator {
        merged,
        sequence,
        direction: Direction::Forward,
        valid: false,
        saved_key: Vec::new(),
        saved_value: Vec::new(),
        status: Ok(()),
        pins,
    })
}

/// Snapshot-consistent cursor over user keys and values.
pub struct DbIterator {
    merged: MergingIterator,
    sequence: u64,
    direction: Direction,
    valid: bool,
    /// Forward: the user key being skipped. Reverse: the current entry.
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    status: Result<()>,
    pins: IterPins,
}

impl DbIterator {
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.merged.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.merged.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()?;
        self.merged.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.merged.seek_to_first();
        if self.merged.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.merged.seek_to_last();
        self.find_prev_user_entry();
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();
        let lookup = LookupKey::new(target, self.sequence);
        self.merged.seek(lookup.internal_key());
        if self.merged.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The merged cursor sits before every entry of saved_key, so
            // stepping forward lands inside them; skip the lot.
            if !self.merged.valid() {
                self.merged.seek_to_first();
            } else {
                self.merged.next();
            }
            if !self.merged.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.merged.key()));
            self.merged.next();
            if !self.merged.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }
        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Forward {
            // Back the merged cursor off the current user key entirely.
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.merged.key()));
            loop {
                self.merged.prev();
                if !self.merged.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .ucmp_compare(extract_user_key(self.merged.key()), &self.saved_key)
                    == CmpOrdering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    fn ucmp_compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
        self.pins.inner.icmp.user_comparator().compare(a, b)
    }

    /// Advances to the first visible, non-deleted entry; with `skipping`
    /// set, entries for `saved_key` (and anything older under a
    /// tombstone) are passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.merged.valid());
        debug_assert!(self.direction == Direction::Forward);
        loop {
            match ParsedInternalKey::parse(self.merged.key()) {
                Ok(ikey) if ikey.sequence <= self.sequence => match ikey.value_type {
                    ValueType::Deletion => {
                        // Everything older with this user key is hidden.
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(ikey.user_key);
                        skipping = true;
                    }
                    ValueType::Value => {
                        if skipping
                            && self.ucmp_compare(ikey.user_key, &self.saved_key)
                                != CmpOrdering::Greater
                        {
                            // Shadowed by a newer entry or tombstone.
                        } else {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                },
                Ok(_) => {
                    // Newer than the snapshot; invisible to this cursor.
                }
                Err(_) => {
                    if self.status.is_ok() {
                        self.status = Err(Error::Corruption(
                            "unparseable internal key in iterator".to_string(),
                        ));
                    }
                }
            }
            self.merged.next();
            if !self.merged.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Walks backwards accumulating the newest visible entry of the
    /// nearest preceding user key into `saved_key`/`saved_value`.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);
        // Deletion doubles as "nothing buffered yet".
        let mut value_type = ValueType::Deletion;
        while self.merged.valid() {
            match ParsedInternalKey::parse(self.merged.key()) {
                Ok(ikey) if ikey.sequence <= self.sequence => {
                    if value_type != ValueType::Deletion
                        && self.ucmp_compare(ikey.user_key, &self.saved_key) == CmpOrdering::Less
                    {
                        // Stepped onto the previous user key; the buffer
                        // holds the winner.
                        break;
                    }
                    value_type = ikey.value_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(ikey.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.merged.value());
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    if self.status.is_ok() {
                        self.status = Err(Error::Corruption(
                            "unparseable internal key in iterator".to_string(),
                        ));
                    }
                }
            }
            self.merged.prev();
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}
