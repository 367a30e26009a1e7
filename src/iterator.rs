//! Cursor-style iterators.
//!
//! LSM reads are built from cursors that can seek and walk both ways,
//! which `std::iter::Iterator` cannot express; every internal source
//! (memtable, table block, level file list) implements `Iter` and the
//! merging iterator folds them into one ordered stream.

use std::cmp::Ordering;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::keys::InternalKeyComparator;

/// A positioned cursor over ordered key/value entries.
///
/// `key`/`value` may only be called while `valid()`; errors encountered
/// while stepping park the cursor invalid and surface through `status`.
pub trait Iter {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Positions at the first entry with key >= target.
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

/// A cursor over nothing, optionally carrying an error.
pub struct EmptyIterator {
    status: Result<()>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        EmptyIterator { status: Ok(()) }
    }

    pub fn with_error(err: crate::Error) -> Self {
        EmptyIterator { status: Err(err) }
    }
}

impl Iter for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn key(&self) -> &[u8] {
        panic!("empty iterator has no key")
    }
    fn value(&self) -> &[u8] {
        panic!("empty iterator has no value")
    }
    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges N child cursors into one stream ordered by the internal-key
/// comparator. Children at the same key are ranked by child index, so
/// callers list newer sources first.
///
/// The cursor tracks its travel direction; reversing re-seeks the other
/// children around the current key before stepping, making forward and
/// backward iteration symmetric.
pub struct MergingIterator {
    icmp: InternalKeyComparator,
    children: Vec<Box<dyn Iter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(icmp: InternalKeyComparator, children: Vec<Box<dyn Iter>>) -> Self {
        MergingIterator {
            icmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.icmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.icmp.compare(child.key(), self.children[l].key()) != Ordering::Less {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl Iter for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let Some(cur) = self.current else { return };

        if self.direction != Direction::Forward {
            // The other children sit before the current key; bring each to
            // the first entry after it.
            let current_key = self.children[cur].key().to_vec();
            for i in 0..self.children.len() {
                if i == cur {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&current_key);
                if child.valid()
                    && self.icmp.compare(&current_key, child.key()) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[cur].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let Some(cur) = self.current else { return };

        if self.direction != Direction::Reverse {
            // Park every other child on the last entry before the current
            // key.
            let current_key = self.children[cur].key().to_vec();
            for i in 0..self.children.len() {
                if i == cur {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&current_key);
                if child.valid() {
                    // Positioned at the first entry >= current; step back.
                    child.prev();
                } else {
                    // Everything in this child is < current.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[cur].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("iterator not valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator not valid")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::keys::{append_internal_key, ParsedInternalKey, ValueType};
    use std::sync::Arc;

    /// In-memory sorted cursor for tests.
    struct VecIter {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
        icmp: InternalKeyComparator,
    }

    impl VecIter {
        fn new(icmp: InternalKeyComparator, mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            entries.sort_by(|a, b| icmp.compare(&a.0, &b.0));
            VecIter {
                entries,
                pos: None,
                icmp,
            }
        }
    }

    impl Iter for VecIter {
        fn valid(&self) -> bool {
            self.pos.is_some()
        }
        fn seek_to_first(&mut self) {
            self.pos = if self.entries.is_empty() { None } else { Some(0) };
        }
        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1);
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .iter()
                .position(|(k, _)| self.icmp.compare(k, target) != Ordering::Less);
        }
        fn next(&mut self) {
            if let Some(p) = self.pos {
                self.pos = if p + 1 < self.entries.len() {
                    Some(p + 1)
                } else {
                    None
                };
            }
        }
        fn prev(&mut self) {
            self.pos = match self.pos {
                Some(p) => p.checked_sub(1),
                None => None,
            };
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
    }

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn entry(user_key: &[u8], seq: u64, value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut k = Vec::new();
        append_internal_key(&mut k, user_key, seq, ValueType::Value);
        (k, value.to_vec())
    }

    fn merged(children_entries: Vec<Vec<(Vec<u8>, Vec<u8>)>>) -> MergingIterator {
        let children: Vec<Box<dyn Iter>> = children_entries
            .into_iter()
            .map(|e| Box::new(VecIter::new(icmp(), e)) as Box<dyn Iter>)
            .collect();
        MergingIterator::new(icmp(), children)
    }

    fn user_keys_forward(iter: &mut MergingIterator) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push(
                ParsedInternalKey::parse(iter.key())
                    .unwrap()
                    .user_key
                    .to_vec(),
            );
            iter.next();
        }
        out
    }

    #[test]
    fn test_merge_two_sources() {
        let mut iter = merged(vec![
            vec![entry(b"a", 10, b"1"), entry(b"c", 10, b"3")],
            vec![entry(b"b", 5, b"2"), entry(b"d", 5, b"4")],
        ]);
        assert_eq!(
            user_keys_forward(&mut iter),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_same_user_key_newest_first() {
        let mut iter = merged(vec![
            vec![entry(b"k", 20, b"new")],
            vec![entry(b"k", 10, b"old")],
        ]);
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(ParsedInternalKey::parse(iter.key()).unwrap().sequence, 20);
        iter.next();
        assert!(iter.valid());
        assert_eq!(ParsedInternalKey::parse(iter.key()).unwrap().sequence, 10);
    }

    #[test]
    fn test_reverse_is_mirror_of_forward() {
        let mut iter = merged(vec![
            vec![entry(b"a", 3, b""), entry(b"c", 3, b""), entry(b"e", 3, b"")],
            vec![entry(b"b", 2, b""), entry(b"d", 2, b"")],
            vec![],
        ]);
        let forward = user_keys_forward(&mut iter);

        let mut backward = Vec::new();
        iter.seek_to_last();
        while iter.valid() {
            backward.push(
                ParsedInternalKey::parse(iter.key())
                    .unwrap()
                    .user_key
                    .to_vec(),
            );
            iter.prev();
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_direction_changes_mid_stream() {
        let mut iter = merged(vec![
            vec![entry(b"a", 3, b""), entry(b"c", 3, b"")],
            vec![entry(b"b", 2, b""), entry(b"d", 2, b"")],
        ]);
        iter.seek_to_first();
        iter.next(); // at b
        iter.next(); // at c
        let at_c = ParsedInternalKey::parse(iter.key()).unwrap().user_key.to_vec();
        assert_eq!(at_c, b"c");
        iter.prev(); // back to b
        assert_eq!(ParsedInternalKey::parse(iter.key()).unwrap().user_key, b"b");
        iter.next(); // forward again to c
        assert_eq!(ParsedInternalKey::parse(iter.key()).unwrap().user_key, b"c");
    }

    #[test]
    fn test_seek() {
        let mut iter = merged(vec![
            vec![entry(b"a", 3, b""), entry(b"c", 3, b"")],
            vec![entry(b"b", 2, b""), entry(b"d", 2, b"")],
        ]);
        let mut target = Vec::new();
        append_internal_key(&mut target, b"b", crate::keys::MAX_SEQUENCE, ValueType::Value);
        iter.seek(&target);
        assert!(iter.valid());
        assert_eq!(ParsedInternalKey::parse(iter.key()).unwrap().user_key, b"b");
    }

    #[test]
    fn test_all_empty_children() {
        let mut iter = merged(vec![vec![], vec![]]);
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
    }
}
