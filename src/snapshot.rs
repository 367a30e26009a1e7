use std::collections::VecDeque;
use std::sync::Arc;

/// A pinned sequence number. Reads taken against a snapshot see exactly
/// the writes committed at or before it; compaction keeps every entry a
/// live snapshot might still need.
///
/// Cheap to clone; the database tracks liveness through the handle's
/// reference count, so dropping every clone without calling
/// `release_snapshot` still lets the pin expire on the next sweep.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    sequence: u64,
}

impl Snapshot {
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Live snapshots ordered by acquisition, which is also sequence order.
/// The oldest pin, the one compaction cares about, is always at the
/// front.
#[derive(Default)]
pub struct SnapshotList {
    snapshots: VecDeque<Snapshot>,
}

impl SnapshotList {
    /// Pins `sequence`. Sequences are handed out monotonically, so
    /// pushing at the back keeps the deque ordered.
    pub fn acquire(&mut self, sequence: u64) -> Snapshot {
        debug_assert!(self
            .snapshots
            .back()
            .map_or(true, |s| s.sequence() <= sequence));
        let snapshot = Snapshot {
            inner: Arc::new(SnapshotInner { sequence }),
        };
        self.snapshots.push_back(snapshot.clone());
        snapshot
    }

    /// Unpins one handle. Also drops any pins whose every user handle is
    /// gone, so leaked snapshots cannot hold compaction back forever.
    pub fn release(&mut self, snapshot: &Snapshot) {
        let mut released = false;
        self.snapshots.retain(|s| {
            if !released && s.ptr_eq(snapshot) {
                released = true;
                return false;
            }
            // Count: one here, one in the caller's handle (if any remain).
            Arc::strong_count(&s.inner) > 1
        });
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Sequence of the oldest live pin.
    pub fn oldest(&self) -> Option<u64> {
        self.snapshots.front().map(|s| s.sequence())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }
}
