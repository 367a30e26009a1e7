use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;

/// Number of on-disk levels.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which writes are slowed by 1ms each.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stop until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be pushed to when nothing
/// overlaps it.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Block compression applied when writing sorted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
    Zstd,
}

impl Compression {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Snappy => 1,
            Compression::Zstd => 2,
        }
    }
}

/// Database-wide configuration.
///
/// Construct with `Options::new()` and chain the builder methods, in the
/// same style as per-call `ReadOptions`/`WriteOptions`.
#[derive(Clone)]
pub struct Options {
    /// Create the database directory and bootstrap files if missing.
    pub create_if_missing: bool,

    /// Refuse to open a database that already exists.
    pub error_if_exists: bool,

    /// Escalate recoverable corruption (torn WAL tail) to hard errors.
    pub paranoid_checks: bool,

    /// Total order over user keys. Persisted by name; reopening under a
    /// differently-named comparator fails.
    pub comparator: Arc<dyn Comparator>,

    /// Memtable size that triggers rotation to an immutable memtable
    /// (default: 4MB).
    pub write_buffer_size: usize,

    /// Bound on concurrently open table files (default: 1000).
    pub max_open_files: usize,

    /// Accepted for compatibility with embedders that share a block-level
    /// cache; the block codec treats caching as external and this engine
    /// does not consult it.
    pub block_cache: Option<usize>,

    /// Uncompressed data block target size (default: 4KB).
    pub block_size: usize,

    /// Keys between restart points in a block (default: 16).
    pub block_restart_interval: usize,

    /// Target size of output table files (default: 2MB).
    pub max_file_size: u64,

    /// Block compression (default: Snappy).
    pub compression: Compression,

    /// On recovery, append to the surviving log instead of sealing it.
    pub reuse_logs: bool,

    /// Optional per-table filter consulted before block reads.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            comparator: Arc::new(BytewiseComparator),
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache: None,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: Compression::Snappy,
            reuse_logs: false,
            filter_policy: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    pub fn paranoid_checks(mut self, value: bool) -> Self {
        self.paranoid_checks = value;
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn reuse_logs(mut self, value: bool) -> Self {
        self.reuse_logs = value;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Maximum total bytes for a level before it scores a compaction.
    pub(crate) fn max_bytes_for_level(level: usize) -> f64 {
        // Level 0 scores by file count instead; level 1 starts at 10MB and
        // each deeper level grows tenfold.
        let mut result = 10.0 * 1048576.0;
        let mut l = level;
        while l > 1 {
            result *= 10.0;
            l -= 1;
        }
        result
    }

    /// Maximum bytes of grandparent overlap before a compaction output is
    /// rotated.
    pub(crate) fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Cap on total input size when re-expanding the lower level of a
    /// compaction.
    pub(crate) fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size
    }
}

/// Options for a single read.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Verify block checksums on every read.
    pub verify_checksums: bool,

    /// Read as of this snapshot instead of the latest state.
    pub snapshot: Option<crate::snapshot::Snapshot>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify_checksums(mut self, value: bool) -> Self {
        self.verify_checksums = value;
        self
    }

    pub fn snapshot(mut self, snapshot: crate::snapshot::Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Options for a single write.
#[derive(Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the log before acknowledging the write.
    pub sync: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, value: bool) -> Self {
        self.sync = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(!opts.create_if_missing);
        assert_eq!(opts.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(opts.max_open_files, 1000);
        assert_eq!(opts.compression, Compression::Snappy);
    }

    #[test]
    fn test_builder_chain() {
        let opts = Options::new()
            .create_if_missing(true)
            .write_buffer_size(64 * 1024)
            .compression(Compression::None)
            .reuse_logs(true);
        assert!(opts.create_if_missing);
        assert_eq!(opts.write_buffer_size, 64 * 1024);
        assert_eq!(opts.compression, Compression::None);
        assert!(opts.reuse_logs);
    }

    #[test]
    fn test_level_byte_targets_grow_tenfold() {
        assert_eq!(Options::max_bytes_for_level(1), 10.0 * 1048576.0);
        assert_eq!(Options::max_bytes_for_level(2), 100.0 * 1048576.0);
        assert_eq!(Options::max_bytes_for_level(3), 1000.0 * 1048576.0);
    }
}
