//! tephradb: an embedded, ordered key-value store built on a leveled
//! log-structured merge-tree.
//!
//! Writes land in a write-ahead log and an in-memory table; filled
//! memtables flush to immutable sorted table files organized in levels;
//! a background worker merges levels downward, bounding read
//! amplification and collapsing deleted data. Reads and iterators are
//! snapshot-consistent. One process owns a database directory at a time.
//!
//! ```no_run
//! use tephradb::{Db, Options, ReadOptions, WriteOptions};
//!
//! let db = Db::open(Options::new().create_if_missing(true), "/tmp/demo-db")?;
//! db.put(&WriteOptions::new(), b"planet", b"tephra")?;
//! assert_eq!(
//!     db.get(&ReadOptions::new(), b"planet")?,
//!     Some(b"tephra".to_vec())
//! );
//! # Ok::<(), tephradb::Error>(())
//! ```

pub mod batch;
pub mod coding;
pub mod comparator;
pub mod config;
pub mod db;
pub mod error;
pub mod filenames;
pub mod filter;
pub mod flock;
pub mod iterator;
pub mod keys;
pub mod memtable;
pub mod snapshot;
pub mod sstable;
pub mod table_cache;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use comparator::{BytewiseComparator, Comparator};
pub use config::{Compression, Options, ReadOptions, WriteOptions};
pub use db::{Db, DbIterator};
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use snapshot::Snapshot;
