use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::filenames::{sst_table_file_name, table_file_name};
use crate::iterator::{EmptyIterator, Iter};
use crate::keys::InternalKeyComparator;
use crate::sstable::Table;

/// Shared, bounded cache of open table handles keyed by file number.
///
/// Every point and range read goes through here; a file removed from the
/// last live version is evicted before it is unlinked. Eviction only
/// drops the cache's reference: live iterators keep their table alive
/// through their own `Arc`.
pub struct TableCache {
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    db_path: PathBuf,
    inner: Mutex<Lru>,
    stats: Stats,
}

struct Lru {
    capacity: usize,
    entries: HashMap<u64, Arc<Table>>,
    /// Access order, least recent at the front.
    order: VecDeque<u64>,
}

impl Lru {
    fn touch(&mut self, file_number: u64) {
        if let Some(pos) = self.order.iter().position(|&n| n == file_number) {
            self.order.remove(pos);
        }
        self.order.push_back(file_number);
    }

    fn insert(&mut self, file_number: u64, table: Arc<Table>) {
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(victim) => {
                    self.entries.remove(&victim);
                }
                None => break,
            }
        }
        self.entries.insert(file_number, table);
        self.order.push_back(file_number);
    }

    fn remove(&mut self, file_number: u64) {
        self.entries.remove(&file_number);
        if let Some(pos) = self.order.iter().position(|&n| n == file_number) {
            self.order.remove(pos);
        }
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl TableCache {
    pub fn new(db_path: PathBuf, options: Arc<Options>, icmp: InternalKeyComparator) -> Self {
        TableCache {
            inner: Mutex::new(Lru {
                capacity: options.max_open_files.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            stats: Stats {
                hits: AtomicUsize::new(0),
                misses: AtomicUsize::new(0),
            },
            options,
            icmp,
            db_path,
        }
    }

    /// Returns the open handle for a table, opening and caching it on a
    /// miss. Both table suffixes are tried, newest first.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        {
            let mut inner = self.inner.lock()?;
            if let Some(table) = inner.entries.get(&file_number).cloned() {
                inner.touch(file_number);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(table);
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let path = table_file_name(&self.db_path, file_number);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => File::open(sst_table_file_name(&self.db_path, file_number))
                .map_err(|_| crate::Error::Io(format!("missing table file {}", path.display())))?,
        };
        let table = Arc::new(Table::open(
            self.options.clone(),
            self.icmp.clone(),
            file,
            file_size,
        )?);

        let mut inner = self.inner.lock()?;
        inner.insert(file_number, table.clone());
        Ok(table)
    }

    /// Point probe through the cache.
    pub fn get(
        &self,
        ropts: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(ropts, internal_key)
    }

    /// Cursor over one table; open failures surface through the
    /// iterator's status.
    pub fn iter(&self, ropts: ReadOptions, file_number: u64, file_size: u64) -> Box<dyn Iter> {
        match self.find_table(file_number, file_size) {
            Ok(table) => Box::new(table.iter(ropts)),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// Drops the cached handle; called before the file is unlinked.
    pub fn evict(&self, file_number: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(file_number);
        }
    }

    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
        )
    }
}
