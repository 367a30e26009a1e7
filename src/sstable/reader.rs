use std::fs::File;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use super::block::{Block, BlockIterator};
use super::filter_block::FilterBlockReader;
use super::{
    block_checksum, decompress_block, read_exact_at, BlockHandle, Footer, BLOCK_TRAILER_SIZE,
    FOOTER_SIZE,
};
use crate::comparator::{BytewiseComparator, Comparator};
use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::iterator::Iter;
use crate::keys::{extract_user_key, InternalKeyComparator};
use crate::Error;

/// An open sorted table: the footer, index, and filter are resident; data
/// blocks are read on demand.
pub struct Table {
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    file: File,
    size: u64,
    metaindex_handle: BlockHandle,
    index_block: Block,
    filter: Option<FilterBlockReader>,
}

impl Table {
    pub fn open(
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        file: File,
        size: u64,
    ) -> Result<Self> {
        if size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption("file too short to be a table".to_string()));
        }
        let mut footer_bytes = [0u8; FOOTER_SIZE];
        read_exact_at(&file, &mut footer_bytes, size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_bytes)?;

        let index_contents = read_verified_block(&file, footer.index_handle)?;
        let index_block = Block::new(index_contents)?;

        let mut table = Table {
            options,
            icmp,
            file,
            size,
            metaindex_handle: footer.metaindex_handle,
            index_block,
            filter: None,
        };
        table.read_filter(footer.metaindex_handle)?;
        Ok(table)
    }

    fn read_filter(&mut self, metaindex_handle: BlockHandle) -> Result<()> {
        let Some(policy) = self.options.filter_policy.clone() else {
            return Ok(());
        };
        let metaindex = Block::new(read_verified_block(&self.file, metaindex_handle)?)?;
        let mut iter = metaindex.iter(Arc::new(BytewiseComparator));
        let key = format!("filter.{}", policy.name());
        iter.seek(key.as_bytes());
        if iter.valid() && iter.key() == key.as_bytes() {
            let mut value = iter.value();
            let handle = BlockHandle::decode_from(&mut value)?;
            let contents = read_verified_block(&self.file, handle)?;
            self.filter = FilterBlockReader::new(policy, contents);
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Point probe: returns the first entry at or after `internal_key`
    /// within the data block the index points at, or `None` when the
    /// filter or block rules the key out.
    pub fn internal_get(
        &self,
        ropts: &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(comparator_handle(&self.icmp));
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            return Ok(None);
        }
        let mut handle_bytes = index_iter.value();
        let handle = BlockHandle::decode_from(&mut handle_bytes)?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, extract_user_key(internal_key)) {
                return Ok(None);
            }
        }

        let block = self.read_data_block(ropts, handle)?;
        let mut block_iter = block.iter(comparator_handle(&self.icmp));
        block_iter.seek(internal_key);
        block_iter.status()?;
        if block_iter.valid() {
            Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
        } else {
            Ok(None)
        }
    }

    fn read_data_block(&self, ropts: &ReadOptions, handle: BlockHandle) -> Result<Block> {
        let contents = read_block(&self.file, handle, ropts.verify_checksums)?;
        Block::new(contents)
    }

    /// Two-level cursor over the whole table.
    pub fn iter(self: &Arc<Self>, ropts: ReadOptions) -> TableIterator {
        TableIterator {
            table: self.clone(),
            ropts,
            index_iter: self.index_block.iter(comparator_handle(&self.icmp)),
            data_iter: None,
            current_handle: None,
            status: Ok(()),
        }
    }

    /// Approximate file offset where `internal_key` would live; an upper
    /// bound of the data area for keys past the end.
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(comparator_handle(&self.icmp));
        index_iter.seek(internal_key);
        if index_iter.valid() {
            let mut handle_bytes = index_iter.value();
            if let Ok(handle) = BlockHandle::decode_from(&mut handle_bytes) {
                return handle.offset;
            }
        }
        self.metaindex_handle.offset
    }
}

fn comparator_handle(icmp: &InternalKeyComparator) -> Arc<dyn Comparator> {
    Arc::new(icmp.clone())
}

/// Reads a stored block, optionally validating its trailer checksum, and
/// undoes compression.
fn read_block(file: &File, handle: BlockHandle, verify_checksum: bool) -> Result<Vec<u8>> {
    let mut raw = vec![0u8; handle.size as usize + BLOCK_TRAILER_SIZE];
    read_exact_at(file, &mut raw, handle.offset)?;
    let payload = &raw[..handle.size as usize];
    let tag = raw[handle.size as usize];
    if verify_checksum {
        let stored = LittleEndian::read_u32(&raw[handle.size as usize + 1..]);
        if block_checksum(payload, tag) != stored {
            return Err(Error::Corruption("block checksum mismatch".to_string()));
        }
    }
    decompress_block(payload, tag)
}

/// Like `read_block` with the checksum always enforced; used for the
/// metadata blocks read at open.
fn read_verified_block(file: &File, handle: BlockHandle) -> Result<Vec<u8>> {
    read_block(file, handle, true)
}

/// Index-then-block cursor. The data block tracks the index position and
/// is (re)read lazily; empty or exhausted blocks are skipped in the
/// direction of travel.
pub struct TableIterator {
    table: Arc<Table>,
    ropts: ReadOptions,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
    current_handle: Option<BlockHandle>,
    status: Result<()>,
}

impl TableIterator {
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            self.current_handle = None;
            return;
        }
        let mut handle_bytes = self.index_iter.value();
        let handle = match BlockHandle::decode_from(&mut handle_bytes) {
            Ok(h) => h,
            Err(e) => {
                self.status = Err(e);
                self.data_iter = None;
                self.current_handle = None;
                return;
            }
        };
        if self.current_handle == Some(handle) && self.data_iter.is_some() {
            return;
        }
        match self.table.read_data_block(&self.ropts, handle) {
            Ok(block) => {
                self.data_iter = Some(block.iter(comparator_handle(&self.table.icmp)));
                self.current_handle = Some(handle);
            }
            Err(e) => {
                self.status = Err(e);
                self.data_iter = None;
                self.current_handle = None;
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_last();
            }
        }
    }
}

impl Iter for TableIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|d| d.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data_iter {
            data.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data_iter {
            data.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not valid").value()
    }

    fn status(&self) -> Result<()> {
        self.status.clone()?;
        self.index_iter.status()?;
        if let Some(data) = &self.data_iter {
            data.status()?;
        }
        Ok(())
    }
}
