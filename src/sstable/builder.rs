use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use super::block::BlockBuilder;
use super::filter_block::FilterBlockBuilder;
use super::{block_checksum, compress_block, BlockHandle, Footer};
use crate::comparator::Comparator;
use crate::config::{Compression, Options};
use crate::error::Result;
use crate::keys::InternalKeyComparator;

/// Builds a sorted table file from ascending internal keys.
///
/// Index entries are written lazily: when a data block fills, its index
/// key is deferred until the first key of the next block is known, so the
/// separator can be shortened to sit between the two.
pub struct TableBuilder {
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    writer: BufWriter<File>,
    file: File,
    offset: u64,
    num_entries: u64,
    last_key: Vec<u8>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    closed: bool,
}

impl TableBuilder {
    pub fn new(options: Arc<Options>, icmp: InternalKeyComparator, file: File) -> Result<Self> {
        let filter_block = options
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(policy.clone()));
        Ok(TableBuilder {
            writer: BufWriter::new(file.try_clone()?),
            file,
            data_block: BlockBuilder::new(options.block_restart_interval),
            // Index keys are sparse; restart every entry for cheap seeks.
            index_block: BlockBuilder::new(1),
            filter_block,
            options,
            icmp,
            offset: 0,
            num_entries: 0,
            last_key: Vec::new(),
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            closed: false,
        })
    }

    /// Appends an entry. Keys must arrive in ascending internal-key
    /// order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        debug_assert!(
            self.num_entries == 0
                || self.icmp.compare(&self.last_key, key) == std::cmp::Ordering::Less
        );

        if self.pending_index_entry {
            let separator = self.icmp.find_shortest_separator(&self.last_key, key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&separator, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(filter) = &mut self.filter_block {
            filter.add_key(crate::keys::extract_user_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);
        let contents = self.data_block.finish().to_vec();
        self.pending_handle = self.write_block(&contents, self.options.compression)?;
        self.data_block.reset();
        self.pending_index_entry = true;
        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    fn write_block(&mut self, contents: &[u8], compression: Compression) -> Result<BlockHandle> {
        let (payload, tag) = compress_block(contents, compression)?;
        let handle = BlockHandle::new(self.offset, payload.len() as u64);
        self.writer.write_all(&payload)?;
        self.writer.write_u8(tag)?;
        self.writer
            .write_u32::<LittleEndian>(block_checksum(&payload, tag))?;
        self.offset += payload.len() as u64 + super::BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }

    /// Writes the trailing metadata and syncs the file. The builder is
    /// unusable afterwards.
    pub fn finish(&mut self) -> Result<u64> {
        debug_assert!(!self.closed);
        self.flush_data_block()?;
        self.closed = true;

        // Filter block (stored raw so the reader never needs a codec to
        // decide whether to read).
        let filter_handle = match &mut self.filter_block {
            Some(filter) => {
                let contents = filter.finish().to_vec();
                Some(self.write_block(&contents, Compression::None)?)
            }
            None => None,
        };

        // Metaindex block.
        let mut metaindex = BlockBuilder::new(self.options.block_restart_interval);
        if let Some(handle) = filter_handle {
            let name = format!(
                "filter.{}",
                self.options.filter_policy.as_ref().unwrap().name()
            );
            let mut handle_encoding = Vec::new();
            handle.encode_to(&mut handle_encoding);
            metaindex.add(name.as_bytes(), &handle_encoding);
        }
        let metaindex_contents = metaindex.finish().to_vec();
        let metaindex_handle = self.write_block(&metaindex_contents, self.options.compression)?;

        // Index block, including the entry for the final data block.
        if self.pending_index_entry {
            let successor = self.icmp.find_short_successor(&self.last_key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&successor, &handle_encoding);
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish().to_vec();
        let index_handle = self.write_block(&index_contents, self.options.compression)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.writer.write_all(&footer.encode())?;
        self.offset += super::FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(self.offset)
    }

    /// Drops buffered state without writing the metadata; used when a
    /// compaction aborts and the partial file will be deleted.
    pub fn abandon(&mut self) {
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_size(&self) -> u64 {
        self.offset
    }
}
