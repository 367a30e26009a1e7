use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{record_checksum, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::error::Result;

/// Appends logical records to a block-framed log file.
pub struct LogWriter {
    writer: BufWriter<File>,
    file: File,
    /// Write offset within the current block.
    block_offset: usize,
}

impl LogWriter {
    /// Creates a fresh log file, truncating any existing one.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file.try_clone()?),
            file,
            block_offset: 0,
        })
    }

    /// Opens an existing log for appending, picking up mid-block where the
    /// previous writer stopped. Used when `reuse_logs` keeps the recovered
    /// log alive.
    pub fn open_for_append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        Ok(Self {
            writer: BufWriter::new(file.try_clone()?),
            file,
            block_offset: len % BLOCK_SIZE,
        })
    }

    /// Appends one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too small for a header; zero-fill and move to a new block.
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = remaining.len().min(available);
            let end = fragment_len == remaining.len();
            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            let (fragment, rest) = remaining.split_at(fragment_len);
            self.emit_physical_record(record_type, fragment)?;
            remaining = rest;
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    fn emit_physical_record(&mut self, record_type: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        self.writer
            .write_u32::<LittleEndian>(record_checksum(record_type, payload))?;
        self.writer.write_u16::<LittleEndian>(payload.len() as u16)?;
        self.writer.write_u8(record_type as u8)?;
        self.writer.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    /// Pushes buffered bytes to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
