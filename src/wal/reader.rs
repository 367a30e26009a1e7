use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::{record_checksum, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::error::Result;
use crate::Error;

/// Replays logical records from a block-framed log file.
///
/// Used only during recovery. Any framing or checksum failure surfaces as
/// `Corruption`; the caller decides whether that ends replay quietly (the
/// torn-tail case) or fails the open (`paranoid_checks`).
pub struct LogReader {
    file: File,
    /// Unconsumed slice of the current block.
    block: Vec<u8>,
    block_len: usize,
    offset: usize,
    eof: bool,
}

enum Physical {
    Record(RecordType, Vec<u8>),
    EndOfFile,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            block: vec![0u8; BLOCK_SIZE],
            block_len: 0,
            offset: 0,
            eof: false,
        })
    }

    /// Returns the next logical record, or `None` at a clean end of file.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Physical::EndOfFile => {
                    if in_fragmented_record {
                        // A FIRST without its LAST: the writer died mid-record.
                        return Err(Error::Corruption(
                            "log ended inside a fragmented record".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                Physical::Record(RecordType::Full, payload) => {
                    if in_fragmented_record {
                        return Err(Error::Corruption(
                            "full record inside a fragmented record".to_string(),
                        ));
                    }
                    return Ok(Some(payload));
                }
                Physical::Record(RecordType::First, payload) => {
                    if in_fragmented_record {
                        return Err(Error::Corruption(
                            "two first fragments without a last".to_string(),
                        ));
                    }
                    scratch = payload;
                    in_fragmented_record = true;
                }
                Physical::Record(RecordType::Middle, payload) => {
                    if !in_fragmented_record {
                        return Err(Error::Corruption(
                            "middle fragment without a first".to_string(),
                        ));
                    }
                    scratch.extend_from_slice(&payload);
                }
                Physical::Record(RecordType::Last, payload) => {
                    if !in_fragmented_record {
                        return Err(Error::Corruption(
                            "last fragment without a first".to_string(),
                        ));
                    }
                    scratch.extend_from_slice(&payload);
                    return Ok(Some(scratch));
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            if self.block_len - self.offset < HEADER_SIZE {
                // Block tail (zero-filled or empty); fetch the next block.
                if self.eof {
                    // A partial header at the very end of the file is a torn
                    // write, indistinguishable from the zero-fill case only
                    // when it is all zeros; either way there is no record.
                    return Ok(Physical::EndOfFile);
                }
                self.refill()?;
                continue;
            }

            let header = &self.block[self.offset..self.offset + HEADER_SIZE];
            let expected_crc = LittleEndian::read_u32(&header[0..4]);
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let type_byte = header[6];

            if type_byte == 0 && length == 0 && expected_crc == 0 {
                // Zero-filled block tail.
                self.offset = self.block_len;
                continue;
            }

            if self.offset + HEADER_SIZE + length > self.block_len {
                if self.eof {
                    // Torn tail: header promised more payload than exists.
                    return Err(Error::Corruption(
                        "log record truncated at end of file".to_string(),
                    ));
                }
                return Err(Error::Corruption(
                    "log record overruns block boundary".to_string(),
                ));
            }

            let record_type = RecordType::from_u8(type_byte)
                .ok_or_else(|| crate::corruption!("unknown log record type {type_byte}"))?;

            let payload_start = self.offset + HEADER_SIZE;
            let payload = self.block[payload_start..payload_start + length].to_vec();
            if record_checksum(record_type, &payload) != expected_crc {
                return Err(Error::Corruption("log record checksum mismatch".to_string()));
            }

            self.offset += HEADER_SIZE + length;
            return Ok(Physical::Record(record_type, payload));
        }
    }

    fn refill(&mut self) -> Result<()> {
        // Carry unread tail bytes (a partial header split by the read size)
        // cannot occur: blocks are read whole, so a short read means EOF.
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.block[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.block_len = filled;
        self.offset = 0;
        Ok(())
    }
}
