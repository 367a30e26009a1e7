//! Block-framed record log.
//!
//! The write-ahead log and the manifest share this format. A log file is
//! a sequence of 32 KiB blocks; each block holds physical records that
//! never span a block boundary:
//!
//! ```text
//! +-------------+------------+----------+------------------+
//! | crc32c (4B) | length(2B) | type(1B) | payload (length) |
//! +-------------+------------+----------+------------------+
//! ```
//!
//! A logical record larger than the space left in a block is split into
//! FIRST/MIDDLE/LAST fragments; records that fit are written FULL. A
//! block tail smaller than the 7-byte header is zero-filled. The
//! checksum covers the type byte and payload, so a torn write at the end
//! of the file fails validation and replay stops at the last intact
//! record.

pub mod reader;
pub mod writer;

pub use reader::LogReader;
pub use writer::LogWriter;

use crc::{Crc, CRC_32_ISCSI};

/// Size of a log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Bytes of framing before each payload.
pub const HEADER_SIZE: usize = 4 + 2 + 1;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    pub(crate) fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

pub(crate) fn record_checksum(record_type: RecordType, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[record_type as u8]);
    digest.update(payload);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn roundtrip(records: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let mut writer = LogWriter::create(&path).unwrap();
        for record in records {
            writer.add_record(record).unwrap();
        }
        writer.flush().unwrap();
        drop(writer);

        let mut reader = LogReader::open(&path).unwrap();
        let mut out = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_roundtrip_small_records() {
        let records = vec![b"foo".to_vec(), b"bar".to_vec(), Vec::new(), b"xxxx".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_roundtrip_spanning_records() {
        // One record per fragment class: fits a block, exactly fills the
        // remainder, and spans several blocks.
        let records = vec![
            vec![b'a'; 1000],
            vec![b'b'; BLOCK_SIZE - 2 * HEADER_SIZE - 1000],
            vec![b'c'; 3 * BLOCK_SIZE + 17],
            b"tail".to_vec(),
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_torn_tail_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"intact").unwrap();
        writer.add_record(b"casualty").unwrap();
        writer.flush().unwrap();
        drop(writer);

        // Chop the last few bytes to simulate a crash mid-write.
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 3]).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap(), b"intact");
        assert!(reader.read_record().is_err());
    }

    #[test]
    fn test_flipped_bit_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"payload-bytes").unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        fs::write(&path, &data).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.read_record().is_err());
    }

    #[test]
    fn test_reopen_for_append_continues_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.log");
        {
            let mut writer = LogWriter::create(&path).unwrap();
            writer.add_record(b"one").unwrap();
            writer.flush().unwrap();
        }
        {
            let mut writer = LogWriter::open_for_append(&path).unwrap();
            writer.add_record(b"two").unwrap();
            writer.flush().unwrap();
        }
        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap(), b"one");
        assert_eq!(reader.read_record().unwrap().unwrap(), b"two");
        assert!(reader.read_record().unwrap().is_none());
    }
}
