//! Sorted table files.
//!
//! A table file is a sequence of key-ordered data blocks followed by its
//! metadata:
//!
//! ```text
//! +--------------------+
//! | data block 0       |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | filter block       |  optional
//! +--------------------+
//! | metaindex block    |  filter name -> filter handle
//! +--------------------+
//! | index block        |  separator key -> data block handle
//! +--------------------+
//! | footer (48 bytes)  |  metaindex + index handles, magic
//! +--------------------+
//! ```
//!
//! Every block is followed by a 5-byte trailer: a compression tag and a
//! crc32c over the stored payload and tag.

pub mod block;
pub mod builder;
pub mod filter_block;
pub mod reader;

pub use builder::TableBuilder;
pub use reader::Table;

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::coding::{get_varint64, put_varint64};
use crate::config::Compression;
use crate::error::Result;
use crate::Error;

/// Sentinel closing every table file.
pub const TABLE_MAGIC: u64 = 0xdb4775248b80fb57;

/// Serialized footer size: two padded handles plus the magic.
pub const FOOTER_SIZE: usize = 2 * MAX_HANDLE_SIZE + 8;

/// A varint64 offset/size pair is at most 10+10 bytes.
const MAX_HANDLE_SIZE: usize = 20;

/// Compression tag + crc32c after every stored block.
pub(crate) const BLOCK_TRAILER_SIZE: usize = 5;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Location of a block within the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn decode_from(src: &mut &[u8]) -> Result<Self> {
        Ok(BlockHandle {
            offset: get_varint64(src)?,
            size: get_varint64(src)?,
        })
    }
}

/// The fixed-size table footer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut handles = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut handles);
        self.index_handle.encode_to(&mut handles);
        handles.resize(2 * MAX_HANDLE_SIZE, 0);

        let mut footer = [0u8; FOOTER_SIZE];
        footer[..2 * MAX_HANDLE_SIZE].copy_from_slice(&handles);
        LittleEndian::write_u64(&mut footer[2 * MAX_HANDLE_SIZE..], TABLE_MAGIC);
        footer
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < FOOTER_SIZE {
            return Err(Error::Corruption("footer too short".to_string()));
        }
        let magic = LittleEndian::read_u64(&input[input.len() - 8..]);
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(
                "not a table file (bad magic number)".to_string(),
            ));
        }
        let mut handles = &input[..input.len() - 8];
        let metaindex_handle = BlockHandle::decode_from(&mut handles)?;
        let index_handle = BlockHandle::decode_from(&mut handles)?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

pub(crate) fn block_checksum(payload: &[u8], tag: u8) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(payload);
    digest.update(&[tag]);
    digest.finalize()
}

/// Compresses `data` per the requested codec. Falls back to storing raw
/// bytes when compression does not shrink the block.
pub(crate) fn compress_block(data: &[u8], compression: Compression) -> Result<(Vec<u8>, u8)> {
    match compression {
        Compression::None => Ok((data.to_vec(), Compression::None.tag())),
        Compression::Snappy => {
            let mut encoder = snap::raw::Encoder::new();
            match encoder.compress_vec(data) {
                Ok(compressed) if compressed.len() < data.len() => {
                    Ok((compressed, Compression::Snappy.tag()))
                }
                _ => Ok((data.to_vec(), Compression::None.tag())),
            }
        }
        Compression::Zstd => match zstd::stream::encode_all(data, 0) {
            Ok(compressed) if compressed.len() < data.len() => {
                Ok((compressed, Compression::Zstd.tag()))
            }
            _ => Ok((data.to_vec(), Compression::None.tag())),
        },
    }
}

/// Inverts `compress_block` given the stored tag.
pub(crate) fn decompress_block(data: &[u8], tag: u8) -> Result<Vec<u8>> {
    match tag {
        0 => Ok(data.to_vec()),
        1 => {
            let len = snap::raw::decompress_len(data)
                .map_err(|e| Error::Corruption(format!("bad snappy block: {e}")))?;
            let mut out = vec![0u8; len];
            snap::raw::Decoder::new()
                .decompress(data, &mut out)
                .map_err(|e| Error::Corruption(format!("bad snappy block: {e}")))?;
            Ok(out)
        }
        2 => zstd::stream::decode_all(data)
            .map_err(|e| Error::Corruption(format!("bad zstd block: {e}"))),
        other => Err(Error::NotSupported(format!(
            "unknown block compression tag {other}"
        ))),
    }
}

/// Positional read shared by the table reader.
pub(crate) fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(Error::Io("unexpected end of file".to_string()));
            }
            read += n;
        }
        Ok(())
    }
    #[cfg(not(any(unix, windows)))]
    {
        compile_error!("no positional read support for this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let handle = BlockHandle::new(123456789, 98765);
        let mut buf = Vec::new();
        handle.encode_to(&mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(BlockHandle::decode_from(&mut slice).unwrap(), handle);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(4096, 128),
            index_handle: BlockHandle::new(8192, 512),
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded.metaindex_handle, footer.metaindex_handle);
        assert_eq!(decoded.index_handle, footer.index_handle);
    }

    #[test]
    fn test_footer_bad_magic() {
        let footer = Footer::default();
        let mut encoded = footer.encode();
        encoded[FOOTER_SIZE - 1] ^= 0xff;
        assert!(Footer::decode(&encoded).is_err());
    }

    #[test]
    fn test_compression_roundtrips() {
        let data: Vec<u8> = b"compressible compressible compressible compressible"
            .repeat(20);
        for compression in [Compression::None, Compression::Snappy, Compression::Zstd] {
            let (stored, tag) = compress_block(&data, compression).unwrap();
            if compression != Compression::None {
                assert!(stored.len() < data.len(), "{compression:?} did not shrink");
            }
            assert_eq!(decompress_block(&stored, tag).unwrap(), data);
        }
    }

    #[test]
    fn test_incompressible_falls_back_to_raw() {
        // High-entropy input; snappy output would not shrink.
        let data: Vec<u8> = (0..1024u32).flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes()).collect();
        let (stored, tag) = compress_block(&data, Compression::Snappy).unwrap();
        assert_eq!(tag, Compression::None.tag());
        assert_eq!(stored, data);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            decompress_block(b"data", 9),
            Err(Error::NotSupported(_))
        ));
    }
}
