#![doc = include_str!("../README.md")]

/// Sparse image expansion and multi-fragment patching
pub mod decoder;
/// Raw image to sparse image conversion
pub mod encoder;
/// Streaming sparse image parser
pub mod reader;
/// Discovery of split image segments on disk
pub mod segments;
/// Helpers to split an image into multiple smaller ones
pub mod split;
/// Sparse image serializer
pub mod writer;

use std::io;

use bytes::{Buf, BufMut};
use crc32fast::Hasher;
use log::trace;
use strum::FromRepr;
use thiserror::Error;

/// Length of the file header in bytes
pub const FILE_HEADER_BYTES_LEN: usize = 28;
/// Length of the chunk header in bytes
pub const CHUNK_HEADER_BYTES_LEN: usize = 12;
/// File magic - This are the first 4 bytes in little-endian
pub const HEADER_MAGIC: u32 = 0xed26ff3a;
/// Only supported major version
pub const MAJOR_VERSION: u16 = 0x1;
/// Minor version written out; any minor version is accepted on read
pub const MINOR_VERSION: u16 = 0x0;
pub const DEFAULT_BLOCKSIZE: u32 = 4096;
/// Payload length of fill and crc32 chunks
pub const FILL_BYTES_LEN: usize = 4;

/// Buffer size used when streaming chunk payloads
pub(crate) const COPY_BUFFER_LEN: usize = 64 * 1024;

/// Structural problems in sparse data
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("Header has an unknown magic value {0:#010x}")]
    BadMagic(u32),
    #[error("Header has an unsupported major version {0}")]
    UnsupportedVersion(u16),
    #[error("Header size {header} or chunk header size {chunk_header} is below the known minimum")]
    HeaderTooSmall { header: u16, chunk_header: u16 },
    #[error("Block size {0} is not a positive multiple of 4")]
    InvalidBlockSize(u32),
    #[error("Unknown chunk type {0:#06x}")]
    UnknownChunkType(u16),
    #[error("Chunk {index} has total size {total_size}, smaller than its own header")]
    ChunkTooSmall { index: u32, total_size: u32 },
    #[error("Input ended inside the {0}")]
    Truncated(&'static str),
    #[error("Length {len} is not a multiple of the block size {block_size}")]
    Misaligned { len: u64, block_size: u32 },
    #[error("Block count exceeds the image size limits")]
    Overflow,
}

/// Block and byte counts that disagree with each other
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("Chunks describe more than the declared {total} blocks")]
    BlockOverflow { total: u32 },
    #[error("Chunks describe {actual} blocks but the header declares {expected}")]
    BlockCountMismatch { expected: u32, actual: u32 },
    #[error("Chunk {index} has total size {actual}, expected {expected}")]
    ChunkSizeMismatch { index: u32, expected: u64, actual: u64 },
    #[error("Chunk {index} expands to {size} bytes, above the limit of {limit}")]
    ChunkTooLarge { index: u32, size: u64, limit: u64 },
}

/// Invalid parameters handed in by the caller
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Block size {0} is not a positive multiple of 4")]
    InvalidBlockSize(u32),
    #[error("No fragments to merge")]
    NoFragments,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read input: {0}")]
    Read(#[source] io::Error),
    #[error("Failed to write output: {0}")]
    Write(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Size(#[from] SizeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Image size {size} is not a multiple of the block size {block_size}")]
    InvalidImageSize { size: u64, block_size: u32 },
    #[error("Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Fragment {index}: {source}")]
    Fragment {
        index: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The underlying error, looking through fragment wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Fragment { source, .. } => source.root(),
            e => e,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Map a read failure, treating a short read as truncated sparse data
pub(crate) fn read_error(e: io::Error, what: &'static str) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::Truncated(what).into()
    } else {
        Error::Read(e)
    }
}

/// Check a block size is usable: non-zero and a multiple of 4
pub fn validate_block_size(block_size: u32) -> Result<(), ConfigError> {
    if block_size == 0 || block_size % 4 != 0 {
        return Err(ConfigError::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// Convert a block count into bytes
pub fn blocks_to_bytes(blocks: u64, block_size: u32) -> Result<u64, FormatError> {
    blocks
        .checked_mul(block_size.into())
        .ok_or(FormatError::Overflow)
}

/// Convert a byte length into a block count; the length has to be block aligned
pub fn bytes_to_blocks(bytes: u64, block_size: u32) -> Result<u32, FormatError> {
    if block_size == 0 || bytes % u64::from(block_size) != 0 {
        return Err(FormatError::Misaligned {
            len: bytes,
            block_size,
        });
    }
    (bytes / u64::from(block_size))
        .try_into()
        .map_err(|_| FormatError::Overflow)
}

/// Largest number of blocks a single raw chunk can carry while its total size still fits the
/// 32 bit size field
pub fn max_raw_blocks(block_size: u32) -> u32 {
    (u32::MAX - CHUNK_HEADER_BYTES_LEN as u32) / block_size.max(1)
}

/// `len` bytes of the little-endian fill word repeated
pub(crate) fn fill_pattern(fill: u32, len: usize) -> Vec<u8> {
    fill.to_le_bytes().into_iter().cycle().take(len).collect()
}

/// Hash what a fill of `len` bytes would expand to without materializing it
pub(crate) fn hash_fill(hasher: &mut Hasher, fill: u32, len: u64) {
    let pattern = fill_pattern(fill, len.min(COPY_BUFFER_LEN as u64) as usize);
    let mut left = len;
    while left > 0 {
        let n = left.min(pattern.len() as u64) as usize;
        hasher.update(&pattern[..n]);
        left -= n as u64;
    }
}

/// Byte array which fits a file header
pub type SparseHeaderBytes = [u8; FILE_HEADER_BYTES_LEN];
/// Global file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    /// Size of the file header on disk; larger than [FILE_HEADER_BYTES_LEN] for newer formats
    pub header_size: u16,
    /// Size of each chunk header on disk
    pub chunk_header_size: u16,
    /// Block size in bytes (multiple of 4)
    pub block_size: u32,
    /// Number of blocks in the expanded image
    pub total_blocks: u32,
    /// Number of chunks in the sparse image
    pub total_chunks: u32,
    /// Optional CRC32 Checksum of the expanded image, 0 when unset
    pub image_checksum: u32,
}

impl SparseHeader {
    /// Header for a version 1.0 image with standard record sizes and no chunks yet
    pub fn new(block_size: u32, total_blocks: u32) -> Self {
        SparseHeader {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            header_size: FILE_HEADER_BYTES_LEN as u16,
            chunk_header_size: CHUNK_HEADER_BYTES_LEN as u16,
            block_size,
            total_blocks,
            total_chunks: 0,
            image_checksum: 0,
        }
    }

    /// Create new SparseHeader from a raw header
    pub fn from_bytes(bytes: &SparseHeaderBytes) -> Result<SparseHeader, FormatError> {
        let mut bytes = &bytes[..];

        let magic = bytes.get_u32_le();
        if magic != HEADER_MAGIC {
            trace!("Unrecognized header magic: {:x}", magic);
            return Err(FormatError::BadMagic(magic));
        }

        let major_version = bytes.get_u16_le();
        if major_version != MAJOR_VERSION {
            trace!("Unrecognized major versions: {:x}", major_version);
            return Err(FormatError::UnsupportedVersion(major_version));
        }
        let minor_version = bytes.get_u16_le();

        let header_size = bytes.get_u16_le();
        let chunk_header_size = bytes.get_u16_le();
        if usize::from(header_size) < FILE_HEADER_BYTES_LEN
            || usize::from(chunk_header_size) < CHUNK_HEADER_BYTES_LEN
        {
            trace!("Unexpected header sizes: {header_size} / {chunk_header_size}");
            return Err(FormatError::HeaderTooSmall {
                header: header_size,
                chunk_header: chunk_header_size,
            });
        }

        let block_size = bytes.get_u32_le();
        if validate_block_size(block_size).is_err() {
            trace!("Invalid block size: {block_size}");
            return Err(FormatError::InvalidBlockSize(block_size));
        }

        Ok(SparseHeader {
            major_version,
            minor_version,
            header_size,
            chunk_header_size,
            block_size,
            total_blocks: bytes.get_u32_le(),
            total_chunks: bytes.get_u32_le(),
            image_checksum: bytes.get_u32_le(),
        })
    }

    /// Convert into a raw header
    pub fn to_bytes(&self) -> SparseHeaderBytes {
        let mut bytes = [0; FILE_HEADER_BYTES_LEN];
        let mut w = &mut bytes[..];
        w.put_u32_le(HEADER_MAGIC);
        w.put_u16_le(self.major_version);
        w.put_u16_le(self.minor_version);
        w.put_u16_le(self.header_size);
        w.put_u16_le(self.chunk_header_size);
        w.put_u32_le(self.block_size);
        w.put_u32_le(self.total_blocks);
        w.put_u32_le(self.total_chunks);
        w.put_u32_le(self.image_checksum);

        bytes
    }

    /// Size of the expanded image in bytes
    pub fn total_size(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }

    /// Unknown trailing bytes after the known part of the file header
    pub fn excess_header_bytes(&self) -> u64 {
        u64::from(self.header_size).saturating_sub(FILE_HEADER_BYTES_LEN as u64)
    }

    /// Unknown trailing bytes after the known part of every chunk header
    pub fn excess_chunk_header_bytes(&self) -> u64 {
        u64::from(self.chunk_header_size).saturating_sub(CHUNK_HEADER_BYTES_LEN as u64)
    }
}

/// Type of a chunk
#[derive(Copy, Clone, Debug, FromRepr, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    /// Chunk header is followed by raw content for [ChunkHeader::out_size] bytes; Should be copied
    /// to the output
    Raw = 0xcac1,
    /// Chunk header is followed by 4 bytes; which should be used to fill the output
    Fill = 0xcac2,
    /// No data after the chunk; The next [ChunkHeader::out_size] bytes are left untouched in the
    /// output
    DontCare = 0xcac3,
    /// Chunk header is followed by 4 bytes, which is a crc32 checksum of the image so far
    Crc32 = 0xcac4,
}

/// Byte array which fits a chunk header
pub type ChunkHeaderBytes = [u8; CHUNK_HEADER_BYTES_LEN];

/// Header of a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// The type of the chunk
    pub chunk_type: ChunkType,
    /// Output size of the chunk in blocks
    pub chunk_blocks: u32,
    /// Size of the chunk in the sparse image, header included
    pub total_size: u32,
}

impl ChunkHeader {
    /// Create a don't care header for a given length in blocks
    pub fn new_dontcare(blocks: u32) -> Self {
        ChunkHeader {
            chunk_type: ChunkType::DontCare,
            chunk_blocks: blocks,
            total_size: CHUNK_HEADER_BYTES_LEN as u32,
        }
    }

    /// Create a new raw header for a given amount in blocks for block_size
    ///
    /// The actual data should follow this header
    pub fn new_raw(blocks: u32, block_size: u32) -> Self {
        ChunkHeader {
            chunk_type: ChunkType::Raw,
            chunk_blocks: blocks,
            total_size: (CHUNK_HEADER_BYTES_LEN as u32)
                .saturating_add(blocks.saturating_mul(block_size)),
        }
    }

    /// Create a new fill header for a given amount of blocks to be filled
    ///
    /// The header should be followed by 4 bytes indicate the data to fill with
    pub fn new_fill(blocks: u32) -> Self {
        ChunkHeader {
            chunk_type: ChunkType::Fill,
            chunk_blocks: blocks,
            total_size: (CHUNK_HEADER_BYTES_LEN + FILL_BYTES_LEN) as u32,
        }
    }

    /// Create a checksum header; followed by the 4 byte crc32
    pub fn new_crc32() -> Self {
        ChunkHeader {
            chunk_type: ChunkType::Crc32,
            chunk_blocks: 0,
            total_size: (CHUNK_HEADER_BYTES_LEN + FILL_BYTES_LEN) as u32,
        }
    }

    /// Create new ChunkHeader from a raw header
    pub fn from_bytes(bytes: &ChunkHeaderBytes) -> Result<ChunkHeader, FormatError> {
        let mut bytes = &bytes[..];
        let chunk_type = bytes.get_u16_le();
        let Some(chunk_type) = ChunkType::from_repr(chunk_type) else {
            trace!("Unknown chunk type: {:x}", chunk_type);
            return Err(FormatError::UnknownChunkType(chunk_type));
        };
        // reserved
        bytes.advance(2);
        let chunk_blocks = bytes.get_u32_le();
        let total_size = bytes.get_u32_le();

        Ok(ChunkHeader {
            chunk_type,
            chunk_blocks,
            total_size,
        })
    }

    /// Convert into a raw header
    pub fn to_bytes(&self) -> ChunkHeaderBytes {
        let mut bytes = [0; CHUNK_HEADER_BYTES_LEN];
        let mut w = &mut bytes[..];
        w.put_u16_le(self.chunk_type as u16);
        w.put_u16_le(0x0);
        w.put_u32_le(self.chunk_blocks);
        w.put_u32_le(self.total_size);
        bytes
    }

    /// Resulting size of this chunk in the output; checksum chunks cover no output
    pub fn out_size(&self, block_size: u32) -> u64 {
        match self.chunk_type {
            ChunkType::Crc32 => 0,
            _ => u64::from(self.chunk_blocks) * u64::from(block_size),
        }
    }

    /// Data bytes after a standard sized header
    pub fn data_size(&self) -> u64 {
        u64::from(self.total_size).saturating_sub(CHUNK_HEADER_BYTES_LEN as u64)
    }

    /// Payload size a chunk of this type and length must carry
    pub fn expected_data_size(&self, block_size: u32) -> u64 {
        match self.chunk_type {
            ChunkType::Raw => self.out_size(block_size),
            ChunkType::Fill | ChunkType::Crc32 => FILL_BYTES_LEN as u64,
            ChunkType::DontCare => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_header_parse() {
        let data = [
            0x3au8, 0xff, 0x26, 0xed, 0x01, 0x00, 0x00, 0x00, 0x1c, 0x00, 0x0c, 0x00, 0x00, 0x10,
            0x00, 0x00, 0x77, 0x39, 0x14, 0x00, 0xb1, 0x00, 0x00, 0x00, 0xaa, 0x00, 0x00, 0xcc,
        ];

        let h = SparseHeader::from_bytes(&data).unwrap();
        assert_eq!(
            h,
            SparseHeader {
                total_chunks: 177,
                image_checksum: 0xcc0000aa,
                ..SparseHeader::new(4096, 1325431)
            }
        );
    }

    #[test]
    fn file_header_roundtrip() {
        let orig = SparseHeader {
            minor_version: 3,
            header_size: 32,
            total_chunks: 42,
            image_checksum: 0xabcd,
            ..SparseHeader::new(4096, 1024)
        };

        let b = orig.to_bytes();
        let echo = SparseHeader::from_bytes(&b).unwrap();

        assert_eq!(orig, echo);
        assert_eq!(echo.excess_header_bytes(), 4);
        assert_eq!(echo.excess_chunk_header_bytes(), 0);
    }

    #[test]
    fn file_header_rejects() {
        let good = SparseHeader::new(4096, 8).to_bytes();

        let mut bad = good;
        bad[0] = 0;
        assert_eq!(
            SparseHeader::from_bytes(&bad),
            Err(FormatError::BadMagic(0xed26ff00))
        );

        let mut bad = good;
        bad[4] = 2;
        assert_eq!(
            SparseHeader::from_bytes(&bad),
            Err(FormatError::UnsupportedVersion(2))
        );

        let mut bad = good;
        bad[8] = 20;
        assert_eq!(
            SparseHeader::from_bytes(&bad),
            Err(FormatError::HeaderTooSmall {
                header: 20,
                chunk_header: 12
            })
        );

        let bad = SparseHeader::new(4094, 8).to_bytes();
        assert_eq!(
            SparseHeader::from_bytes(&bad),
            Err(FormatError::InvalidBlockSize(4094))
        );
    }

    #[test]
    fn chunk_header_parse() {
        let data = [
            0xc3u8, 0xca, 0x0, 0x0, 0x1f, 0xf1, 0xaa, 0xbb, 0x0c, 0x00, 0x00, 0x00,
        ];

        let h = ChunkHeader::from_bytes(&data).unwrap();
        assert_eq!(
            h,
            ChunkHeader {
                chunk_type: ChunkType::DontCare,
                chunk_blocks: 0xbbaaf11f,
                total_size: CHUNK_HEADER_BYTES_LEN as u32,
            }
        );
    }

    #[test]
    fn chunk_header_unknown_type() {
        let data = [0xc5u8, 0xca, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x0c, 0x0, 0x0, 0x0];
        assert_eq!(
            ChunkHeader::from_bytes(&data),
            Err(FormatError::UnknownChunkType(0xcac5))
        );
    }

    #[test]
    fn chunk_header_roundtrip() {
        let orig = ChunkHeader::new_fill(8);

        let b = orig.to_bytes();
        let echo = ChunkHeader::from_bytes(&b).unwrap();

        assert_eq!(orig, echo);
        assert_eq!(echo.out_size(4096), 8 * 4096);
        assert_eq!(echo.data_size(), 4);
    }

    #[test]
    fn block_arithmetic() {
        assert_eq!(blocks_to_bytes(3, 4096), Ok(12288));
        assert_eq!(blocks_to_bytes(u64::MAX, 4096), Err(FormatError::Overflow));
        assert_eq!(bytes_to_blocks(12288, 4096), Ok(3));
        assert_eq!(
            bytes_to_blocks(12289, 4096),
            Err(FormatError::Misaligned {
                len: 12289,
                block_size: 4096
            })
        );
        assert_eq!(
            bytes_to_blocks((u64::from(u32::MAX) + 1) * 4, 4),
            Err(FormatError::Overflow)
        );
        assert_eq!(validate_block_size(0), Err(ConfigError::InvalidBlockSize(0)));
        assert_eq!(validate_block_size(6), Err(ConfigError::InvalidBlockSize(6)));
        assert!(validate_block_size(512).is_ok());
    }

    #[test]
    fn raw_chunk_limit_fits_size_field() {
        let blocks = max_raw_blocks(4096);
        let header = ChunkHeader::new_raw(blocks, 4096);
        assert_eq!(header.data_size(), u64::from(blocks) * 4096);
        assert!(u64::from(blocks + 1) * 4096 + 12 > u64::from(u32::MAX));
    }

    #[test]
    fn fill_hash_matches_expansion() {
        let mut expanded = Hasher::new();
        expanded.update(&fill_pattern(0xdeadbeef, 3 * COPY_BUFFER_LEN + 8));
        let mut hashed = Hasher::new();
        hash_fill(&mut hashed, 0xdeadbeef, 3 * COPY_BUFFER_LEN as u64 + 8);
        assert_eq!(expanded.finalize(), hashed.finalize());
    }
}
