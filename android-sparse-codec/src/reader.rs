use std::io::{self, Read};

use crc32fast::Hasher;
use log::{debug, trace};

use crate::{
    hash_fill, read_error, ChunkHeader, ChunkHeaderBytes, ChunkType, Error, FormatError, Result,
    SizeError, SparseHeader, SparseHeaderBytes, FILL_BYTES_LEN,
};

/// Whether to validate CRC32 checksums while reading
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CrcMode {
    Validate,
    #[default]
    Ignore,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaderOptions {
    pub crc: CrcMode,
    /// Reject raw and fill chunks expanding to more than this many bytes
    pub max_chunk_bytes: Option<u64>,
}

/// Content of a chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkData {
    /// Payload follows; read it from the [SparseReader] itself
    Raw,
    /// Output is filled with the repeated little-endian word
    Fill(u32),
    /// Output range is skipped
    DontCare,
    /// Checksum of the expanded image up to this point
    Crc32(u32),
}

/// A chunk as yielded by the reader
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    /// Byte offset of the chunk in the expanded image
    pub offset: u64,
    /// Number of bytes the chunk covers in the expanded image
    pub out_size: u64,
    pub data: ChunkData,
}

/// Forward-only streaming reader for sparse images
///
/// After a [ChunkData::Raw] chunk is returned its payload can be read through the [Read]
/// implementation; whatever is left unread is discarded by the next call to
/// [SparseReader::next_chunk].
pub struct SparseReader<R> {
    inner: R,
    header: SparseHeader,
    options: ReaderOptions,
    /// Next chunk to read
    index: u32,
    /// Blocks covered by the chunks read so far
    blocks: u32,
    /// Output offset of the next chunk
    offset: u64,
    /// Unread payload of the current raw chunk
    raw_left: u64,
    hasher: Option<Hasher>,
}

/// Read exactly `buf.len()` bytes, reporting early EOF as truncation
fn fill_buf<R: Read>(inner: &mut R, buf: &mut [u8], what: &'static str) -> Result<()> {
    inner.read_exact(buf).map_err(|e| read_error(e, what))
}

/// Skip `len` bytes of a stream that may not be seekable
fn discard<R: Read>(inner: &mut R, len: u64, what: &'static str) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let skipped = io::copy(&mut inner.by_ref().take(len), &mut io::sink())
        .map_err(|e| read_error(e, what))?;
    if skipped != len {
        return Err(FormatError::Truncated(what).into());
    }
    Ok(())
}

impl<R: Read> SparseReader<R> {
    /// Parse and validate the file header
    pub fn new(mut inner: R, options: ReaderOptions) -> Result<Self> {
        let mut bytes = SparseHeaderBytes::default();
        fill_buf(&mut inner, &mut bytes, "file header")?;
        let header = SparseHeader::from_bytes(&bytes)?;
        discard(&mut inner, header.excess_header_bytes(), "file header")?;

        debug!(
            "Sparse image v{}.{}: {} chunks, {} blocks of {} bytes",
            header.major_version,
            header.minor_version,
            header.total_chunks,
            header.total_blocks,
            header.block_size
        );

        let hasher = match options.crc {
            CrcMode::Validate => Some(Hasher::new()),
            CrcMode::Ignore => None,
        };

        Ok(Self {
            inner,
            header,
            options,
            index: 0,
            blocks: 0,
            offset: 0,
            raw_left: 0,
            hasher,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Output offset right after the chunks read so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn validate(&self, chunk: &ChunkHeader) -> Result<u32> {
        let index = self.index;
        let header_len = u64::from(self.header.chunk_header_size);
        let total_size = u64::from(chunk.total_size);
        if total_size < header_len {
            return Err(FormatError::ChunkTooSmall {
                index,
                total_size: chunk.total_size,
            }
            .into());
        }

        let expected = header_len + chunk.expected_data_size(self.header.block_size);
        if total_size != expected {
            trace!("Chunk {index}: {chunk:?} expected total size {expected}");
            return Err(SizeError::ChunkSizeMismatch {
                index,
                expected,
                actual: total_size,
            }
            .into());
        }

        if chunk.chunk_type == ChunkType::Crc32 {
            return Ok(self.blocks);
        }

        let blocks = self
            .blocks
            .checked_add(chunk.chunk_blocks)
            .filter(|b| *b <= self.header.total_blocks)
            .ok_or(SizeError::BlockOverflow {
                total: self.header.total_blocks,
            })?;

        if let Some(limit) = self.options.max_chunk_bytes {
            let size = chunk.out_size(self.header.block_size);
            if chunk.chunk_type != ChunkType::DontCare && size > limit {
                return Err(SizeError::ChunkTooLarge { index, size, limit }.into());
            }
        }

        Ok(blocks)
    }

    /// Read the next chunk header, or `None` once all chunks have been read
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.raw_left != 0 {
            // Goes through our own Read impl so skipped payload still gets hashed
            let left = self.raw_left;
            let skipped =
                io::copy(&mut *self, &mut io::sink()).map_err(|e| read_error(e, "raw chunk"))?;
            trace!("Skipped {skipped} of {left} unread raw bytes");
        }

        if self.index == self.header.total_chunks {
            if self.blocks != self.header.total_blocks {
                return Err(SizeError::BlockCountMismatch {
                    expected: self.header.total_blocks,
                    actual: self.blocks,
                }
                .into());
            }
            return Ok(None);
        }

        let mut bytes = ChunkHeaderBytes::default();
        fill_buf(&mut self.inner, &mut bytes, "chunk header")?;
        let header = ChunkHeader::from_bytes(&bytes)?;
        discard(
            &mut self.inner,
            self.header.excess_chunk_header_bytes(),
            "chunk header",
        )?;
        let blocks = self.validate(&header)?;
        let out_size = header.out_size(self.header.block_size);

        let data = match header.chunk_type {
            ChunkType::Raw => {
                self.raw_left = out_size;
                ChunkData::Raw
            }
            ChunkType::Fill => {
                let fill = self.read_word("fill chunk")?;
                if let Some(hasher) = &mut self.hasher {
                    hash_fill(hasher, fill, out_size);
                }
                ChunkData::Fill(fill)
            }
            ChunkType::DontCare => {
                if let Some(hasher) = &mut self.hasher {
                    hash_fill(hasher, 0, out_size);
                }
                ChunkData::DontCare
            }
            ChunkType::Crc32 => {
                let expected = self.read_word("crc32 chunk")?;
                if let Some(hasher) = &self.hasher {
                    let actual = hasher.clone().finalize();
                    if actual != expected {
                        return Err(Error::ChecksumMismatch { expected, actual });
                    }
                }
                ChunkData::Crc32(expected)
            }
        };

        let chunk = Chunk {
            header,
            offset: self.offset,
            out_size,
            data,
        };
        trace!("Chunk {}: {:?}", self.index, chunk);

        self.index += 1;
        self.blocks = blocks;
        self.offset += out_size;

        Ok(Some(chunk))
    }

    fn read_word(&mut self, what: &'static str) -> Result<u32> {
        let mut word = [0u8; FILL_BYTES_LEN];
        fill_buf(&mut self.inner, &mut word, what)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Check the image checksum from the header, if validating and one is set, and return the
    /// underlying reader
    pub fn finish(self) -> Result<R> {
        if let Some(hasher) = self.hasher {
            let expected = self.header.image_checksum;
            if expected != 0 {
                let actual = hasher.finalize();
                if actual != expected {
                    return Err(Error::ChecksumMismatch { expected, actual });
                }
            }
        }
        Ok(self.inner)
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.raw_left == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(self.raw_left.try_into().unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..len])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "sparse image ends inside a raw chunk",
            ));
        }
        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }
        self.raw_left -= n as u64;
        Ok(n)
    }
}
