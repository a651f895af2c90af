use std::io::{self, Read, Seek, SeekFrom, Write};

use crc32fast::Hasher;
use log::debug;

use crate::{
    blocks_to_bytes, hash_fill, max_raw_blocks, read_error, validate_block_size, ChunkHeader,
    Error, FormatError, Result, SizeError, SparseHeader, SparseHeaderBytes, COPY_BUFFER_LEN,
    CHUNK_HEADER_BYTES_LEN,
};

/// Where the whole-image checksum ends up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Stored in the file header's `image_checksum`
    #[default]
    Header,
    /// Appended as a trailing crc32 chunk; the header checksum stays 0
    Chunk,
}

/// Chunk content handed to [SparseWriter::write_chunk]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload<'a> {
    Raw(&'a [u8]),
    Fill(u32),
    DontCare,
}

type PatchHeader<W> = fn(&mut W, u64, &SparseHeaderBytes) -> io::Result<()>;

fn patch_header<W: Write + Seek>(
    inner: &mut W,
    start: u64,
    bytes: &SparseHeaderBytes,
) -> io::Result<()> {
    let end = inner.stream_position()?;
    inner.seek(SeekFrom::Start(start))?;
    inner.write_all(bytes)?;
    inner.seek(SeekFrom::Start(end))?;
    Ok(())
}

/// Serializes a sparse image chunk by chunk
///
/// The chunk count is only known once all chunks are written. For seekable outputs a
/// placeholder header is written up front and patched on [SparseWriter::finish]; otherwise the
/// chunk records are held back in memory until then.
pub struct SparseWriter<W> {
    inner: W,
    /// Header patching function and header position, for seekable outputs
    patch: Option<(PatchHeader<W>, u64)>,
    /// Chunk records waiting for the header, for non-seekable outputs
    pending: Vec<u8>,
    header: SparseHeader,
    policy: ChecksumPolicy,
    /// Blocks covered so far
    blocks: u32,
    hasher: Hasher,
}

impl<W: Write + Seek> SparseWriter<W> {
    /// Start a sparse image at the current position of a seekable output
    pub fn new(
        mut inner: W,
        block_size: u32,
        total_blocks: u32,
        policy: ChecksumPolicy,
    ) -> Result<Self> {
        validate_block_size(block_size)?;
        let header = SparseHeader::new(block_size, total_blocks);
        let start = inner.stream_position().map_err(Error::Write)?;
        inner.write_all(&header.to_bytes()).map_err(Error::Write)?;

        Ok(Self {
            inner,
            patch: Some((patch_header::<W> as PatchHeader<W>, start)),
            pending: vec![],
            header,
            policy,
            blocks: 0,
            hasher: Hasher::new(),
        })
    }
}

impl<W: Write> SparseWriter<W> {
    /// Start a sparse image on an output that can't seek back, e.g. a pipe
    pub fn new_buffered(
        inner: W,
        block_size: u32,
        total_blocks: u32,
        policy: ChecksumPolicy,
    ) -> Result<Self> {
        validate_block_size(block_size)?;
        Ok(Self {
            inner,
            patch: None,
            pending: vec![],
            header: SparseHeader::new(block_size, total_blocks),
            policy,
            blocks: 0,
            hasher: Hasher::new(),
        })
    }

    /// Header as it stands; `total_chunks` and `image_checksum` are final only after finishing
    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        if self.patch.is_some() {
            self.inner.write_all(bytes).map_err(Error::Write)
        } else {
            self.pending.extend_from_slice(bytes);
            Ok(())
        }
    }

    fn emit_chunk(&mut self, chunk: &ChunkHeader) -> Result<()> {
        self.emit(&chunk.to_bytes())?;
        self.header.total_chunks += 1;
        Ok(())
    }

    /// Account for `blocks` more blocks, refusing to go past the declared total
    fn reserve(&mut self, blocks: u32) -> Result<()> {
        self.blocks = self
            .blocks
            .checked_add(blocks)
            .filter(|b| *b <= self.header.total_blocks)
            .ok_or(SizeError::BlockOverflow {
                total: self.header.total_blocks,
            })?;
        Ok(())
    }

    /// Append a chunk covering `blocks` blocks
    pub fn write_chunk(&mut self, payload: Payload<'_>, blocks: u32) -> Result<()> {
        let out_size = blocks_to_bytes(blocks.into(), self.header.block_size)?;
        match payload {
            Payload::Raw(data) => {
                if data.len() as u64 != out_size {
                    return Err(SizeError::ChunkSizeMismatch {
                        index: self.header.total_chunks,
                        expected: CHUNK_HEADER_BYTES_LEN as u64 + out_size,
                        actual: CHUNK_HEADER_BYTES_LEN as u64 + data.len() as u64,
                    }
                    .into());
                }
                self.write_raw_from(data, blocks)
            }
            Payload::Fill(fill) => {
                self.reserve(blocks)?;
                self.emit_chunk(&ChunkHeader::new_fill(blocks))?;
                self.emit(&fill.to_le_bytes())?;
                hash_fill(&mut self.hasher, fill, out_size);
                Ok(())
            }
            Payload::DontCare => {
                self.reserve(blocks)?;
                self.emit_chunk(&ChunkHeader::new_dontcare(blocks))?;
                hash_fill(&mut self.hasher, 0, out_size);
                Ok(())
            }
        }
    }

    /// Append a raw chunk of `blocks` blocks, streaming its payload from `data`
    pub fn write_raw_from<R: Read>(&mut self, mut data: R, blocks: u32) -> Result<()> {
        if blocks > max_raw_blocks(self.header.block_size) {
            return Err(FormatError::Overflow.into());
        }
        self.reserve(blocks)?;
        self.emit_chunk(&ChunkHeader::new_raw(blocks, self.header.block_size))?;

        let mut left = blocks_to_bytes(blocks.into(), self.header.block_size)?;
        let mut buf = vec![0u8; left.min(COPY_BUFFER_LEN as u64) as usize];
        while left > 0 {
            let n = left.min(buf.len() as u64) as usize;
            data.read_exact(&mut buf[..n])
                .map_err(|e| read_error(e, "raw data"))?;
            self.hasher.update(&buf[..n]);
            self.emit(&buf[..n])?;
            left -= n as u64;
        }
        Ok(())
    }

    /// Complete the image and return the crc32 of the expanded content
    ///
    /// Blocks not covered by any chunk are appended as a trailing don't care chunk.
    pub fn finish(mut self) -> Result<u32> {
        if self.blocks < self.header.total_blocks {
            let left = self.header.total_blocks - self.blocks;
            self.write_chunk(Payload::DontCare, left)?;
        }

        let checksum = self.hasher.clone().finalize();
        match self.policy {
            ChecksumPolicy::Header => self.header.image_checksum = checksum,
            ChecksumPolicy::Chunk => {
                self.emit_chunk(&ChunkHeader::new_crc32())?;
                self.emit(&checksum.to_le_bytes())?;
            }
        }

        let header = self.header.to_bytes();
        match self.patch {
            Some((patch, start)) => patch(&mut self.inner, start, &header).map_err(Error::Write)?,
            None => {
                self.inner.write_all(&header).map_err(Error::Write)?;
                self.inner
                    .write_all(&self.pending)
                    .map_err(Error::Write)?;
            }
        }
        self.inner.flush().map_err(Error::Write)?;

        debug!(
            "Wrote sparse image: {} chunks, {} blocks, crc32 {:#010x}",
            self.header.total_chunks, self.header.total_blocks, checksum
        );
        Ok(checksum)
    }
}
