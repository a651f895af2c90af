use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;

use crate::{
    ChunkHeader, ChunkType, Error, SparseHeader, CHUNK_HEADER_BYTES_LEN, COPY_BUFFER_LEN,
    FILE_HEADER_BYTES_LEN,
};

/// A definition of one chunk of a split image; When writing out the (chunk) header should be
/// written out first followed by size bytes from the source image from offset (in bytes) onwards
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitChunk {
    /// Chunk header
    pub header: ChunkHeader,
    /// Offset in the source image for the chunk data
    pub offset: u64,
    /// Amount of data to be copied from the source image (in bytes)
    pub size: u64,
}

/// A definition of one fragment of a split sparse image; When writing out the (file) header
/// should be written first followed by each chunk, see [Split::write_to]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    /// Global file header
    pub header: SparseHeader,
    /// List of data chunks
    pub chunks: Vec<SplitChunk>,
}

impl Split {
    fn from_chunks(chunks: Vec<SplitChunk>, block_size: u32) -> Self {
        let blocks = chunks.iter().map(|c| c.header.chunk_blocks).sum();
        let header = SparseHeader {
            total_chunks: chunks.len() as u32,
            ..SparseHeader::new(block_size, blocks)
        };

        Split { header, chunks }
    }

    /// Total size of the sparse image that would be generated when writing out the split
    pub fn sparse_size(&self) -> u64 {
        FILE_HEADER_BYTES_LEN as u64
            + self
                .chunks
                .iter()
                .map(|c| u64::from(c.header.total_size))
                .sum::<u64>()
    }

    /// Write this fragment as a standalone sparse image, taking chunk data from `source`
    ///
    /// `source` is the image the split was planned from. Data missing at the end of the source
    /// is padded with zeroes, as raw images need not end on a block boundary.
    pub fn write_to<R: Read + Seek, W: Write>(
        &self,
        source: &mut R,
        sink: &mut W,
    ) -> Result<(), Error> {
        sink.write_all(&self.header.to_bytes()).map_err(Error::Write)?;
        let mut buf = vec![0u8; COPY_BUFFER_LEN];
        for chunk in &self.chunks {
            sink.write_all(&chunk.header.to_bytes()).map_err(Error::Write)?;
            if chunk.size == 0 {
                continue;
            }

            source
                .seek(SeekFrom::Start(chunk.offset))
                .map_err(Error::Read)?;
            let mut left = chunk.size;
            while left > 0 {
                let want = left.min(buf.len() as u64) as usize;
                let n = match source.read(&mut buf[..want]).map_err(Error::Read)? {
                    0 => {
                        buf[..want].fill(0);
                        want
                    }
                    n => n,
                };
                sink.write_all(&buf[..n]).map_err(Error::Write)?;
                left -= n as u64;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SplitBuilder {
    space: u64,
    block_size: u32,
    chunks: Vec<SplitChunk>,
}

impl SplitBuilder {
    fn new(block_size: u32, size: u32, blocks_offset: u32) -> Self {
        let mut space = u64::from(size) - FILE_HEADER_BYTES_LEN as u64;
        let mut chunks = vec![];
        if blocks_offset > 0 {
            // Seek to the offset first
            let header = ChunkHeader::new_dontcare(blocks_offset);
            space -= u64::from(header.total_size);
            chunks.push(SplitChunk {
                header,
                offset: 0,
                size: 0,
            });
        }
        Self {
            space,
            block_size,
            chunks,
        }
    }

    fn try_add_chunk(&mut self, chunk: &ChunkHeader, image_offset: u64) -> bool {
        let total_size = u64::from(chunk.total_size);
        if self.space <= total_size {
            return false;
        }
        self.chunks.push(SplitChunk {
            header: chunk.clone(),
            offset: image_offset,
            size: chunk.data_size(),
        });
        self.space -= total_size;
        true
    }

    /// Add as much raw data as possible, returning the blocks taken up
    fn add_raw(&mut self, image_offset: u64, blocks: u32) -> u32 {
        let left = self.space.saturating_sub(CHUNK_HEADER_BYTES_LEN as u64);
        let fits = (left / u64::from(self.block_size)).min(u64::from(blocks)) as u32;
        if fits == 0 {
            return 0;
        }

        let header = ChunkHeader::new_raw(fits, self.block_size);
        self.space -= u64::from(header.total_size);
        self.chunks.push(SplitChunk {
            size: header.data_size(),
            offset: image_offset,
            header,
        });
        fits
    }

    fn finish(self) -> Split {
        Split::from_chunks(self.chunks, self.block_size)
    }
}

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Size is too small to fit chunks")]
    TooSmall,
}

fn check_minimal_size(size: u32, block_size: u32) -> Result<(), SplitError> {
    // Every split needs room for a file header, an initial don't care chunk and a raw chunk
    // holding a single block
    let minimal =
        FILE_HEADER_BYTES_LEN as u64 + 2 * CHUNK_HEADER_BYTES_LEN as u64 + u64::from(block_size);
    if u64::from(size) < minimal {
        return Err(SplitError::TooSmall);
    }
    Ok(())
}

/// Split an existing sparse image based on its file header and chunks into multiple fragments
/// of at most `size` bytes
///
/// Offsets refer to the sparse image itself, which must use the standard header sizes. Every
/// fragment after the first starts with a don't care chunk up to its first block, so
/// [crate::decoder::merge] puts the fragments back together.
pub fn split_image(
    header: &SparseHeader,
    chunks: &[ChunkHeader],
    size: u32,
) -> Result<Vec<Split>, SplitError> {
    check_minimal_size(size, header.block_size)?;
    let block_size = header.block_size;

    let mut splits = vec![];
    let mut builder = SplitBuilder::new(block_size, size, 0);
    // Output offset in blocks
    let mut block_offset = 0;
    // Data of the first chunk starts after the file and chunk header
    let mut image_offset = (FILE_HEADER_BYTES_LEN + CHUNK_HEADER_BYTES_LEN) as u64;

    for chunk in chunks {
        if chunk.chunk_type == ChunkType::Crc32 {
            // Covers the whole image, not a fragment of it
            image_offset += u64::from(chunk.total_size);
            continue;
        }
        if !builder.try_add_chunk(chunk, image_offset) {
            if chunk.chunk_type == ChunkType::Raw {
                // Spread the raw data over as many splits as needed
                let mut taken = 0;
                loop {
                    taken += builder.add_raw(
                        image_offset + u64::from(taken) * u64::from(block_size),
                        chunk.chunk_blocks - taken,
                    );
                    if taken >= chunk.chunk_blocks {
                        break;
                    }
                    splits.push(builder.finish());
                    builder = SplitBuilder::new(block_size, size, block_offset + taken);
                }
            } else {
                splits.push(builder.finish());
                builder = SplitBuilder::new(block_size, size, block_offset);
                if !builder.try_add_chunk(chunk, image_offset) {
                    return Err(SplitError::TooSmall);
                }
            }
        }
        block_offset += chunk.chunk_blocks;
        image_offset += u64::from(chunk.total_size);
    }
    splits.push(builder.finish());

    debug!("Split {} chunks into {} images", chunks.len(), splits.len());
    Ok(splits)
}

/// Generate a set of splits for a raw image of a given `raw_size` each fitting within `size`;
/// The raw size is rounded up to a multiple of `block_size`, [Split::write_to] pads the tail.
pub fn split_raw(raw_size: u64, block_size: u32, size: u32) -> Result<Vec<Split>, SplitError> {
    check_minimal_size(size, block_size)?;
    let raw_blocks: u32 = raw_size
        .div_ceil(u64::from(block_size))
        .try_into()
        .map_err(|_| SplitError::TooSmall)?;

    let mut block_offset = 0;
    let mut splits = vec![];

    while raw_blocks > block_offset {
        let mut builder = SplitBuilder::new(block_size, size, block_offset);
        block_offset += builder.add_raw(
            u64::from(block_offset) * u64::from(block_size),
            raw_blocks - block_offset,
        );
        splits.push(builder.finish());
    }
    Ok(splits)
}
