use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    ops::Range,
};

use log::{debug, trace};

use crate::{
    bytes_to_blocks, max_raw_blocks, read_error, validate_block_size,
    writer::{ChecksumPolicy, Payload, SparseWriter},
    Error, FormatError, Result, DEFAULT_BLOCKSIZE,
};

/// How blocks of the raw image are classified
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanMode {
    /// Inspect content only: blocks of one repeated 32 bit word become fill chunks
    #[default]
    Content,
    /// Blocks inside storage holes become don't care chunks, everything else is copied raw
    /// without looking at it
    Holes,
    /// Holes become don't care chunks, the remaining blocks are inspected like
    /// [ScanMode::Content]
    HolesAndContent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeOptions {
    pub block_size: u32,
    pub mode: ScanMode,
    pub checksum: ChecksumPolicy,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCKSIZE,
            mode: ScanMode::default(),
            checksum: ChecksumPolicy::default(),
        }
    }
}

/// Classification of a block, or of a run of blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockClass {
    Raw,
    Fill(u32),
    DontCare,
}

/// Consecutive blocks sharing a classification; becomes a single chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    pub class: BlockClass,
    /// First block of the run
    pub start: u32,
    pub blocks: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeSummary {
    pub total_blocks: u32,
    /// Chunks written, the checksum chunk included
    pub chunks: u32,
    /// crc32 of the raw image
    pub checksum: u32,
}

/// Classify a block by content: a fill if all of its words are equal
pub fn classify_block(block: &[u8]) -> BlockClass {
    let mut words = block
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    match words.next() {
        Some(first) if words.all(|w| w == first) => BlockClass::Fill(first),
        _ => BlockClass::Raw,
    }
}

/// Extend the last run with the block at `index` or start a new one
fn push_block(runs: &mut Vec<Run>, class: BlockClass, index: u32, max_raw: u32) {
    if let Some(last) = runs.last_mut() {
        if last.class == class && (class != BlockClass::Raw || last.blocks < max_raw) {
            last.blocks += 1;
            return;
        }
    }
    runs.push(Run {
        class,
        start: index,
        blocks: 1,
    });
}

/// Whether any allocated range overlaps `start..start + len`; `cursor` remembers the position
/// in the sorted ranges between calls with increasing `start`
fn is_allocated(ranges: Option<&[Range<u64>]>, cursor: &mut usize, start: u64, len: u64) -> bool {
    let Some(ranges) = ranges else {
        return true;
    };
    while *cursor < ranges.len() && ranges[*cursor].end <= start {
        *cursor += 1;
    }
    ranges
        .get(*cursor)
        .is_some_and(|r| r.start < start + len)
}

/// Ranges of `file` that hold data according to the filesystem
///
/// Moves the file offset. Filesystems without hole reporting present the whole file as data.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn data_ranges(file: &File) -> io::Result<Vec<Range<u64>>> {
    use std::os::fd::AsRawFd;

    let len = file.metadata()?.len();
    let fd = file.as_raw_fd();
    let to_off = |pos: u64| {
        libc::off_t::try_from(pos).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
    };

    let mut ranges = vec![];
    let mut pos = 0;
    while pos < len {
        // SAFETY: fd stays open for as long as `file` is borrowed
        let data = unsafe { libc::lseek(fd, to_off(pos)?, libc::SEEK_DATA) };
        if data < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // Only a hole left
                Some(libc::ENXIO) => break,
                Some(libc::EINVAL) => {
                    debug!("No hole support, treating the whole file as data");
                    return Ok(vec![0..len]);
                }
                _ => return Err(err),
            }
        }
        // SAFETY: as above
        let hole = unsafe { libc::lseek(fd, data, libc::SEEK_HOLE) };
        if hole < 0 {
            return Err(io::Error::last_os_error());
        }
        let (data, hole) = (data as u64, (hole as u64).min(len));
        trace!("Data range {data}..{hole}");
        ranges.push(data..hole);
        pos = hole;
    }
    Ok(ranges)
}

/// Ranges of `file` that hold data according to the filesystem
///
/// Hole reporting is not available on this platform, so the whole file is data.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn data_ranges(file: &File) -> io::Result<Vec<Range<u64>>> {
    let len = file.metadata()?.len();
    Ok(vec![0..len])
}

/// Converts raw images into sparse images
#[derive(Clone, Debug)]
pub struct Encoder {
    options: EncodeOptions,
}

impl Encoder {
    pub fn new(options: EncodeOptions) -> Result<Self> {
        validate_block_size(options.block_size)?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    /// Block count of a raw image of `len` bytes
    pub fn total_blocks(&self, len: u64) -> Result<u32> {
        let block_size = self.options.block_size;
        bytes_to_blocks(len, block_size).map_err(|e| match e {
            FormatError::Misaligned { .. } => Error::InvalidImageSize {
                size: len,
                block_size,
            },
            e => e.into(),
        })
    }

    /// Hole information for `file` if the scan mode needs it
    pub fn allocation(&self, file: &File) -> Result<Option<Vec<Range<u64>>>> {
        match self.options.mode {
            ScanMode::Content => Ok(None),
            ScanMode::Holes | ScanMode::HolesAndContent => {
                data_ranges(file).map(Some).map_err(Error::Read)
            }
        }
    }

    /// Classify all blocks of `input` and merge them into runs
    ///
    /// `allocated` lists the byte ranges holding data, sorted; `None` means everything is
    /// allocated. It is ignored in [ScanMode::Content].
    pub fn plan<R: Read + Seek>(
        &self,
        input: &mut R,
        allocated: Option<&[Range<u64>]>,
    ) -> Result<Vec<Run>> {
        let len = input.seek(SeekFrom::End(0)).map_err(Error::Read)?;
        let total_blocks = self.total_blocks(len)?;
        input.seek(SeekFrom::Start(0)).map_err(Error::Read)?;

        let mode = self.options.mode;
        let block_size = u64::from(self.options.block_size);
        let max_raw = max_raw_blocks(self.options.block_size);
        let mut block = vec![0u8; self.options.block_size as usize];
        let mut runs = vec![];
        let mut cursor = 0;
        let mut pos = 0;

        for index in 0..total_blocks {
            let start = u64::from(index) * block_size;
            let class = if mode != ScanMode::Content
                && !is_allocated(allocated, &mut cursor, start, block_size)
            {
                BlockClass::DontCare
            } else if mode == ScanMode::Holes {
                BlockClass::Raw
            } else {
                if pos != start {
                    input.seek(SeekFrom::Start(start)).map_err(Error::Read)?;
                }
                input
                    .read_exact(&mut block)
                    .map_err(|e| read_error(e, "raw image"))?;
                pos = start + block_size;
                classify_block(&block)
            };
            push_block(&mut runs, class, index, max_raw);
        }

        debug!("{} blocks planned as {} chunks", total_blocks, runs.len());
        Ok(runs)
    }

    fn write_plan<R: Read + Seek, W: Write>(
        &self,
        input: &mut R,
        plan: &[Run],
        mut writer: SparseWriter<W>,
    ) -> Result<EncodeSummary> {
        let block_size = u64::from(self.options.block_size);
        for run in plan {
            match run.class {
                BlockClass::Raw => {
                    input
                        .seek(SeekFrom::Start(u64::from(run.start) * block_size))
                        .map_err(Error::Read)?;
                    let len = u64::from(run.blocks) * block_size;
                    writer.write_raw_from(input.by_ref().take(len), run.blocks)?;
                }
                BlockClass::Fill(fill) => writer.write_chunk(Payload::Fill(fill), run.blocks)?,
                BlockClass::DontCare => writer.write_chunk(Payload::DontCare, run.blocks)?,
            }
        }

        let total_blocks = writer.header().total_blocks;
        let checksum = writer.finish()?;
        let chunks = plan.len() as u32 + u32::from(self.options.checksum == ChecksumPolicy::Chunk);
        Ok(EncodeSummary {
            total_blocks,
            chunks,
            checksum,
        })
    }

    /// Encode `input` into a seekable output
    pub fn encode<R: Read + Seek, W: Write + Seek>(
        &self,
        mut input: R,
        allocated: Option<&[Range<u64>]>,
        output: W,
    ) -> Result<EncodeSummary> {
        let plan = self.plan(&mut input, allocated)?;
        let total_blocks = plan.last().map_or(0, |r| r.start + r.blocks);
        let writer = SparseWriter::new(
            output,
            self.options.block_size,
            total_blocks,
            self.options.checksum,
        )?;
        self.write_plan(&mut input, &plan, writer)
    }

    /// Encode `input` into an output that can't seek, such as a pipe; the sparse image is held
    /// in memory until complete
    pub fn encode_buffered<R: Read + Seek, W: Write>(
        &self,
        mut input: R,
        allocated: Option<&[Range<u64>]>,
        output: W,
    ) -> Result<EncodeSummary> {
        let plan = self.plan(&mut input, allocated)?;
        let total_blocks = plan.last().map_or(0, |r| r.start + r.blocks);
        let writer = SparseWriter::new_buffered(
            output,
            self.options.block_size,
            total_blocks,
            self.options.checksum,
        )?;
        self.write_plan(&mut input, &plan, writer)
    }

    /// Encode a file, looking up its holes first when the scan mode needs them
    pub fn encode_file<W: Write + Seek>(
        &self,
        file: &mut File,
        output: W,
    ) -> Result<EncodeSummary> {
        let allocated = self.allocation(file)?;
        self.encode(file, allocated.as_deref(), output)
    }
}
