use std::{
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
};

use android_sparse_codec::{
    encoder::{EncodeOptions, Encoder, ScanMode},
    writer::ChecksumPolicy,
    DEFAULT_BLOCKSIZE,
};
use tracing::info;

use crate::{create_output, is_stdio, open_input, spool_stdin, ToolError};

/// Convert a raw image into an Android sparse image
#[derive(clap::Parser, Debug)]
#[command(name = "img2simg")]
pub struct Opts {
    /// Raw image to read, `-` for stdin
    pub input: PathBuf,
    /// Sparse image to write, `-` for stdout
    pub output: PathBuf,
    /// Block size in bytes
    #[arg(short, long, default_value_t = DEFAULT_BLOCKSIZE)]
    pub block_size: u32,
    /// Only look at holes in the input file: unallocated ranges become don't care chunks and
    /// everything else is copied as is
    #[arg(short = 's', long)]
    pub read_holes: bool,
    /// Store the checksum in a trailing crc32 chunk instead of the header
    #[arg(long)]
    pub crc_chunk: bool,
}

impl Opts {
    fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            block_size: self.block_size,
            mode: if self.read_holes {
                ScanMode::Holes
            } else {
                ScanMode::Content
            },
            checksum: if self.crc_chunk {
                ChecksumPolicy::Chunk
            } else {
                ChecksumPolicy::Header
            },
        }
    }
}

fn open(input: &Path) -> Result<File, ToolError> {
    if is_stdio(input) {
        spool_stdin()
    } else {
        open_input(input)
    }
}

pub fn run(opts: &Opts) -> Result<(), ToolError> {
    let encoder = Encoder::new(opts.encode_options())?;
    let mut input = open(&opts.input)?;
    // Reject a misaligned input before the output gets truncated
    let len = input
        .metadata()
        .map_err(|source| ToolError::OpenInput {
            path: opts.input.clone(),
            source,
        })?
        .len();
    encoder.total_blocks(len)?;

    let summary = if is_stdio(&opts.output) {
        let allocated = encoder.allocation(&input)?;
        encoder.encode_buffered(input, allocated.as_deref(), io::stdout().lock())?
    } else {
        let output = create_output(&opts.output)?;
        encoder.encode_file(&mut input, BufWriter::new(output))?
    };

    info!(
        "Wrote {} blocks in {} chunks, crc32 {:#010x}",
        summary.total_blocks, summary.chunks, summary.checksum
    );
    Ok(())
}
