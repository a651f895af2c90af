#![doc = include_str!("../README.md")]

/// Sparse image inspection
pub mod dump;
/// Raw to sparse conversion
pub mod img2simg;
/// Sparse to raw conversion, merging split images
pub mod simg2img;

use std::{
    fs::File,
    io::{self, Seek, SeekFrom},
    path::{Path, PathBuf},
    process::ExitCode,
};

use android_sparse_codec::Error as CodecError;
use thiserror::Error;

/// Path meaning stdin or stdout
pub const STDIO: &str = "-";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Usage(String),
    #[error("Cannot open input file {}: {source}", path.display())]
    OpenInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot open output file {}: {source}", path.display())]
    OpenOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ToolError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            ToolError::Usage(_) => 2,
            ToolError::OpenInput { .. } => 3,
            ToolError::OpenOutput { .. } => 4,
            ToolError::Codec(e) => match e.root() {
                CodecError::Config(_) | CodecError::InvalidImageSize { .. } => 2,
                CodecError::Format(_)
                | CodecError::Size(_)
                | CodecError::ChecksumMismatch { .. } => 5,
                CodecError::Write(_) => 6,
                _ => 7,
            },
        }
    }
}

pub(crate) fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == STDIO
}

pub(crate) fn open_input(path: &Path) -> Result<File, ToolError> {
    File::open(path).map_err(|source| ToolError::OpenInput {
        path: path.to_owned(),
        source,
    })
}

pub(crate) fn create_output(path: &Path) -> Result<File, ToolError> {
    File::create(path).map_err(|source| ToolError::OpenOutput {
        path: path.to_owned(),
        source,
    })
}

/// Copy stdin into an anonymous file, for readers that need to seek their input
pub(crate) fn spool_stdin() -> Result<File, ToolError> {
    let open_error = |source| ToolError::OpenInput {
        path: PathBuf::from(STDIO),
        source,
    };
    let mut file = tempfile::tempfile().map_err(open_error)?;
    io::copy(&mut io::stdin().lock(), &mut file).map_err(open_error)?;
    file.seek(SeekFrom::Start(0)).map_err(open_error)?;
    Ok(file)
}

/// Log to stderr; stdout may carry image data
pub fn init_logging() {
    tracing_subscriber::fmt().with_writer(io::stderr).init();
}

/// Report the outcome of a tool run and turn it into the process exit status
pub fn exit(result: Result<(), ToolError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
