#![doc = include_str!("../README.md")]

/// Population of an ext4 image from a directory
pub mod e2fsdroid;
/// Extraction of an ext4 image into a directory
pub mod extract;

use std::path::Path;

use thiserror::Error;

/// Invalid tool configuration, reported when building the arguments
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("Missing required argument: {0}")]
    Missing(&'static str),
    #[error("Argument must not be empty: {0}")]
    Empty(&'static str),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool failed with status {0}")]
    Failed(i32),
    #[error("Failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Tool was terminated by a signal")]
    Signalled,
}

/// Turn a tool status into a result; 0 is success, anything else is passed on as is
pub fn check_status(status: i32) -> Result<(), ToolError> {
    match status {
        0 => Ok(()),
        code => Err(ToolError::Failed(code)),
    }
}

fn non_empty(path: &Path, name: &'static str) -> Result<(), ArgsError> {
    if path.as_os_str().is_empty() {
        Err(ArgsError::Empty(name))
    } else {
        Ok(())
    }
}
