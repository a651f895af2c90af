use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};

use crate::{non_empty, ArgsError, ToolError};

/// Arguments for populating an ext4 image
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct E2fsdroidArgs {
    block_list: Option<PathBuf>,
    basefs_out: Option<PathBuf>,
    timestamp: Option<i64>,
    fs_config: Option<PathBuf>,
    file_contexts: Option<PathBuf>,
    product_out: Option<PathBuf>,
    mountpoint: Option<String>,
    basefs_in: Option<PathBuf>,
    src_dir: Option<PathBuf>,
    android_sparse_file: bool,
    share_dup_blocks: bool,
    uid_mapping: Option<PathBuf>,
    gid_mapping: Option<PathBuf>,
    image: PathBuf,
}

fn push_flag(args: &mut Vec<OsString>, flag: &str, value: Option<OsString>) {
    if let Some(value) = value {
        args.push(flag.into());
        args.push(value);
    }
}

fn os_path(path: &Option<PathBuf>) -> Option<OsString> {
    path.as_ref().map(|p| p.as_os_str().to_owned())
}

impl E2fsdroidArgs {
    pub fn builder() -> E2fsdroidBuilder {
        E2fsdroidBuilder::default()
    }

    /// File receiving the list of blocks used by each file
    pub fn block_list(&self) -> Option<&Path> {
        self.block_list.as_deref()
    }

    /// File receiving the base filesystem map
    pub fn basefs_out(&self) -> Option<&Path> {
        self.basefs_out.as_deref()
    }

    pub fn fs_config(&self) -> Option<&Path> {
        self.fs_config.as_deref()
    }

    pub fn file_contexts(&self) -> Option<&Path> {
        self.file_contexts.as_deref()
    }

    pub fn product_out(&self) -> Option<&Path> {
        self.product_out.as_deref()
    }

    /// Base filesystem map of a previous build, to keep block allocation stable
    pub fn basefs_in(&self) -> Option<&Path> {
        self.basefs_in.as_deref()
    }

    /// Directory to copy into the image
    pub fn src_dir(&self) -> Option<&Path> {
        self.src_dir.as_deref()
    }

    pub fn uid_mapping(&self) -> Option<&Path> {
        self.uid_mapping.as_deref()
    }

    pub fn gid_mapping(&self) -> Option<&Path> {
        self.gid_mapping.as_deref()
    }

    /// Timestamp applied to all inodes
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn mountpoint(&self) -> Option<&str> {
        self.mountpoint.as_deref()
    }

    /// Write the result as an Android sparse image
    pub fn android_sparse_file(&self) -> bool {
        self.android_sparse_file
    }

    /// Share identical blocks between files
    pub fn share_dup_blocks(&self) -> bool {
        self.share_dup_blocks
    }

    /// Target image
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Command line arguments of the stock `e2fsdroid` tool
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = vec![];
        push_flag(&mut args, "-B", os_path(&self.block_list));
        push_flag(&mut args, "-D", os_path(&self.basefs_out));
        push_flag(&mut args, "-T", self.timestamp.map(|t| t.to_string().into()));
        push_flag(&mut args, "-C", os_path(&self.fs_config));
        push_flag(&mut args, "-S", os_path(&self.file_contexts));
        push_flag(&mut args, "-p", os_path(&self.product_out));
        push_flag(&mut args, "-a", self.mountpoint.as_ref().map(Into::into));
        push_flag(&mut args, "-d", os_path(&self.basefs_in));
        push_flag(&mut args, "-f", os_path(&self.src_dir));
        if self.android_sparse_file {
            args.push("-e".into());
        }
        if self.share_dup_blocks {
            args.push("-s".into());
        }
        push_flag(&mut args, "-u", os_path(&self.uid_mapping));
        push_flag(&mut args, "-g", os_path(&self.gid_mapping));
        args.push(self.image.clone().into_os_string());
        args
    }
}

#[derive(Clone, Debug, Default)]
pub struct E2fsdroidBuilder {
    args: E2fsdroidArgs,
    image: Option<PathBuf>,
}

impl E2fsdroidBuilder {
    pub fn block_list(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.block_list = Some(path.into());
        self
    }

    pub fn basefs_out(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.basefs_out = Some(path.into());
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.args.timestamp = Some(timestamp);
        self
    }

    pub fn fs_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.fs_config = Some(path.into());
        self
    }

    pub fn file_contexts(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.file_contexts = Some(path.into());
        self
    }

    pub fn product_out(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.product_out = Some(path.into());
        self
    }

    pub fn mountpoint(mut self, mountpoint: impl Into<String>) -> Self {
        self.args.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn basefs_in(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.basefs_in = Some(path.into());
        self
    }

    pub fn src_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.src_dir = Some(path.into());
        self
    }

    pub fn android_sparse_file(mut self, sparse: bool) -> Self {
        self.args.android_sparse_file = sparse;
        self
    }

    pub fn share_dup_blocks(mut self, share: bool) -> Self {
        self.args.share_dup_blocks = share;
        self
    }

    pub fn uid_mapping(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.uid_mapping = Some(path.into());
        self
    }

    pub fn gid_mapping(mut self, path: impl Into<PathBuf>) -> Self {
        self.args.gid_mapping = Some(path.into());
        self
    }

    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(path.into());
        self
    }

    pub fn build(self) -> Result<E2fsdroidArgs, ArgsError> {
        let image = self.image.ok_or(ArgsError::Missing("image"))?;
        non_empty(&image, "image")?;
        let args = &self.args;
        for (path, name) in [
            (&args.block_list, "block_list"),
            (&args.basefs_out, "basefs_out"),
            (&args.fs_config, "fs_config"),
            (&args.file_contexts, "file_contexts"),
            (&args.product_out, "product_out"),
            (&args.basefs_in, "basefs_in"),
            (&args.src_dir, "src_dir"),
            (&args.uid_mapping, "uid_mapping"),
            (&args.gid_mapping, "gid_mapping"),
        ] {
            if let Some(path) = path {
                non_empty(path, name)?;
            }
        }

        Ok(E2fsdroidArgs { image, ..self.args })
    }
}

/// An implementation of ext4 population
pub trait Ext4Populate {
    /// Populate the image described by `args`, returning the tool's status; 0 is success
    fn populate(&mut self, args: &E2fsdroidArgs) -> Result<i32, ToolError>;
}

/// Runs an external `e2fsdroid` binary
#[derive(Clone, Debug)]
pub struct E2fsdroidCommand {
    program: OsString,
}

impl E2fsdroidCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for E2fsdroidCommand {
    fn default() -> Self {
        Self::new("e2fsdroid")
    }
}

impl Ext4Populate for E2fsdroidCommand {
    fn populate(&mut self, args: &E2fsdroidArgs) -> Result<i32, ToolError> {
        let args = args.to_args();
        debug!("Running {} {:?}", self.program.to_string_lossy(), args);
        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(|source| ToolError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;
        info!("{} finished: {status}", self.program.to_string_lossy());
        status.code().ok_or(ToolError::Signalled)
    }
}

/// Populate an image, turning a non-zero status into an error
pub fn populate<P: Ext4Populate + ?Sized>(
    tool: &mut P,
    args: &E2fsdroidArgs,
) -> Result<(), ToolError> {
    crate::check_status(tool.populate(args)?)
}
