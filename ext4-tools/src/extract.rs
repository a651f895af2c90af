use std::path::{Path, PathBuf};

use log::debug;

use crate::{non_empty, ArgsError, ToolError};

/// Arguments for extracting an ext4 image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractArgs {
    config_dir: PathBuf,
    mountpoint: String,
    filename: PathBuf,
    directory: PathBuf,
    block_size: Option<u32>,
    image_type: String,
    android_configure_only: bool,
    part_name: String,
}

impl ExtractArgs {
    /// Start building arguments to extract `filename` into `directory`
    pub fn builder(
        filename: impl Into<PathBuf>,
        directory: impl Into<PathBuf>,
    ) -> ExtractBuilder {
        ExtractBuilder {
            config_dir: None,
            mountpoint: String::new(),
            filename: filename.into(),
            directory: directory.into(),
            block_size: None,
            image_type: String::new(),
            android_configure_only: false,
            part_name: String::new(),
        }
    }

    /// Directory receiving `fs_config` and `file_contexts`
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    /// Source image
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Output directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Block size of the image; `None` lets the tool use its default
    pub fn block_size(&self) -> Option<u32> {
        self.block_size
    }

    /// Block size as passed to the tool, where 0 means default
    pub fn raw_block_size(&self) -> u32 {
        self.block_size.unwrap_or(0)
    }

    pub fn image_type(&self) -> &str {
        &self.image_type
    }

    /// Only write the configuration files, don't extract content
    pub fn android_configure_only(&self) -> bool {
        self.android_configure_only
    }

    pub fn part_name(&self) -> &str {
        &self.part_name
    }
}

#[derive(Clone, Debug)]
pub struct ExtractBuilder {
    config_dir: Option<PathBuf>,
    mountpoint: String,
    filename: PathBuf,
    directory: PathBuf,
    block_size: Option<u32>,
    image_type: String,
    android_configure_only: bool,
    part_name: String,
}

impl ExtractBuilder {
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn mountpoint(mut self, mountpoint: impl Into<String>) -> Self {
        self.mountpoint = mountpoint.into();
        self
    }

    /// Block size; 0 selects the default
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size).filter(|b| *b != 0);
        self
    }

    pub fn image_type(mut self, image_type: impl Into<String>) -> Self {
        self.image_type = image_type.into();
        self
    }

    pub fn android_configure_only(mut self, configure_only: bool) -> Self {
        self.android_configure_only = configure_only;
        self
    }

    pub fn part_name(mut self, part_name: impl Into<String>) -> Self {
        self.part_name = part_name.into();
        self
    }

    pub fn build(self) -> Result<ExtractArgs, ArgsError> {
        let config_dir = self.config_dir.ok_or(ArgsError::Missing("config_dir"))?;
        non_empty(&config_dir, "config_dir")?;
        non_empty(&self.filename, "filename")?;
        non_empty(&self.directory, "directory")?;

        Ok(ExtractArgs {
            config_dir,
            mountpoint: self.mountpoint,
            filename: self.filename,
            directory: self.directory,
            block_size: self.block_size,
            image_type: self.image_type,
            android_configure_only: self.android_configure_only,
            part_name: self.part_name,
        })
    }
}

/// An implementation of ext4 extraction, returning the tool's status; 0 is success
pub trait Ext4Extract {
    fn extract_ext4(&mut self, args: &ExtractArgs) -> i32;
}

/// Run an extraction, turning a non-zero status into an error
pub fn extract<E: Ext4Extract + ?Sized>(
    tool: &mut E,
    args: &ExtractArgs,
) -> Result<(), ToolError> {
    debug!(
        "Extracting {} into {}",
        args.filename().display(),
        args.directory().display()
    );
    crate::check_status(tool.extract_ext4(args))
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<ExtractArgs>,
        status: i32,
    }

    impl Ext4Extract for Recorder {
        fn extract_ext4(&mut self, args: &ExtractArgs) -> i32 {
            self.calls.push(args.clone());
            self.status
        }
    }

    fn args() -> ExtractBuilder {
        ExtractArgs::builder("system.img", "out/system").config_dir("out/config")
    }

    #[test]
    fn build() {
        let args = args()
            .mountpoint("/system")
            .block_size(4096)
            .image_type("ext4")
            .part_name("system")
            .build()
            .unwrap();
        assert_eq!(args.config_dir(), Path::new("out/config"));
        assert_eq!(args.filename(), Path::new("system.img"));
        assert_eq!(args.directory(), Path::new("out/system"));
        assert_eq!(args.mountpoint(), "/system");
        assert_eq!(args.block_size(), Some(4096));
        assert_eq!(args.image_type(), "ext4");
        assert_eq!(args.part_name(), "system");
        assert!(!args.android_configure_only());
    }

    #[test]
    fn zero_block_size_is_default() {
        let args = args().block_size(0).build().unwrap();
        assert_eq!(args.block_size(), None);
        assert_eq!(args.raw_block_size(), 0);
    }

    #[test]
    fn rejects_missing_paths() {
        assert_eq!(
            ExtractArgs::builder("a.img", "out").build(),
            Err(ArgsError::Missing("config_dir"))
        );
        assert_eq!(
            ExtractArgs::builder("", "out").config_dir("cfg").build(),
            Err(ArgsError::Empty("filename"))
        );
        assert_eq!(
            ExtractArgs::builder("a.img", "").config_dir("cfg").build(),
            Err(ArgsError::Empty("directory"))
        );
    }

    #[test]
    fn status_is_propagated() {
        let args = args().android_configure_only(true).build().unwrap();
        let mut tool = Recorder::default();
        extract(&mut tool, &args).unwrap();
        assert_eq!(tool.calls, [args.clone()]);

        tool.status = 3;
        assert!(matches!(extract(&mut tool, &args), Err(ToolError::Failed(3))));
    }
}
