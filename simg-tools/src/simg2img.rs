use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use android_sparse_codec::{
    decoder::{merge, DecodeOptions, MergeSummary},
    segments::find_segments,
    Error as CodecError,
};
use tracing::info;

use crate::{is_stdio, open_input, spool_stdin, ToolError, STDIO};

/// Expand one or more sparse images into a raw image
///
/// Every input is applied from the start of the output in turn, so later inputs overwrite what
/// earlier ones wrote; the parts of a split image are reassembled this way.
#[derive(clap::Parser, Debug)]
#[command(name = "simg2img")]
pub struct Opts {
    /// Sparse images to expand, `-` for stdin; a single directory selects the split image
    /// segments inside it
    #[arg(required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,
    /// Raw image to write, `-` for stdout
    pub output: PathBuf,
    /// Verify checksums stored in the sparse images
    #[arg(long)]
    pub verify: bool,
}

/// Resolve the input paths, expanding a directory into its segments
fn input_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, ToolError> {
    match inputs {
        [dir] if dir.is_dir() => {
            let segments = find_segments(dir).map_err(|source| ToolError::OpenInput {
                path: dir.clone(),
                source,
            })?;
            if segments.is_empty() {
                return Err(ToolError::Usage(format!(
                    "No sparse image segments found in {}",
                    dir.display()
                )));
            }
            Ok(segments)
        }
        _ => {
            if inputs.iter().filter(|path| is_stdio(path)).count() > 1 {
                return Err(ToolError::Usage(format!(
                    "{STDIO} can only be given once as input"
                )));
            }
            Ok(inputs.to_vec())
        }
    }
}

/// Sparse image input, seekable so it can be checked in full before it is expanded
trait Fragment: Read + Seek {}

impl<T: Read + Seek> Fragment for T {}

fn open_fragment(path: &Path) -> Result<Box<dyn Fragment>, ToolError> {
    if is_stdio(path) {
        Ok(Box::new(spool_stdin()?))
    } else {
        Ok(Box::new(BufReader::new(open_input(path)?)))
    }
}

fn open_output(path: &Path) -> Result<File, ToolError> {
    let open_error = |source| ToolError::OpenOutput {
        path: path.to_owned(),
        source,
    };
    if is_stdio(path) {
        // Fragments seek around in the output, so go through an anonymous file
        tempfile::tempfile().map_err(open_error)
    } else {
        File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(open_error)
    }
}

fn merge_into<W: Write + Seek>(
    fragments: Vec<(PathBuf, Box<dyn Fragment>)>,
    output: &mut W,
    options: &DecodeOptions,
) -> Result<MergeSummary, ToolError> {
    let fragments = fragments.into_iter().map(|(path, fragment)| {
        info!("Handling: {}", path.display());
        fragment
    });
    Ok(merge(fragments, output, options)?)
}

pub fn run(opts: &Opts) -> Result<(), ToolError> {
    let options = DecodeOptions {
        verify_checksums: opts.verify,
        ..Default::default()
    };

    // Open every input before touching the output
    let fragments = input_paths(&opts.inputs)?
        .into_iter()
        .map(|path| open_fragment(&path).map(|fragment| (path, fragment)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut output = BufWriter::new(open_output(&opts.output)?);
    let summary = merge_into(fragments, &mut output, &options)?;

    if is_stdio(&opts.output) {
        let mut spooled = output
            .into_inner()
            .map_err(|e| CodecError::Write(e.into_error()))?;
        spooled
            .seek(SeekFrom::Start(0))
            .map_err(CodecError::Write)?;
        let mut stdout = io::stdout().lock();
        io::copy(&mut spooled, &mut stdout).map_err(CodecError::Write)?;
        stdout.flush().map_err(CodecError::Write)?;
    }

    info!(
        "Merged {} sparse images into {} bytes",
        summary.fragments.len(),
        summary.output_size
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use android_sparse_codec::writer::{ChecksumPolicy, Payload, SparseWriter};
    use clap::Parser;

    use super::*;

    const BS: u32 = 4096;

    fn opts(args: &[&str]) -> Opts {
        Opts::parse_from(std::iter::once("simg2img").chain(args.iter().copied()))
    }

    fn sparse(path: &Path, total_blocks: u32, chunks: &[(Payload<'_>, u32)]) {
        let file = File::create(path).unwrap();
        let mut writer = SparseWriter::new(file, BS, total_blocks, ChecksumPolicy::Header).unwrap();
        for (payload, blocks) in chunks {
            writer.write_chunk(*payload, *blocks).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn parse() {
        let o = opts(&["a.img", "b.img", "out.img", "--verify"]);
        assert_eq!(o.inputs, [PathBuf::from("a.img"), PathBuf::from("b.img")]);
        assert_eq!(o.output, Path::new("out.img"));
        assert!(o.verify);

        assert!(Opts::try_parse_from(["simg2img", "out.img"]).is_err());
    }

    #[test]
    fn merge_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.simg");
        let b = dir.path().join("b.simg");
        let out = dir.path().join("out.img");
        sparse(&a, 2, &[(Payload::Fill(0x01010101), 2)]);
        sparse(&b, 2, &[(Payload::DontCare, 1), (Payload::Fill(0x02020202), 1)]);
        // Stale content must be truncated away
        std::fs::write(&out, vec![9u8; 5 * BS as usize]).unwrap();

        run(&opts(&[
            a.to_str().unwrap(),
            b.to_str().unwrap(),
            out.to_str().unwrap(),
        ]))
        .unwrap();

        let mut expected = vec![1u8; BS as usize];
        expected.extend(vec![2u8; BS as usize]);
        assert_eq!(std::fs::read(&out).unwrap(), expected);
    }

    #[test]
    fn merge_directory_segments() {
        let dir = tempfile::tempdir().unwrap();
        let parts = dir.path().join("parts");
        std::fs::create_dir(&parts).unwrap();
        // Numeric order puts .10 last, so its fill wins for block 0
        sparse(
            &parts.join("system.img_sparsechunk.10"),
            1,
            &[(Payload::Fill(0x0a0a0a0a), 1)],
        );
        sparse(
            &parts.join("system.img_sparsechunk.2"),
            2,
            &[(Payload::Fill(0x02020202), 2)],
        );
        let out = dir.path().join("system.img");

        run(&opts(&[parts.to_str().unwrap(), out.to_str().unwrap()])).unwrap();

        let mut expected = vec![0x0a; BS as usize];
        expected.extend(vec![2u8; BS as usize]);
        assert_eq!(std::fs::read(&out).unwrap(), expected);
    }

    #[test]
    fn empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.img");
        let err = run(&opts(&[dir.path().to_str().unwrap(), out.to_str().unwrap()])).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn stdin_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.img");
        let err = run(&opts(&["-", "-", out.to_str().unwrap()])).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!out.exists());
    }

    #[test]
    fn missing_input_leaves_output_alone() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.img");
        std::fs::write(&out, b"keep").unwrap();
        let err = run(&opts(&[
            dir.path().join("nope.simg").to_str().unwrap(),
            out.to_str().unwrap(),
        ]))
        .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(std::fs::read(&out).unwrap(), b"keep");
    }

    #[test]
    fn invalid_sparse_data() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.simg");
        std::fs::write(&input, [0u8; 64]).unwrap();
        let err = run(&opts(&[
            input.to_str().unwrap(),
            dir.path().join("out.img").to_str().unwrap(),
        ]))
        .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn checksum_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.simg");
        sparse(&input, 1, &[(Payload::Raw(&[3u8; BS as usize]), 1)]);
        let mut data = std::fs::read(&input).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&input, data).unwrap();

        let out = dir.path().join("out.img");
        let args = [input.to_str().unwrap(), out.to_str().unwrap()];
        run(&opts(&args)).unwrap();
        let err = run(&opts(&[args[0], args[1], "--verify"])).unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }
}
