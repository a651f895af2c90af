use std::{
    fs::File,
    io::{BufReader, Read, Write},
    path::PathBuf,
};

use android_sparse_codec::reader::{ChunkData, CrcMode, ReaderOptions, SparseReader};
use anyhow::Context;

/// Inspect the contents of a sparse image
#[derive(clap::Parser, Debug)]
#[command(name = "simg_dump")]
pub struct Opts {
    pub img: PathBuf,
    /// Verify checksums while reading
    #[arg(long)]
    pub verify: bool,
}

/// Print the header and chunk table of the sparse image read from `input`
pub fn dump<R: Read, W: Write>(input: R, verify: bool, out: &mut W) -> anyhow::Result<()> {
    let options = ReaderOptions {
        crc: if verify {
            CrcMode::Validate
        } else {
            CrcMode::Ignore
        },
        ..Default::default()
    };
    let mut reader = SparseReader::new(input, options)?;
    let header = reader.header().clone();
    writeln!(
        out,
        "Version {}.{}, Chunks {}, Expanded size: {} ({} blocks, {} blocksize), checksum: {:#010x}",
        header.major_version,
        header.minor_version,
        header.total_chunks,
        header.total_size(),
        header.total_blocks,
        header.block_size,
        header.image_checksum
    )?;

    let mut index = 0;
    while let Some(chunk) = reader.next_chunk()? {
        let offset = chunk.offset;
        let out_size = chunk.out_size;
        match chunk.data {
            ChunkData::Raw => {
                writeln!(out, "{index}: Offset: {offset} - Copying {out_size} bytes")?
            }
            ChunkData::Fill(fill) => writeln!(
                out,
                "{index}: Offset: {offset} - Filling {out_size} bytes with {:x?}",
                fill.to_le_bytes()
            )?,
            ChunkData::DontCare => {
                writeln!(out, "{index}: Offset: {offset} - Skipping {out_size} bytes")?
            }
            ChunkData::Crc32(crc) => writeln!(out, "{index}: CRC value: {crc:#010x}")?,
        }
        index += 1;
    }
    reader.finish()?;
    Ok(())
}

pub fn run(opts: &Opts) -> anyhow::Result<()> {
    let file = File::open(&opts.img)
        .with_context(|| format!("Failed to open {}", opts.img.display()))?;
    let mut stdout = std::io::stdout().lock();
    dump(BufReader::new(file), opts.verify, &mut stdout)
        .with_context(|| format!("Failed to inspect {}", opts.img.display()))
}

#[cfg(test)]
mod test {
    use android_sparse_codec::writer::{ChecksumPolicy, Payload, SparseWriter};

    use super::*;

    #[test]
    fn chunk_table() {
        let mut sparse = std::io::Cursor::new(vec![]);
        let mut writer = SparseWriter::new(&mut sparse, 16, 4, ChecksumPolicy::Chunk).unwrap();
        writer.write_chunk(Payload::Raw(&[1; 16]), 1).unwrap();
        writer.write_chunk(Payload::Fill(0x04030201), 2).unwrap();
        writer.write_chunk(Payload::DontCare, 1).unwrap();
        let crc = writer.finish().unwrap();

        let mut out = vec![];
        dump(&sparse.get_ref()[..], true, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(
            lines,
            [
                "Version 1.0, Chunks 4, Expanded size: 64 (4 blocks, 16 blocksize), checksum: 0x00000000".to_string(),
                "0: Offset: 0 - Copying 16 bytes".to_string(),
                "1: Offset: 16 - Filling 32 bytes with [1, 2, 3, 4]".to_string(),
                "2: Offset: 48 - Skipping 16 bytes".to_string(),
                format!("3: CRC value: {crc:#010x}"),
            ]
        );
    }

    #[test]
    fn rejects_raw_images() {
        let mut out = vec![];
        assert!(dump(&[0u8; 64][..], false, &mut out).is_err());
        assert!(out.is_empty());
    }
}
