use std::io::{Read, Seek, SeekFrom, Write};

use log::{debug, info};

use crate::{
    fill_pattern, read_error,
    reader::{ChunkData, CrcMode, ReaderOptions, SparseReader},
    ConfigError, Error, Result, COPY_BUFFER_LEN,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Check crc32 chunks and the header checksum of every fragment
    pub verify_checksums: bool,
    /// Reject chunks expanding to more than this many bytes
    pub max_chunk_bytes: Option<u64>,
}

impl DecodeOptions {
    fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            crc: if self.verify_checksums {
                CrcMode::Validate
            } else {
                CrcMode::Ignore
            },
            max_chunk_bytes: self.max_chunk_bytes,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentSummary {
    pub chunks: u32,
    /// Size of the fragment's expanded image
    pub expanded_size: u64,
    /// Bytes written by raw and fill chunks
    pub written: u64,
    /// Bytes skipped by don't care chunks
    pub skipped: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub fragments: Vec<FragmentSummary>,
    /// Size of the output after the merge
    pub output_size: u64,
}

fn copy_raw<R: Read, W: Write>(
    reader: &mut SparseReader<R>,
    output: &mut W,
    buf: &mut [u8],
) -> Result<u64> {
    let mut copied = 0;
    loop {
        let n = reader
            .read(buf)
            .map_err(|e| read_error(e, "raw chunk"))?;
        if n == 0 {
            return Ok(copied);
        }
        output.write_all(&buf[..n]).map_err(Error::Write)?;
        copied += n as u64;
    }
}

fn write_fill<W: Write>(output: &mut W, fill: u32, len: u64) -> Result<()> {
    let pattern = fill_pattern(fill, len.min(COPY_BUFFER_LEN as u64) as usize);
    let mut left = len;
    while left > 0 {
        let n = left.min(pattern.len() as u64) as usize;
        output.write_all(&pattern[..n]).map_err(Error::Write)?;
        left -= n as u64;
    }
    Ok(())
}

/// Grow `output` to at least `len` bytes without touching existing content
fn extend_to<W: Write + Seek>(output: &mut W, len: u64) -> Result<()> {
    let end = output.seek(SeekFrom::End(0)).map_err(Error::Write)?;
    if end < len {
        output
            .seek(SeekFrom::Start(len - 1))
            .map_err(Error::Write)?;
        output.write_all(&[0]).map_err(Error::Write)?;
    }
    Ok(())
}

/// Read through a whole fragment without expanding it, so every chunk is checked
fn check_fragment<R: Read + Seek>(fragment: &mut R, options: &DecodeOptions) -> Result<()> {
    let start = fragment
        .stream_position()
        .map_err(|e| read_error(e, "sparse header"))?;
    let mut reader = SparseReader::new(&mut *fragment, options.reader_options())?;
    while reader.next_chunk()?.is_some() {}
    reader.finish()?;
    fragment
        .seek(SeekFrom::Start(start))
        .map_err(|e| read_error(e, "sparse header"))?;
    Ok(())
}

/// Expand a single sparse fragment onto `output`, starting at offset 0
///
/// Raw and fill chunks overwrite their range, don't care chunks leave whatever the output
/// already holds. The output is extended to the fragment's expanded size but never truncated.
/// The whole fragment, checksums included when enabled, is validated before anything is
/// written.
pub fn decode_fragment<R: Read + Seek, W: Write + Seek>(
    mut fragment: R,
    output: &mut W,
    options: &DecodeOptions,
) -> Result<FragmentSummary> {
    check_fragment(&mut fragment, options)?;
    let mut reader = SparseReader::new(fragment, options.reader_options())?;
    output.seek(SeekFrom::Start(0)).map_err(Error::Write)?;

    let mut summary = FragmentSummary {
        expanded_size: reader.header().total_size(),
        ..Default::default()
    };
    let mut buf = vec![0u8; COPY_BUFFER_LEN];
    while let Some(chunk) = reader.next_chunk()? {
        match chunk.data {
            ChunkData::Raw => {
                summary.written += copy_raw(&mut reader, output, &mut buf)?;
            }
            ChunkData::Fill(fill) => {
                write_fill(output, fill, chunk.out_size)?;
                summary.written += chunk.out_size;
            }
            ChunkData::DontCare => {
                output
                    .seek(SeekFrom::Start(chunk.offset + chunk.out_size))
                    .map_err(Error::Write)?;
                summary.skipped += chunk.out_size;
            }
            ChunkData::Crc32(crc) => debug!("Checksum chunk {crc:#010x} at {}", chunk.offset),
        }
        summary.chunks += 1;
    }
    reader.finish()?;
    extend_to(output, summary.expanded_size)?;

    Ok(summary)
}

/// Apply sparse fragments one after the other onto a single output
///
/// This is *not* concatenation: every fragment is expanded from offset 0 of the output, so the
/// list acts as a series of patches. Later fragments overwrite the ranges their raw and fill
/// chunks describe, don't care chunks keep what earlier fragments wrote. Split images whose
/// parts start with a don't care chunk seeking to their own position reassemble this way.
///
/// The first failing fragment aborts the merge with [Error::Fragment]; bytes written by that
/// point stay in the output, which should then not be trusted.
pub fn merge<I, R, W>(
    fragments: I,
    output: &mut W,
    options: &DecodeOptions,
) -> Result<MergeSummary>
where
    I: IntoIterator<Item = R>,
    R: Read + Seek,
    W: Write + Seek,
{
    let mut summary = MergeSummary::default();
    for (index, fragment) in fragments.into_iter().enumerate() {
        let fragment = decode_fragment(fragment, output, options).map_err(|e| Error::Fragment {
            index,
            source: Box::new(e),
        })?;
        info!(
            "Fragment {index}: {} chunks, {} bytes written, {} skipped",
            fragment.chunks, fragment.written, fragment.skipped
        );
        summary.fragments.push(fragment);
    }
    if summary.fragments.is_empty() {
        return Err(ConfigError::NoFragments.into());
    }

    output.flush().map_err(Error::Write)?;
    summary.output_size = output.seek(SeekFrom::End(0)).map_err(Error::Write)?;
    Ok(summary)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::{
        writer::{ChecksumPolicy, Payload, SparseWriter},
        FormatError, SparseHeader,
    };

    const BS: u32 = 16;

    fn sparse(total_blocks: u32, chunks: &[(Payload<'_>, u32)]) -> Vec<u8> {
        let mut out = Cursor::new(vec![]);
        let mut writer =
            SparseWriter::new(&mut out, BS, total_blocks, ChecksumPolicy::Header).unwrap();
        for (payload, blocks) in chunks {
            writer.write_chunk(*payload, *blocks).unwrap();
        }
        writer.finish().unwrap();
        out.into_inner()
    }

    #[test]
    fn dont_care_preserves_existing_bytes() {
        let fragment = sparse(
            3,
            &[(Payload::DontCare, 2), (Payload::Raw(&[0xff; BS as usize]), 1)],
        );
        let mut output = Cursor::new(vec![0u8; 3 * BS as usize]);
        let summary =
            decode_fragment(Cursor::new(&fragment[..]), &mut output, &Default::default()).unwrap();
        assert_eq!(summary.written, BS as u64);
        assert_eq!(summary.skipped, 2 * BS as u64);

        let mut expected = vec![0u8; 2 * BS as usize];
        expected.extend([0xff; BS as usize]);
        assert_eq!(output.into_inner(), expected);
    }

    #[test]
    fn dont_care_tail_extends_output() {
        let fragment = sparse(4, &[(Payload::Fill(0x01010101), 1), (Payload::DontCare, 3)]);
        let mut output = Cursor::new(vec![]);
        decode_fragment(Cursor::new(&fragment[..]), &mut output, &Default::default()).unwrap();
        let mut expected = vec![1u8; BS as usize];
        expected.extend([0; 3 * BS as usize]);
        assert_eq!(output.into_inner(), expected);
    }

    #[test]
    fn patch_precedence() {
        let content: Vec<u8> = (0..2 * BS as u8).collect();
        let zeros = sparse(2, &[(Payload::Fill(0), 2)]);
        let data = sparse(2, &[(Payload::Raw(&content), 2)]);

        let mut output = Cursor::new(vec![]);
        merge(
            [Cursor::new(&zeros[..]), Cursor::new(&data[..])],
            &mut output,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(output.get_ref(), &content);

        let mut output = Cursor::new(vec![]);
        merge(
            [Cursor::new(&data[..]), Cursor::new(&zeros[..])],
            &mut output,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(output.get_ref(), &vec![0u8; 2 * BS as usize]);
    }

    #[test]
    fn later_shorter_fragment_keeps_size() {
        let long = sparse(4, &[(Payload::Fill(0x02020202), 4)]);
        let short = sparse(1, &[(Payload::Fill(0x03030303), 1)]);

        let mut output = Cursor::new(vec![]);
        let summary = merge(
            [Cursor::new(&long[..]), Cursor::new(&short[..])],
            &mut output,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(summary.output_size, 4 * BS as u64);
        assert_eq!(summary.fragments.len(), 2);

        let mut expected = vec![3u8; BS as usize];
        expected.extend([2; 3 * BS as usize]);
        assert_eq!(output.into_inner(), expected);
    }

    #[test]
    fn empty_merge() {
        let mut output = Cursor::new(vec![]);
        let fragments: [Cursor<&[u8]>; 0] = [];
        assert!(matches!(
            merge(fragments, &mut output, &Default::default()),
            Err(Error::Config(ConfigError::NoFragments))
        ));
    }

    #[test]
    fn bad_version_writes_nothing() {
        let mut fragment = sparse(1, &[(Payload::Fill(0xffffffff), 1)]);
        fragment[4] = 2;
        let mut output = Cursor::new(vec![]);
        let err =
            merge([Cursor::new(&fragment[..])], &mut output, &Default::default()).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::Format(FormatError::UnsupportedVersion(2))
        ));
        assert!(output.get_ref().is_empty());
    }

    #[test]
    fn bad_chunk_size_writes_nothing() {
        let mut fragment = SparseHeader {
            total_chunks: 1,
            ..SparseHeader::new(BS, 1)
        }
        .to_bytes()
        .to_vec();
        fragment.extend_from_slice(&crate::ChunkHeader {
            total_size: 4,
            ..crate::ChunkHeader::new_fill(1)
        }
        .to_bytes());
        fragment.extend_from_slice(&[0xff; 4]);

        let mut output = Cursor::new(vec![]);
        let err =
            merge([Cursor::new(&fragment[..])], &mut output, &Default::default()).unwrap_err();
        assert!(matches!(err, Error::Fragment { index: 0, .. }));
        assert!(matches!(
            err.root(),
            Error::Format(FormatError::ChunkTooSmall { .. })
        ));
        assert!(output.get_ref().is_empty());
    }

    #[test]
    fn bad_later_chunk_writes_nothing() {
        let mut fragment = SparseHeader {
            total_chunks: 2,
            ..SparseHeader::new(BS, 2)
        }
        .to_bytes()
        .to_vec();
        fragment.extend_from_slice(&crate::ChunkHeader::new_raw(1, BS).to_bytes());
        fragment.extend_from_slice(&[0xab; BS as usize]);
        fragment.extend_from_slice(&crate::ChunkHeader {
            total_size: 4,
            ..crate::ChunkHeader::new_fill(1)
        }
        .to_bytes());
        fragment.extend_from_slice(&[0xff; 4]);

        let mut output = Cursor::new(vec![7u8; 4]);
        let err =
            merge([Cursor::new(&fragment[..])], &mut output, &Default::default()).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::Format(FormatError::ChunkTooSmall { index: 1, .. })
        ));
        assert_eq!(output.into_inner(), [7u8; 4]);
    }

    #[test]
    fn bad_checksum_writes_nothing() {
        let mut fragment = sparse(2, &[(Payload::Raw(&[4; 2 * BS as usize]), 2)]);
        let last = fragment.len() - 1;
        fragment[last] ^= 0xff;
        let options = DecodeOptions {
            verify_checksums: true,
            ..Default::default()
        };
        let mut output = Cursor::new(vec![]);
        assert!(matches!(
            decode_fragment(Cursor::new(&fragment[..]), &mut output, &options),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert!(output.get_ref().is_empty());
    }

    #[test]
    fn failing_fragment_aborts_merge() {
        let good = sparse(1, &[(Payload::Fill(0x05050505), 1)]);
        let mut bad = good.clone();
        bad[0] = 0;
        let mut output = Cursor::new(vec![]);
        let err = merge(
            [
                Cursor::new(&good[..]),
                Cursor::new(&bad[..]),
                Cursor::new(&good[..]),
            ],
            &mut output,
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Fragment { index: 1, .. }));
        assert_eq!(output.get_ref(), &vec![5u8; BS as usize]);
    }

    #[test]
    fn verifies_checksums() {
        let mut fragment = sparse(1, &[(Payload::Raw(&[4; BS as usize]), 1)]);
        let options = DecodeOptions {
            verify_checksums: true,
            ..Default::default()
        };
        decode_fragment(Cursor::new(&fragment[..]), &mut Cursor::new(vec![]), &options).unwrap();

        // Flip a payload byte
        let last = fragment.len() - 1;
        fragment[last] ^= 0xff;
        assert!(matches!(
            decode_fragment(Cursor::new(&fragment[..]), &mut Cursor::new(vec![]), &options),
            Err(Error::ChecksumMismatch { .. })
        ));
        decode_fragment(
            Cursor::new(&fragment[..]),
            &mut Cursor::new(vec![]),
            &Default::default(),
        )
        .unwrap();
    }
}
