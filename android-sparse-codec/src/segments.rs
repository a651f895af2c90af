use std::{
    cmp::Ordering,
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use log::debug;
use regex::Regex;

/// File name suffixes used by vendor tools for split sparse images, e.g. `system.img_sparsechunk.0`
/// or `super.img.3`
fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(_sparsechunk|sparse_chunk|\.chunk|\.img)\.\d+$")
            .expect("static regex must compile")
    })
}

/// Whether `name` looks like one segment of a split sparse image
pub fn is_segment_name(name: &str) -> bool {
    segment_pattern().is_match(name)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Part<'a> {
    Number(u64),
    Text(&'a str),
}

/// Split a name into runs of digits and other text, so `a.10` sorts after `a.9`
fn natural_key(name: &str) -> Vec<Part<'_>> {
    let mut parts = vec![];
    let mut rest = name;
    while let Some(c) = rest.chars().next() {
        let digits = c.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (part, tail) = rest.split_at(end);
        parts.push(match part.parse() {
            Ok(n) if digits => Part::Number(n),
            _ => Part::Text(part),
        });
        rest = tail;
    }
    parts
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b)).then_with(|| a.cmp(b))
}

/// Collect the segments of a split sparse image in `dir`, in the order they should be merged
///
/// Files are matched on their name only; subdirectories and anything not matching a known
/// segment suffix are ignored. The result is sorted naturally, so numbered suffixes come out in
/// numeric order.
pub fn find_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = vec![];
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        match name.to_str() {
            Some(name) if is_segment_name(name) => segments.push(entry.path()),
            _ => debug!("Ignoring {}", entry.path().display()),
        }
    }

    segments.sort_by(|a, b| {
        natural_cmp(
            &a.file_name().unwrap_or_default().to_string_lossy(),
            &b.file_name().unwrap_or_default().to_string_lossy(),
        )
    });
    debug!("Found {} segments in {}", segments.len(), dir.display());
    Ok(segments)
}
