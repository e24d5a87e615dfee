//! Original-capture archival.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use log::info;

use crate::error::Result;

/// Archive all original inputs into `<output_dir>/archive.tar.gz`
/// (`archive.tar` when compression is disabled).
///
/// Entries are stored relative to the inputs' common root directory; inputs
/// with no meaningful common root are stored under their basename. The
/// archive is written to a temporary sibling and renamed into place only
/// after it is complete, so a failed run never leaves a truncated archive
/// behind.
pub fn archive_originals(
    inputs: &[PathBuf],
    output_dir: &Path,
    compress: bool,
) -> Result<PathBuf> {
    let file_name = if compress { "archive.tar.gz" } else { "archive.tar" };
    let archive_path = output_dir.join(file_name);
    let tmp_path = output_dir.join(format!("{file_name}.tmp"));

    let common_root = common_root(inputs);

    {
        let file = BufWriter::new(File::create(&tmp_path)?);
        if compress {
            let encoder = GzEncoder::new(file, Compression::default());
            let encoder = append_all(encoder, inputs, common_root.as_deref())?;
            encoder.finish()?.flush()?;
        } else {
            append_all(file, inputs, common_root.as_deref())?.flush()?;
        }
    }

    fs::rename(&tmp_path, &archive_path)?;
    info!(
        "archived {} original file(s) to {}",
        inputs.len(),
        archive_path.display()
    );
    Ok(archive_path)
}

fn append_all<W: Write>(
    writer: W,
    inputs: &[PathBuf],
    common_root: Option<&Path>,
) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    for input in inputs {
        let entry_name = entry_name(input, common_root);
        builder.append_path_with_name(input, entry_name)?;
    }
    Ok(builder.into_inner()?)
}

fn entry_name(input: &Path, common_root: Option<&Path>) -> PathBuf {
    if let Some(root) = common_root {
        if let Ok(relative) = input.strip_prefix(root) {
            if !relative.as_os_str().is_empty() {
                return relative.to_path_buf();
            }
        }
    }
    PathBuf::from(input.file_name().unwrap_or(input.as_os_str()))
}

/// Longest common ancestor directory of the inputs' parents, if it is more
/// specific than the filesystem root.
fn common_root(inputs: &[PathBuf]) -> Option<PathBuf> {
    let mut parents = inputs.iter().filter_map(|p| p.parent());
    let first = parents.next()?;
    let mut common: Vec<Component<'_>> = first.components().collect();

    for parent in parents {
        let components: Vec<Component<'_>> = parent.components().collect();
        let matching = common
            .iter()
            .zip(&components)
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(matching);
        if common.is_empty() {
            return None;
        }
    }

    let has_normal_part = common
        .iter()
        .any(|c| matches!(c, Component::Normal(_)));
    if !has_normal_part {
        return None;
    }
    Some(common.iter().collect())
}
