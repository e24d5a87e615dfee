//! Field-extractor invocation helpers.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::Result;

use super::{Invoker, ToolKind, path_arg};

/// Build a per-frame field-extraction argument list.
///
/// The output is one line per frame with `separator`-joined values, one
/// column per entry in `fields`. An optional display filter restricts the
/// frames considered.
pub fn field_extraction_args(
    input: &Path,
    fields: &[&str],
    separator: char,
    display_filter: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "-r".to_string(),
        path_arg(input),
        "-T".to_string(),
        "fields".to_string(),
        "-E".to_string(),
        format!("separator={separator}"),
        "-E".to_string(),
        "occurrence=f".to_string(),
    ];
    for field in fields {
        args.push("-e".to_string());
        args.push((*field).to_string());
    }
    if let Some(filter) = display_filter {
        args.push("-Y".to_string());
        args.push(filter.to_string());
    }
    args
}

/// Write a copy of `input` that excludes the given TCP stream IDs.
///
/// An empty `exclude_streams` list degenerates to a plain file copy.
pub fn write_excluding_streams(
    invoker: &Invoker,
    input: &Path,
    output: &Path,
    exclude_streams: &[u64],
) -> Result<()> {
    if exclude_streams.is_empty() {
        debug!("no streams to exclude for {}; copying", input.display());
        fs::copy(input, output)?;
        return Ok(());
    }

    let filter = exclude_streams
        .iter()
        .map(|id| format!("tcp.stream != {id}"))
        .collect::<Vec<_>>()
        .join(" and ");
    debug!(
        "filtering {} -> {} with display filter: {}",
        input.display(),
        output.display(),
        filter
    );

    let args = vec![
        "-r".to_string(),
        path_arg(input),
        "-Y".to_string(),
        filter,
        "-w".to_string(),
        path_arg(output),
    ];
    invoker.invoke(ToolKind::Tshark, &args)?;
    Ok(())
}

/// Write a header-only copy of `input`: a valid capture with zero packets.
///
/// Uses a read filter that can never match a frame, so only the file header
/// survives into the output.
pub fn write_empty_copy(invoker: &Invoker, input: &Path, output: &Path) -> Result<()> {
    let args = vec![
        "-r".to_string(),
        path_arg(input),
        "-Y".to_string(),
        "frame.number == 0".to_string(),
        "-w".to_string(),
        path_arg(output),
    ];
    invoker.invoke(ToolKind::Tshark, &args)?;
    Ok(())
}
