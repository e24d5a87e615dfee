//! Capture-editor invocations (time cropping and duplicate removal).

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};

use super::{Invoker, ToolKind, path_arg};

/// Crop `input` to the closed window `[start_time, end_time]` (epoch seconds).
pub fn time_crop(
    invoker: &Invoker,
    input: &Path,
    output: &Path,
    start_time: f64,
    end_time: f64,
) -> Result<()> {
    if end_time <= start_time {
        return Err(Error::Config {
            reason: format!(
                "invalid time window for crop: start {start_time} must be earlier than end \
                 {end_time}"
            ),
        });
    }
    ensure_parent(output)?;

    let args = vec![
        "-A".to_string(),
        format_epoch(start_time),
        "-B".to_string(),
        format_epoch(end_time),
        path_arg(input),
        path_arg(output),
    ];
    invoker.invoke(ToolKind::Editcap, &args)?;
    debug!("time crop completed: {} -> {}", input.display(), output.display());
    Ok(())
}

/// Remove duplicate packets from `input` within a sliding window.
///
/// `window_packets = None` uses the tool's default window (`-d`);
/// `ignore_bytes > 0` excludes that many trailing bytes from the duplicate
/// fingerprint (`-I`).
pub fn dedup(
    invoker: &Invoker,
    input: &Path,
    output: &Path,
    window_packets: Option<u32>,
    ignore_bytes: u32,
) -> Result<()> {
    ensure_parent(output)?;

    let mut args = Vec::new();
    push_dedup_args(&mut args, window_packets, ignore_bytes);
    args.push(path_arg(input));
    args.push(path_arg(output));
    invoker.invoke(ToolKind::Editcap, &args)?;
    debug!("dedup completed: {} -> {}", input.display(), output.display());
    Ok(())
}

/// Crop and deduplicate in one pass over the file.
///
/// Semantics match [`time_crop`] followed by [`dedup`]; only the number of
/// scans over the capture changes.
pub fn time_crop_and_dedup(
    invoker: &Invoker,
    input: &Path,
    output: &Path,
    start_time: f64,
    end_time: f64,
    window_packets: Option<u32>,
    ignore_bytes: u32,
) -> Result<()> {
    if end_time <= start_time {
        return Err(Error::Config {
            reason: format!(
                "invalid time window for crop+dedup: start {start_time} must be earlier than \
                 end {end_time}"
            ),
        });
    }
    ensure_parent(output)?;

    let mut args = vec![
        "-A".to_string(),
        format_epoch(start_time),
        "-B".to_string(),
        format_epoch(end_time),
    ];
    push_dedup_args(&mut args, window_packets, ignore_bytes);
    args.push(path_arg(input));
    args.push(path_arg(output));
    invoker.invoke(ToolKind::Editcap, &args)?;
    debug!(
        "time crop+dedup completed: {} -> {}",
        input.display(),
        output.display()
    );
    Ok(())
}

fn push_dedup_args(args: &mut Vec<String>, window_packets: Option<u32>, ignore_bytes: u32) {
    match window_packets {
        None => args.push("-d".to_string()),
        Some(window) => {
            args.push("-D".to_string());
            args.push(window.to_string());
        }
    }
    if ignore_bytes > 0 {
        args.push("-I".to_string());
        args.push(ignore_bytes.to_string());
    }
}

fn format_epoch(ts: f64) -> String {
    // Sub-second precision matters for crop boundaries; six digits matches
    // the precision the metadata tool reports.
    format!("{ts:.6}")
}

fn ensure_parent(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
