//! Markdown report for preprocess runs.
//!
//! Report generation is best-effort: any failure is logged as a warning and
//! never affects the pipeline result.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Result;
use crate::metadata::MetadataService;

use super::config::PreprocessConfig;
use super::steps::Step;

pub(crate) fn maybe_write_report(
    cfg: &PreprocessConfig,
    metadata: &MetadataService,
    inputs: &[PathBuf],
    final_files: &[PathBuf],
    steps: &[Step],
    output_dir: &Path,
    archive_path: Option<&Path>,
) -> Option<PathBuf> {
    if !cfg.report_enabled {
        return None;
    }

    let report_path = match &cfg.report_path {
        Some(path) if path.is_absolute() => path.clone(),
        // Relative report paths stay co-located with the generated captures.
        Some(path) => output_dir.join(path),
        None => output_dir.join("preprocess_report.md"),
    };

    match write_report(
        cfg,
        metadata,
        inputs,
        final_files,
        steps,
        output_dir,
        archive_path,
        &report_path,
    ) {
        Ok(()) => {
            info!("preprocess report written to {}", report_path.display());
            Some(report_path)
        }
        Err(err) => {
            warn!("failed to generate preprocess report: {err}");
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_report(
    cfg: &PreprocessConfig,
    metadata: &MetadataService,
    inputs: &[PathBuf],
    final_files: &[PathBuf],
    steps: &[Step],
    output_dir: &Path,
    archive_path: Option<&Path>,
    report_path: &Path,
) -> Result<()> {
    let mut body = String::new();

    let now = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string());
    let steps_str = if steps.is_empty() {
        "(none)".to_string()
    } else {
        steps
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(" -> ")
    };

    let _ = writeln!(body, "# CapSift preprocess report");
    let _ = writeln!(body);
    let _ = writeln!(body, "Generated at: {now}");
    let _ = writeln!(body, "Output directory: {}", output_dir.display());
    let _ = writeln!(body, "Steps executed: {steps_str}");
    let _ = writeln!(body);

    let _ = writeln!(body, "## Effective configuration (subset)");
    let _ = writeln!(body);
    let _ = writeln!(body, "- archive_original: {}", cfg.archive_original);
    let _ = writeln!(body, "- time_align_enabled: {}", cfg.time_align_enabled);
    let _ = writeln!(body, "- dedup_enabled: {}", cfg.dedup_enabled);
    let _ = writeln!(body, "- oneway_enabled: {}", cfg.oneway_enabled);
    let _ = writeln!(
        body,
        "- time_align_allow_empty: {}",
        cfg.time_align_allow_empty
    );
    let _ = writeln!(
        body,
        "- oneway_ack_threshold: {}",
        cfg.oneway_ack_threshold
    );
    let _ = writeln!(body, "- workers: {}", cfg.workers);
    let _ = writeln!(body);

    let _ = writeln!(body, "## File comparison");
    let _ = writeln!(body);
    let _ = writeln!(
        body,
        "| Original path | Final path | Packets (orig) | Packets (final) | First ts (orig) | \
         Last ts (orig) | First ts (final) | Last ts (final) | Archived |"
    );
    let _ = writeln!(body, "| --- | --- | ---:| ---:| ---:| ---:| ---:| ---:| --- |");

    let archived_str = if archive_path.is_some() { "yes" } else { "no" };
    for (original, final_file) in inputs.iter().zip(final_files) {
        let row = match file_stats(metadata, original, final_file) {
            Ok((orig_count, final_count, orig_tr, final_tr)) => format!(
                "| {} | {} | {} | {} | {:.6} | {:.6} | {:.6} | {:.6} | {} |",
                original.display(),
                final_file.display(),
                orig_count,
                final_count,
                orig_tr.0,
                orig_tr.1,
                final_tr.0,
                final_tr.1,
                archived_str
            ),
            Err(err) => {
                warn!(
                    "failed to collect stats for {} / {}: {err}",
                    original.display(),
                    final_file.display()
                );
                format!(
                    "| {} | {} | N/A | N/A | N/A | N/A | N/A | N/A | {} |",
                    original.display(),
                    final_file.display(),
                    archived_str
                )
            }
        };
        let _ = writeln!(body, "{row}");
    }

    if let Some(parent) = report_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(report_path, body)?;
    Ok(())
}

type FileStats = (u64, u64, (f64, f64), (f64, f64));

fn file_stats(
    metadata: &MetadataService,
    original: &Path,
    final_file: &Path,
) -> Result<FileStats> {
    let orig_count = metadata.packet_count(original)?;
    let final_count = metadata.packet_count(final_file)?;
    let orig_tr = metadata.time_range(original)?.range();
    let final_tr = metadata.time_range(final_file)?.range();
    Ok((
        orig_count,
        final_count,
        (orig_tr.first_ts, orig_tr.last_ts),
        (final_tr.first_ts, final_tr.last_ts),
    ))
}
