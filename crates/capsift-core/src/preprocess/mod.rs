//! Preprocess pipeline: clean and align capture sets before analysis.
//!
//! The pipeline runs an ordered list of steps (`archive-original`,
//! `time-align`, `dedup`, `oneway`) over the input captures. Every step maps
//! an ordered file list to a file list of the same length with the same
//! positions, so the final outputs stay aligned with the original inputs.
//! Consecutive `time-align` + `dedup` steps are fused into a single pass.
//!
//! Intermediate files live in a scratch directory owned by the run (or
//! supplied by the caller); finals are materialised as
//! `<output_dir>/<stem>.ready<suffix>`.

mod archive;
pub mod config;
mod report;
mod steps;

pub use archive::archive_originals;
pub use config::{PreprocessConfig, PreprocessRuntimeConfig};
pub use steps::{Step, automatic_steps, fuse_steps};

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::ThreadPool;
use rayon::prelude::*;

use crate::error::{Error, Result, warn_or_strict};
use crate::metadata::{MetadataService, TimeRange};
use crate::oneway::OneWayDetector;
use crate::tools::{
    Invoker, ToolKind, dedup as editcap_dedup, field_extraction_args, time_crop,
    time_crop_and_dedup, write_empty_copy, write_excluding_streams,
};

/// Fields fed to the one-way detector, in the order it expects them.
const ONEWAY_FIELDS: [&str; 7] = [
    "tcp.stream",
    "ip.src",
    "tcp.srcport",
    "ip.dst",
    "tcp.dstport",
    "tcp.ack",
    "tcp.len",
];

/// Result of a preprocess run.
#[derive(Debug)]
pub struct PreprocessOutcome {
    /// Final outputs, positionally aligned with the inputs.
    pub final_files: Vec<PathBuf>,
    /// Steps actually executed, after fusion.
    pub steps: Vec<Step>,
    /// Markdown report location, when one was written.
    pub report_path: Option<PathBuf>,
    /// Originals archive location, when archival ran.
    pub archive_path: Option<PathBuf>,
}

struct StepContext<'a> {
    cfg: &'a PreprocessConfig,
    invoker: &'a Invoker,
    metadata: &'a MetadataService,
    pool: &'a ThreadPool,
    tmp_dir: &'a Path,
}

/// Execute the preprocess pipeline.
///
/// `explicit_steps` overrides the automatic step list derived from the
/// config toggles. When `tmp_dir` is `None` a fresh scratch directory is
/// created and removed when the run ends, on success and on error alike.
pub fn run_preprocess(
    runtime: &PreprocessRuntimeConfig,
    inputs: &[PathBuf],
    output_dir: &Path,
    explicit_steps: Option<&[Step]>,
    tmp_dir: Option<&Path>,
) -> Result<PreprocessOutcome> {
    let cfg = &runtime.preprocess;
    fs::create_dir_all(output_dir).map_err(|err| Error::OutputDirectory {
        path: output_dir.to_path_buf(),
        reason: err.to_string(),
    })?;

    let resolved = match explicit_steps {
        Some(steps) if !steps.is_empty() => steps.to_vec(),
        _ => automatic_steps(cfg),
    };
    let steps = fuse_steps(&resolved);
    let archive_enabled = resolved.contains(&Step::ArchiveOriginal);

    // Scratch directory: owned (auto-removed on drop) unless caller-supplied.
    let owned_scratch;
    let scratch: &Path = match tmp_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            dir
        }
        None => {
            owned_scratch = tempfile::Builder::new()
                .prefix("capsift-preprocess-")
                .tempdir()?;
            owned_scratch.path()
        }
    };

    let invoker = Invoker::new(runtime.tools.clone());
    let metadata = MetadataService::new(invoker.clone());
    let pool_size = cfg.workers.max(1).min(inputs.len().max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(pool_size)
        .thread_name(|i| format!("capsift-worker-{i}"))
        .build()
        .map_err(|err| Error::Config {
            reason: format!("failed to build worker pool: {err}"),
        })?;

    let ctx = StepContext {
        cfg,
        invoker: &invoker,
        metadata: &metadata,
        pool: &pool,
        tmp_dir: scratch,
    };

    let mut current: Vec<PathBuf> = inputs.to_vec();
    for step in &steps {
        info!("running preprocess step: {step}");
        let next = run_step(&ctx, *step, &current)?;
        if next.len() != current.len() {
            return Err(Error::Config {
                reason: format!(
                    "step '{step}' changed the file count ({} -> {})",
                    current.len(),
                    next.len()
                ),
            });
        }
        current = next;
    }

    let mut final_files = Vec::with_capacity(inputs.len());
    for (original, produced) in inputs.iter().zip(&current) {
        let final_path = ready_output_path(output_dir, original);
        materialize(produced, original, &final_path)?;
        final_files.push(final_path);
    }

    let archive_path = if archive_enabled {
        Some(archive_originals(
            inputs,
            output_dir,
            cfg.archive_compress,
        )?)
    } else {
        None
    };

    let report_path = report::maybe_write_report(
        cfg,
        &metadata,
        inputs,
        &final_files,
        &steps,
        output_dir,
        archive_path.as_deref(),
    );

    Ok(PreprocessOutcome {
        final_files,
        steps,
        report_path,
        archive_path,
    })
}

fn run_step(ctx: &StepContext<'_>, step: Step, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    match step {
        // Archival happens during finalisation; the step keeps its place in
        // explicit step lists and reports.
        Step::ArchiveOriginal => Ok(files.to_vec()),
        Step::TimeAlign => time_align_step(ctx, files),
        Step::Dedup => dedup_step(ctx, files),
        Step::Oneway => oneway_step(ctx, files),
        Step::TimeAlignDedup => time_align_dedup_step(ctx, files),
    }
}

fn time_align_step(ctx: &StepContext<'_>, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if files.len() < 2 {
        warn_or_strict(
            ctx.cfg.strict,
            format!("time-align requires at least 2 files; skipping (got {})", files.len()),
        )?;
        return Ok(files.to_vec());
    }

    let (t_start, t_end) = global_overlap(ctx, files)?;
    info!("global overlap window: [{t_start:.6}, {t_end:.6}]");

    if t_start >= t_end {
        if !ctx.cfg.time_align_allow_empty {
            warn_or_strict(
                ctx.cfg.strict,
                "no overlapping time window between input captures; leaving inputs unchanged",
            )?;
            return Ok(files.to_vec());
        }
        return map_files(ctx, files, |src| {
            let out = scratch_path(ctx.tmp_dir, src, "timealign-empty");
            write_empty_copy(ctx.invoker, src, &out)?;
            Ok(out)
        });
    }

    map_files(ctx, files, |src| {
        let out = scratch_path(ctx.tmp_dir, src, "timealign");
        debug!(
            "cropping {} to [{t_start:.6}, {t_end:.6}] -> {}",
            src.display(),
            out.display()
        );
        time_crop(ctx.invoker, src, &out, t_start, t_end)?;
        Ok(out)
    })
}

fn dedup_step(ctx: &StepContext<'_>, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    map_files(ctx, files, |src| {
        let out = scratch_path(ctx.tmp_dir, src, "dedup");
        editcap_dedup(
            ctx.invoker,
            src,
            &out,
            ctx.cfg.dedup_window_packets,
            ctx.cfg.dedup_ignore_bytes,
        )?;
        Ok(out)
    })
}

/// Fused `time-align` + `dedup`: one editor pass per file.
fn time_align_dedup_step(ctx: &StepContext<'_>, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if files.len() < 2 {
        warn_or_strict(
            ctx.cfg.strict,
            format!(
                "time-align+dedup requires at least 2 files; falling back to dedup only (got {})",
                files.len()
            ),
        )?;
        return dedup_step(ctx, files);
    }

    let (t_start, t_end) = global_overlap(ctx, files)?;
    info!("global overlap window (fused): [{t_start:.6}, {t_end:.6}]");

    if t_start >= t_end {
        if !ctx.cfg.time_align_allow_empty {
            warn_or_strict(
                ctx.cfg.strict,
                "no overlapping time window between input captures; running dedup only",
            )?;
            return dedup_step(ctx, files);
        }
        return map_files(ctx, files, |src| {
            let out = scratch_path(ctx.tmp_dir, src, "timealign-empty");
            write_empty_copy(ctx.invoker, src, &out)?;
            Ok(out)
        });
    }

    map_files(ctx, files, |src| {
        let out = scratch_path(ctx.tmp_dir, src, "timealign_dedup");
        time_crop_and_dedup(
            ctx.invoker,
            src,
            &out,
            t_start,
            t_end,
            ctx.cfg.dedup_window_packets,
            ctx.cfg.dedup_ignore_bytes,
        )?;
        Ok(out)
    })
}

fn oneway_step(ctx: &StepContext<'_>, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    map_files(ctx, files, |src| {
        let out = scratch_path(ctx.tmp_dir, src, "oneway");
        let stream_ids = detect_one_way_streams(ctx.invoker, src, ctx.cfg.oneway_ack_threshold)?;
        if stream_ids.is_empty() {
            info!("no one-way streams detected for {}", src.display());
        } else {
            info!(
                "filtering {} one-way streams from {}",
                stream_ids.len(),
                src.display()
            );
        }
        write_excluding_streams(ctx.invoker, src, &out, &stream_ids)?;
        Ok(out)
    })
}

/// Detect one-way TCP stream IDs in a capture, in ascending order.
pub fn detect_one_way_streams(
    invoker: &Invoker,
    capture: &Path,
    ack_threshold: u64,
) -> Result<Vec<u64>> {
    let args = field_extraction_args(capture, &ONEWAY_FIELDS, '\t', Some("tcp"));
    let mut detector = OneWayDetector::new(ack_threshold);
    invoker.invoke_streaming(ToolKind::Tshark, &args, |line| detector.add_line(line))?;
    if detector.skipped() > 0 {
        debug!(
            "one-way detection skipped {} malformed lines for {}",
            detector.skipped(),
            capture.display()
        );
    }
    Ok(detector.analyze().into_iter().map(|v| v.stream_id).collect())
}

fn global_overlap(ctx: &StepContext<'_>, files: &[PathBuf]) -> Result<(f64, f64)> {
    let ranges: Vec<TimeRange> = map_files_to(ctx, files, |src| {
        let range = ctx.metadata.time_range(src)?.range();
        debug!(
            "time range for {}: [{:.6}, {:.6}]",
            src.display(),
            range.first_ts,
            range.last_ts
        );
        Ok(range)
    })?;

    let t_start = ranges.iter().map(|r| r.first_ts).fold(f64::MIN, f64::max);
    let t_end = ranges.iter().map(|r| r.last_ts).fold(f64::MAX, f64::min);
    Ok((t_start, t_end))
}

fn map_files(
    ctx: &StepContext<'_>,
    files: &[PathBuf],
    op: impl Fn(&Path) -> Result<PathBuf> + Sync,
) -> Result<Vec<PathBuf>> {
    map_files_to(ctx, files, op)
}

fn map_files_to<T: Send>(
    ctx: &StepContext<'_>,
    files: &[PathBuf],
    op: impl Fn(&Path) -> Result<T> + Sync,
) -> Result<Vec<T>> {
    if files.len() <= 1 {
        return files.iter().map(|f| op(f)).collect();
    }
    ctx.pool
        .install(|| files.par_iter().map(|f| op(f)).collect())
}

/// Split a capture file name into `(stem, suffix)`, e.g.
/// `("capture", ".pcapng")`.
fn split_capture_name(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("capture")
        .to_string();
    if let Some(base) = name.strip_suffix(".pcapng") {
        return (base.to_string(), ".pcapng".to_string());
    }
    if let Some(base) = name.strip_suffix(".pcap") {
        return (base.to_string(), ".pcap".to_string());
    }
    match name.rsplit_once('.') {
        Some((base, ext)) => (base.to_string(), format!(".{ext}")),
        None => (name, String::new()),
    }
}

fn scratch_path(tmp_dir: &Path, src: &Path, tag: &str) -> PathBuf {
    let (stem, suffix) = split_capture_name(src);
    tmp_dir.join(format!("{stem}.{tag}{suffix}"))
}

/// Final output path: `<output_dir>/<stem>.ready<suffix>`.
fn ready_output_path(output_dir: &Path, original: &Path) -> PathBuf {
    let (stem, suffix) = split_capture_name(original);
    output_dir.join(format!("{stem}.ready{suffix}"))
}

fn materialize(produced: &Path, original: &Path, final_path: &Path) -> Result<()> {
    if produced == final_path {
        return Ok(());
    }
    if produced == original {
        // Passthrough step output: the original must stay in place.
        fs::copy(produced, final_path)?;
        return Ok(());
    }
    if fs::rename(produced, final_path).is_err() {
        // Scratch and output may sit on different filesystems.
        fs::copy(produced, final_path)?;
        let _ = fs::remove_file(produced);
    }
    Ok(())
}
