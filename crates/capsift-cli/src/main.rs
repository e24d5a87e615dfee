//! CapSift command-line interface.
//!
//! This binary wires arguments and logging around the `capsift-core`
//! pipeline: preprocessing capture sets, running per-protocol analysis
//! modules, and correlating TCP connections across two capture points.
//!
//! Typical usage:
//! - `capsift preprocess -i captures/ -o cleaned/`
//! - `capsift analyze -i capture.pcap -o reports/`
//! - `capsift match --file1 hop1.pcap --file2 hop2.pcap -o matches.txt`
//!
//! Errors are reported to stderr as a single `Error:` line with an optional
//! `Suggestion:` line; a non-zero exit code indicates failure.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{LevelFilter, warn};

use capsift_core::analyze::{DispatchConfig, ModuleOutcome, ModuleRegistry, detect_protocols, dispatch};
use capsift_core::connections::{TcpConnection, extract_connections};
use capsift_core::diff;
use capsift_core::matching::{
    AssignmentMode, BucketKey, MatchConfig, MatchProfile, match_connections,
};
use capsift_core::preprocess::{
    PreprocessConfig, PreprocessRuntimeConfig, Step, run_preprocess,
};
use capsift_core::report::{ReportFormat, ReportMeta, ReportTarget, write_report};
use capsift_core::tools::{Invoker, ToolPaths};
use capsift_core::{Error as CoreError, is_capture_file};

#[derive(Parser, Debug)]
#[command(name = "capsift")]
#[command(
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (commit ",
        env!("CAPSIFT_BUILD_COMMIT"),
        ", built ",
        env!("CAPSIFT_BUILD_DATE"),
        ")"
    )
)]
#[command(
    about = "Capture-file analysis toolkit: preprocess, per-protocol statistics, and \
             cross-capture TCP connection matching.",
    long_about = None,
    after_help = "Examples:\n  capsift preprocess -i captures/ -o cleaned/\n  capsift analyze -i \
                  capture.pcap -o reports/\n  capsift match --file1 hop1.pcap --file2 hop2.pcap \
                  -o matches.txt"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct CommonOpts {
    /// Input capture file, comma-separated file list, or directory
    #[arg(short = 'i', long = "input")]
    input: Option<String>,

    /// Output file or directory
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Treat warnings as fatal errors
    #[arg(long)]
    strict: bool,

    /// Suppress info and warning logs (errors are still shown)
    #[arg(long)]
    silent: bool,

    /// Worker pool size
    #[arg(short = 'w', long, default_value_t = 4)]
    workers: usize,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Args, Debug, Clone)]
struct DualFileOpts {
    /// First capture file (alternative to --input)
    #[arg(long, conflicts_with = "input", requires = "file2")]
    file1: Option<PathBuf>,

    /// Second capture file (alternative to --input)
    #[arg(long, conflicts_with = "input", requires = "file1")]
    file2: Option<PathBuf>,

    /// Numeric capture id recorded for file1
    #[arg(long, requires = "file1")]
    file1_pcapid: Option<u32>,

    /// Numeric capture id recorded for file2
    #[arg(long, requires = "file2")]
    file2_pcapid: Option<u32>,
}

#[derive(Args, Debug, Clone)]
struct MatchOpts {
    /// Scoring profile
    #[arg(long, default_value = "auto")]
    profile: String,

    /// Minimum score for a reported pair
    #[arg(long, default_value_t = 0.50)]
    threshold: f64,

    /// Allow a connection to appear in multiple pairs
    #[arg(long)]
    one_to_many: bool,

    /// Candidate bucketing key (server-port, port-pair, hash)
    #[arg(long, default_value = "server-port")]
    bucket: String,

    /// Output format (txt or md)
    #[arg(long, default_value = "txt")]
    format: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run per-protocol analysis modules against each input capture.
    Analyze {
        #[command(flatten)]
        common: CommonOpts,

        /// Output format (txt or md)
        #[arg(long, default_value = "txt")]
        format: String,
    },
    /// Clean and align capture files (time-align, dedup, oneway, archive).
    Preprocess {
        #[command(flatten)]
        common: CommonOpts,

        /// Explicit step list, in order (repeatable)
        #[arg(long = "step", value_name = "NAME")]
        steps: Vec<String>,

        /// Enable the dedup step
        #[arg(long)]
        enable_dedup: bool,
        /// Disable the dedup step
        #[arg(long)]
        disable_dedup: bool,
        /// Enable the oneway step
        #[arg(long)]
        enable_oneway: bool,
        /// Disable the oneway step
        #[arg(long)]
        disable_oneway: bool,
        /// Enable the time-align step
        #[arg(long)]
        enable_time_align: bool,
        /// Disable the time-align step
        #[arg(long)]
        disable_time_align: bool,
        /// Enable the archive-original step
        #[arg(long)]
        enable_archive_original: bool,
        /// Disable the archive-original step
        #[arg(long)]
        disable_archive_original: bool,

        /// Dedup window size in packets (tool default when omitted)
        #[arg(long)]
        dedup_window_packets: Option<u32>,

        /// Ignore N bytes at packet end when deduplicating
        #[arg(long)]
        dedup_ignore_bytes: Option<u32>,

        /// ACK threshold for oneway detection
        #[arg(long)]
        oneway_ack_threshold: Option<u64>,

        /// Produce empty-but-valid outputs when captures do not overlap
        #[arg(long)]
        enable_time_align_allow_empty: bool,
        /// Keep inputs unchanged when captures do not overlap
        #[arg(long)]
        disable_time_align_allow_empty: bool,

        /// Compress the originals archive
        #[arg(long)]
        archive_compress: bool,
        /// Do not compress the originals archive
        #[arg(long)]
        no_archive_compress: bool,

        /// Disable the Markdown report
        #[arg(long)]
        no_report: bool,

        /// Custom path for the Markdown report
        #[arg(long)]
        report_path: Option<PathBuf>,
    },
    /// Correlate TCP connections across two captures.
    Match {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        dual: DualFileOpts,
        #[command(flatten)]
        matching: MatchOpts,
    },
    /// Per-packet difference report for matched connections.
    Compare {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        dual: DualFileOpts,
        #[command(flatten)]
        matching: MatchOpts,
    },
    /// Per-stream, per-direction difference report for matched connections.
    Streamdiff {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        dual: DualFileOpts,
        #[command(flatten)]
        matching: MatchOpts,
    },
    /// Client/server endpoint graph across the input captures.
    Topology {
        #[command(flatten)]
        common: CommonOpts,

        /// Output format (txt or md)
        #[arg(long, default_value = "txt")]
        format: String,
    },
    /// Run the analysis modules on two captures and compare the results.
    #[command(name = "comparative-analysis")]
    ComparativeAnalysis {
        #[command(flatten)]
        common: CommonOpts,
        #[command(flatten)]
        dual: DualFileOpts,

        /// Output format (txt or md)
        #[arg(long, default_value = "txt")]
        format: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze { common, format } => {
            init_logging(&common);
            cmd_analyze(common, format)
        }
        Commands::Preprocess {
            common,
            steps,
            enable_dedup,
            disable_dedup,
            enable_oneway,
            disable_oneway,
            enable_time_align,
            disable_time_align,
            enable_archive_original,
            disable_archive_original,
            dedup_window_packets,
            dedup_ignore_bytes,
            oneway_ack_threshold,
            enable_time_align_allow_empty,
            disable_time_align_allow_empty,
            archive_compress,
            no_archive_compress,
            no_report,
            report_path,
        } => {
            init_logging(&common);
            cmd_preprocess(PreprocessArgs {
                common,
                steps,
                enable_dedup,
                disable_dedup,
                enable_oneway,
                disable_oneway,
                enable_time_align,
                disable_time_align,
                enable_archive_original,
                disable_archive_original,
                dedup_window_packets,
                dedup_ignore_bytes,
                oneway_ack_threshold,
                enable_time_align_allow_empty,
                disable_time_align_allow_empty,
                archive_compress,
                no_archive_compress,
                no_report,
                report_path,
            })
        }
        Commands::Match {
            common,
            dual,
            matching,
        } => {
            init_logging(&common);
            cmd_two_capture_report(common, dual, matching, TwoCaptureReport::Match)
        }
        Commands::Compare {
            common,
            dual,
            matching,
        } => {
            init_logging(&common);
            cmd_two_capture_report(common, dual, matching, TwoCaptureReport::Compare)
        }
        Commands::Streamdiff {
            common,
            dual,
            matching,
        } => {
            init_logging(&common);
            cmd_two_capture_report(common, dual, matching, TwoCaptureReport::Streamdiff)
        }
        Commands::Topology { common, format } => {
            init_logging(&common);
            cmd_topology(common, format)
        }
        Commands::ComparativeAnalysis {
            common,
            dual,
            format,
        } => {
            init_logging(&common);
            cmd_comparative_analysis(common, dual, format)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err.message);
            if let Some(suggestion) = err.suggestion {
                eprintln!("Suggestion: {suggestion}");
            }
            ExitCode::from(1)
        }
    }
}

fn init_logging(common: &CommonOpts) {
    let level = if common.silent {
        LevelFilter::Error
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .try_init();
}

#[derive(Debug)]
struct CliError {
    message: String,
    suggestion: Option<String>,
}

impl CliError {
    fn new(message: impl Into<String>, suggestion: Option<String>) -> Self {
        Self {
            message: message.into(),
            suggestion,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        let suggestion = err.suggestion();
        CliError::new(err.to_string(), suggestion)
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(err.to_string(), None)
    }
}

// ---------------------------------------------------------------------------
// Input resolution
// ---------------------------------------------------------------------------

fn resolve_inputs(common: &CommonOpts, dual: Option<&DualFileOpts>) -> Result<Vec<PathBuf>, CliError> {
    if let Some(dual) = dual {
        if let (Some(file1), Some(file2)) = (&dual.file1, &dual.file2) {
            let files = vec![file1.clone(), file2.clone()];
            for file in &files {
                validate_capture_file(file)?;
            }
            return Ok(files);
        }
    }

    let Some(input) = &common.input else {
        return Err(CliError::new(
            "missing input",
            Some("pass -i/--input, or --file1/--file2 for two-capture commands".to_string()),
        ));
    };

    let mut files = Vec::new();
    if input.contains(',') {
        // Comma-separated list: caller-defined order is preserved.
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            files.push(PathBuf::from(part));
        }
    } else {
        let path = PathBuf::from(input);
        if path.is_dir() {
            files = scan_capture_dir(&path)?;
        } else if is_glob_pattern(input) {
            files = expand_glob(input)?;
        } else {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(CoreError::NoMatchingFiles {
            path: input.clone(),
        }
        .into());
    }
    for file in &files {
        validate_capture_file(file)?;
    }
    Ok(files)
}

fn scan_capture_dir(dir: &Path) -> Result<Vec<PathBuf>, CliError> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read input directory: {}", dir.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_capture_file(path))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(CoreError::NoMatchingFiles {
            path: dir.display().to_string(),
        }
        .into());
    }
    Ok(files)
}

fn is_glob_pattern(input: &str) -> bool {
    input.contains('*') || input.contains('?') || input.contains('[')
}

fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, CliError> {
    let paths = glob::glob(pattern).map_err(|err| {
        CliError::new(
            format!("invalid input pattern '{pattern}'"),
            Some(format!("pattern error: {}", err.msg)),
        )
    })?;
    let mut files = Vec::new();
    for entry in paths {
        let path = entry.map_err(|err| {
            CliError::new(
                format!("invalid input pattern '{pattern}'"),
                Some(format!("pattern error: {err}")),
            )
        })?;
        if path.is_file() && is_capture_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn validate_capture_file(path: &Path) -> Result<(), CliError> {
    if !path.exists() {
        return Err(CoreError::InputNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    if !is_capture_file(path) {
        return Err(CliError::new(
            format!("unsupported input format '{}'", path.display()),
            Some("expected a .pcap or .pcapng file".to_string()),
        ));
    }
    Ok(())
}

fn require_two(files: Vec<PathBuf>) -> Result<(PathBuf, PathBuf), CliError> {
    if files.len() != 2 {
        return Err(CoreError::InsufficientFiles {
            required: 2,
            found: files.len(),
        }
        .into());
    }
    let mut iter = files.into_iter();
    Ok((iter.next().expect("first"), iter.next().expect("second")))
}

fn default_output_dir(inputs: &[PathBuf], name: &str) -> PathBuf {
    let base = inputs
        .first()
        .and_then(|p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(name)
}

// ---------------------------------------------------------------------------
// analyze
// ---------------------------------------------------------------------------

fn cmd_analyze(common: CommonOpts, format: String) -> Result<(), CliError> {
    let format: ReportFormat = format.parse().map_err(CliError::from_core)?;
    let inputs = resolve_inputs(&common, None)?;
    let output_dir = common
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(&inputs, "analysis"));

    let invoker = Invoker::new(ToolPaths::default());
    let registry = ModuleRegistry::builtin();
    let dispatch_config = DispatchConfig {
        output_dir,
        format,
        workers: common.workers,
    };

    let mut any_success = false;
    for capture in &inputs {
        let detected: BTreeSet<String> =
            detect_protocols(&invoker, capture).map_err(CliError::from_core)?;
        log::info!(
            "{}: detected protocols: {}",
            capture.display(),
            detected.iter().cloned().collect::<Vec<_>>().join(", ")
        );

        let outcomes =
            dispatch(&invoker, &registry, capture, &detected, &dispatch_config)
                .map_err(CliError::from_core)?;
        for outcome in &outcomes {
            match (&outcome.output, &outcome.error) {
                (Some(path), _) => {
                    any_success = true;
                    log::info!("{}: wrote {}", outcome.module, path.display());
                }
                (None, Some(error)) => warn!("{}: {error}", outcome.module),
                _ => {}
            }
        }
    }

    if !any_success {
        return Err(CliError::new(
            "no analysis module produced output",
            Some("check the capture contents and tool installation".to_string()),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// preprocess
// ---------------------------------------------------------------------------

struct PreprocessArgs {
    common: CommonOpts,
    steps: Vec<String>,
    enable_dedup: bool,
    disable_dedup: bool,
    enable_oneway: bool,
    disable_oneway: bool,
    enable_time_align: bool,
    disable_time_align: bool,
    enable_archive_original: bool,
    disable_archive_original: bool,
    dedup_window_packets: Option<u32>,
    dedup_ignore_bytes: Option<u32>,
    oneway_ack_threshold: Option<u64>,
    enable_time_align_allow_empty: bool,
    disable_time_align_allow_empty: bool,
    archive_compress: bool,
    no_archive_compress: bool,
    no_report: bool,
    report_path: Option<PathBuf>,
}

fn check_flag_pair(enable: bool, disable: bool, name: &str) -> Result<(), CliError> {
    if enable && disable {
        return Err(CliError::new(
            format!("cannot use both --enable-{name} and --disable-{name}"),
            Some(format!(
                "specify at most one of --enable-{name} or --disable-{name}"
            )),
        ));
    }
    Ok(())
}

fn toggle(enable: bool, disable: bool, default: bool) -> bool {
    if enable {
        true
    } else if disable {
        false
    } else {
        default
    }
}

fn cmd_preprocess(args: PreprocessArgs) -> Result<(), CliError> {
    check_flag_pair(args.enable_dedup, args.disable_dedup, "dedup")?;
    check_flag_pair(args.enable_oneway, args.disable_oneway, "oneway")?;
    check_flag_pair(args.enable_time_align, args.disable_time_align, "time-align")?;
    check_flag_pair(
        args.enable_archive_original,
        args.disable_archive_original,
        "archive-original",
    )?;
    check_flag_pair(
        args.enable_time_align_allow_empty,
        args.disable_time_align_allow_empty,
        "time-align-allow-empty",
    )?;
    check_flag_pair(args.archive_compress, args.no_archive_compress, "archive-compress")?;

    let explicit_steps: Vec<Step> = args
        .steps
        .iter()
        .map(|name| Step::parse(name))
        .collect::<Result<_, _>>()
        .map_err(CliError::from_core)?;

    if !explicit_steps.is_empty() {
        let any_toggle = args.enable_dedup
            || args.disable_dedup
            || args.enable_oneway
            || args.disable_oneway
            || args.enable_time_align
            || args.disable_time_align
            || args.enable_archive_original
            || args.disable_archive_original;
        if any_toggle {
            return Err(CliError::new(
                "cannot mix --step with enable/disable flags",
                Some(
                    "use either --step for explicit steps or flags for automatic mode"
                        .to_string(),
                ),
            ));
        }
    }

    let inputs = resolve_inputs(&args.common, None)?;
    let output_dir = args
        .common
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(&inputs, "preprocessed"));

    let defaults = PreprocessConfig::default();
    let preprocess = PreprocessConfig {
        dedup_enabled: toggle(args.enable_dedup, args.disable_dedup, defaults.dedup_enabled),
        oneway_enabled: toggle(
            args.enable_oneway,
            args.disable_oneway,
            defaults.oneway_enabled,
        ),
        time_align_enabled: toggle(
            args.enable_time_align,
            args.disable_time_align,
            defaults.time_align_enabled,
        ),
        archive_original: toggle(
            args.enable_archive_original,
            args.disable_archive_original,
            defaults.archive_original,
        ),
        archive_compress: toggle(
            args.archive_compress,
            args.no_archive_compress,
            defaults.archive_compress,
        ),
        dedup_window_packets: args.dedup_window_packets.or(defaults.dedup_window_packets),
        dedup_ignore_bytes: args
            .dedup_ignore_bytes
            .unwrap_or(defaults.dedup_ignore_bytes),
        oneway_ack_threshold: args
            .oneway_ack_threshold
            .unwrap_or(defaults.oneway_ack_threshold),
        time_align_allow_empty: toggle(
            args.enable_time_align_allow_empty,
            args.disable_time_align_allow_empty,
            defaults.time_align_allow_empty,
        ),
        report_enabled: !args.no_report,
        report_path: args.report_path.clone(),
        workers: args.common.workers,
        strict: args.common.strict,
    };

    let runtime = PreprocessRuntimeConfig {
        tools: ToolPaths::default(),
        preprocess,
    };

    let steps = if explicit_steps.is_empty() {
        None
    } else {
        Some(explicit_steps.as_slice())
    };
    let outcome = run_preprocess(&runtime, &inputs, &output_dir, steps, None)
        .map_err(CliError::from_core)?;

    log::info!(
        "preprocess completed, {} file(s) produced",
        outcome.final_files.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// match / compare / streamdiff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum TwoCaptureReport {
    Match,
    Compare,
    Streamdiff,
}

impl TwoCaptureReport {
    fn meta_id(self) -> &'static str {
        match self {
            TwoCaptureReport::Match => "matched_connections",
            TwoCaptureReport::Compare => "packet_differences",
            TwoCaptureReport::Streamdiff => "stream_differences",
        }
    }

    fn title(self) -> &'static str {
        match self {
            TwoCaptureReport::Match => "Matched connections",
            TwoCaptureReport::Compare => "Packet differences",
            TwoCaptureReport::Streamdiff => "Stream differences",
        }
    }
}

fn parse_bucket(value: &str) -> Result<BucketKey, CliError> {
    match value.to_ascii_lowercase().as_str() {
        "server-port" => Ok(BucketKey::ServerPort),
        "port-pair" => Ok(BucketKey::PortPair),
        "hash" => Ok(BucketKey::HashBucket(64)),
        other => Err(CliError::new(
            format!("unknown bucket key '{other}'"),
            Some("expected server-port, port-pair or hash".to_string()),
        )),
    }
}

fn cmd_two_capture_report(
    common: CommonOpts,
    dual: DualFileOpts,
    matching: MatchOpts,
    report: TwoCaptureReport,
) -> Result<(), CliError> {
    let format: ReportFormat = matching.format.parse().map_err(CliError::from_core)?;
    let profile: MatchProfile = matching.profile.parse().map_err(CliError::from_core)?;
    let bucket = parse_bucket(&matching.bucket)?;
    if !(0.0..=1.0).contains(&matching.threshold) {
        return Err(CliError::new(
            format!("threshold {} out of range", matching.threshold),
            Some("pass a value between 0.0 and 1.0".to_string()),
        ));
    }

    let (file_a, file_b) = require_two(resolve_inputs(&common, Some(&dual))?)?;
    if let (Some(id_a), Some(id_b)) = (dual.file1_pcapid, dual.file2_pcapid) {
        log::debug!("capture ids: {}={id_a}, {}={id_b}", file_a.display(), file_b.display());
    }

    let invoker = Invoker::new(ToolPaths::default());
    let connections_a =
        extract_connections(&invoker, &file_a).map_err(CliError::from_core)?;
    let connections_b =
        extract_connections(&invoker, &file_b).map_err(CliError::from_core)?;

    if connections_a.is_empty() || connections_b.is_empty() {
        warn_or_fail(
            common.strict,
            format!(
                "no TCP connections extracted ({}: {}, {}: {})",
                file_a.display(),
                connections_a.len(),
                file_b.display(),
                connections_b.len()
            ),
        )?;
    }

    let config = MatchConfig {
        profile,
        threshold: matching.threshold,
        mode: if matching.one_to_many {
            AssignmentMode::OneToMany
        } else {
            AssignmentMode::OneToOne
        },
        bucket,
        workers: common.workers,
    };
    let result =
        match_connections(&connections_a, &connections_b, &config).map_err(CliError::from_core)?;

    let body = match report {
        TwoCaptureReport::Match => diff::matched_connections_table(&result),
        TwoCaptureReport::Compare => diff::packet_difference_table(&result),
        TwoCaptureReport::Streamdiff => diff::stream_difference_table(&result),
    };

    let target = match &common.output {
        Some(path) => ReportTarget::File(path.clone()),
        None => ReportTarget::Stdout,
    };
    write_report(
        &target,
        report.title(),
        &body,
        format,
        &ReportMeta::basic(report.meta_id()),
    )
    .map_err(CliError::from_core)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// topology
// ---------------------------------------------------------------------------

fn cmd_topology(common: CommonOpts, format: String) -> Result<(), CliError> {
    let format: ReportFormat = format.parse().map_err(CliError::from_core)?;
    let inputs = resolve_inputs(&common, None)?;

    let invoker = Invoker::new(ToolPaths::default());
    let mut captures: Vec<(String, Vec<TcpConnection>)> = Vec::new();
    for capture in &inputs {
        let label = capture
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("capture")
            .to_string();
        let connections =
            extract_connections(&invoker, capture).map_err(CliError::from_core)?;
        captures.push((label, connections));
    }

    let body = diff::topology_table(&captures);
    let target = match &common.output {
        Some(path) => ReportTarget::File(path.clone()),
        None => ReportTarget::Stdout,
    };
    write_report(
        &target,
        "Topology",
        &body,
        format,
        &ReportMeta::basic("topology"),
    )
    .map_err(CliError::from_core)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// comparative-analysis
// ---------------------------------------------------------------------------

fn cmd_comparative_analysis(
    common: CommonOpts,
    dual: DualFileOpts,
    format: String,
) -> Result<(), CliError> {
    let format: ReportFormat = format.parse().map_err(CliError::from_core)?;
    let (file_a, file_b) = require_two(resolve_inputs(&common, Some(&dual))?)?;
    let output_dir = common
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(&[file_a.clone()], "comparative"));

    let invoker = Invoker::new(ToolPaths::default());
    let registry = ModuleRegistry::builtin();

    let run_side = |capture: &Path, side: &str| -> Result<Vec<ModuleOutcome>, CliError> {
        let detected =
            detect_protocols(&invoker, capture).map_err(CliError::from_core)?;
        let config = DispatchConfig {
            output_dir: output_dir.join(side),
            format,
            workers: common.workers,
        };
        dispatch(&invoker, &registry, capture, &detected, &config).map_err(CliError::from_core)
    };

    let outcomes_a = run_side(&file_a, "a")?;
    let outcomes_b = run_side(&file_b, "b")?;

    let label_a = file_a.display().to_string();
    let label_b = file_b.display().to_string();
    let body = diff::comparative_table(&label_a, &outcomes_a, &label_b, &outcomes_b);

    let primary = output_dir.join(format!("comparative-analysis.{}", format.extension()));
    write_report(
        &ReportTarget::File(primary),
        "Comparative analysis",
        &body,
        format,
        &ReportMeta::basic("comparative_analysis"),
    )
    .map_err(CliError::from_core)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

impl CliError {
    fn from_core(err: CoreError) -> Self {
        err.into()
    }
}

fn warn_or_fail(strict: bool, message: String) -> Result<(), CliError> {
    capsift_core::warn_or_strict(strict, message).map_err(CliError::from_core)
}
