//! Analysis dispatcher: protocol detection and per-module execution.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::report::{self, ReportFormat, ReportMeta};
use crate::tools::{Invoker, ToolKind};

use super::registry::ModuleRegistry;

/// Dispatcher settings for one capture.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub output_dir: PathBuf,
    pub format: ReportFormat,
    pub workers: usize,
}

/// Per-module dispatch result.
#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub module: &'static str,
    /// Written output path on success.
    pub output: Option<PathBuf>,
    /// Failure description when the module was skipped.
    pub error: Option<String>,
}

impl ModuleOutcome {
    pub fn succeeded(&self) -> bool {
        self.output.is_some()
    }
}

/// Detect the protocols present in a capture.
///
/// Runs one protocol-hierarchy pass and extracts the lowercased protocol
/// tokens. An empty token set is an error: the capture is unusable for
/// protocol-conditional analysis.
pub fn detect_protocols(invoker: &Invoker, capture: &Path) -> Result<BTreeSet<String>> {
    let args = vec![
        "-r".to_string(),
        capture.display().to_string(),
        "-q".to_string(),
        "-z".to_string(),
        "io,phs".to_string(),
    ];
    let output = invoker.invoke(ToolKind::Tshark, &args)?;
    let tokens = parse_protocol_tokens(&output.stdout);
    if tokens.is_empty() {
        return Err(Error::NoProtocolsDetected {
            path: capture.to_path_buf(),
        });
    }
    Ok(tokens)
}

/// Extract protocol tokens from protocol-hierarchy output.
///
/// Each statistics line starts with a protocol name followed by
/// `frames:`/`bytes:` counters; header and separator lines carry neither.
pub fn parse_protocol_tokens(output: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for line in output.lines() {
        if !line.contains("frames:") {
            continue;
        }
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        if token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            tokens.insert(token.to_ascii_lowercase());
        }
    }
    tokens
}

/// Run every eligible module against `capture`.
///
/// Modules execute independently, up to `workers` at a time. A missing
/// extractor aborts the whole dispatch; per-module execution failures are
/// recorded and the remaining modules continue. Outputs are written
/// atomically with a `.meta.json` sidecar each.
pub fn dispatch(
    invoker: &Invoker,
    registry: &ModuleRegistry,
    capture: &Path,
    detected: &BTreeSet<String>,
    config: &DispatchConfig,
) -> Result<Vec<ModuleOutcome>> {
    let eligible = registry.executable(detected);
    info!(
        "dispatching {} of {} modules for {}",
        eligible.len(),
        registry.len(),
        capture.display()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.max(1).min(eligible.len().max(1)))
        .thread_name(|i| format!("capsift-analyze-{i}"))
        .build()
        .map_err(|err| Error::Config {
            reason: format!("failed to build worker pool: {err}"),
        })?;

    let results: Vec<Result<ModuleOutcome>> = pool.install(|| {
        eligible
            .par_iter()
            .map(|module| run_module(invoker, *module, capture, config))
            .collect()
    });

    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        outcomes.push(result?);
    }
    Ok(outcomes)
}

fn run_module(
    invoker: &Invoker,
    module: &dyn super::AnalysisModule,
    capture: &Path,
    config: &DispatchConfig,
) -> Result<ModuleOutcome> {
    let mut args = vec!["-r".to_string(), capture.display().to_string()];
    args.extend(module.build_args(capture));

    let output = match invoker.invoke(ToolKind::Tshark, &args) {
        Ok(output) => output,
        // No extractor means no module can run; abort the dispatch.
        Err(err @ Error::ToolNotFound { .. }) => return Err(err),
        Err(err) => {
            warn!("module {} failed: {err}", module.name());
            return Ok(ModuleOutcome {
                module: module.name(),
                output: None,
                error: Some(err.to_string()),
            });
        }
    };

    let processed = module.post_process(&output.stdout, config.format);
    let rendered = report::render(module.name(), &processed, config.format);

    let out_path = module_output_path(&config.output_dir, capture, module.suffix(), config.format);
    report::write_atomic(&out_path, rendered.as_bytes())?;
    report::write_meta_sidecar(&out_path, &ReportMeta::basic(module.name()))?;

    Ok(ModuleOutcome {
        module: module.name(),
        output: Some(out_path),
        error: None,
    })
}

/// Output path for one module: `<output_dir>/<stem>-<suffix>.<ext>`.
fn module_output_path(
    output_dir: &Path,
    capture: &Path,
    suffix: &str,
    format: ReportFormat,
) -> PathBuf {
    let stem = capture
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("capture");
    output_dir.join(format!("{stem}-{suffix}.{}", format.extension()))
}
