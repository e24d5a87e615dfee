//! Uniform report output.
//!
//! Every command-style operation writes through this module: a primary
//! output (file or stdout) and, for file outputs, a `<primary>.meta.json`
//! sidecar identifying the report kind. Markdown primaries start with a
//! `## <title>` heading and wrap fixed-width content in a fenced code block.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Output rendering for report bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Txt,
    Md,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Txt => "txt",
            ReportFormat::Md => "md",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "txt" => Ok(ReportFormat::Txt),
            "md" => Ok(ReportFormat::Md),
            other => Err(Error::Config {
                reason: format!("unknown report format '{other}' (expected txt or md)"),
            }),
        }
    }
}

/// Sidecar metadata identifying a report.
///
/// Consumers ignore unknown keys, so the schema is extensible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMeta {
    /// Stable report kind, e.g. `matched_connections`.
    pub id: String,
    /// Producing pipeline variant.
    pub source: String,
}

impl ReportMeta {
    /// Metadata for the basic (non-database) pipeline.
    pub fn basic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: "basic".to_string(),
        }
    }
}

/// Where a report's primary output goes.
#[derive(Debug, Clone)]
pub enum ReportTarget {
    Stdout,
    File(PathBuf),
}

/// Render a report body for the given format.
///
/// Markdown wraps the fixed-width body in a fenced code block under a
/// `## <title>` heading; plain text passes the body through unchanged.
pub fn render(title: &str, body: &str, format: ReportFormat) -> String {
    match format {
        ReportFormat::Txt => {
            let mut out = body.trim_end().to_string();
            out.push('\n');
            out
        }
        ReportFormat::Md => {
            format!("## {title}\n\n```\n{}\n```\n", body.trim_end())
        }
    }
}

/// Write a rendered report to its target.
///
/// File targets are written atomically and get a `.meta.json` sidecar;
/// stdout targets print the rendered body and have no sidecar. Returns the
/// primary path for file targets.
pub fn write_report(
    target: &ReportTarget,
    title: &str,
    body: &str,
    format: ReportFormat,
    meta: &ReportMeta,
) -> Result<Option<PathBuf>> {
    let rendered = render(title, body, format);
    match target {
        ReportTarget::Stdout => {
            print!("{rendered}");
            Ok(None)
        }
        ReportTarget::File(path) => {
            write_atomic(path, rendered.as_bytes())?;
            write_meta_sidecar(path, meta)?;
            Ok(Some(path.clone()))
        }
    }
}

/// Path of the sidecar for a given primary output.
pub fn meta_sidecar_path(primary: &Path) -> PathBuf {
    let mut name = primary.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

/// Write the `.meta.json` sidecar next to `primary`.
pub fn write_meta_sidecar(primary: &Path, meta: &ReportMeta) -> Result<()> {
    let json = serde_json::to_string(meta).map_err(|err| Error::Config {
        reason: format!("failed to serialize report metadata: {err}"),
    })?;
    write_atomic(&meta_sidecar_path(primary), json.as_bytes())
}

/// Write `content` to `path` via a temporary sibling and rename.
///
/// Either the full file exists at `path` or nothing does; readers never see
/// a partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        // Windows refuses to rename over an existing file.
        if path.exists() {
            fs::remove_file(path)?;
            fs::rename(&tmp_path, path)?;
        } else {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::Io(err));
        }
    }
    Ok(())
}
