//! Capture metadata service: packet counts and time ranges.
//!
//! The primary path asks the metadata tool for its machine-readable table
//! output; when that fails the service falls back to a per-frame timestamp
//! extraction and reduces to min/max. The fallback is reported explicitly
//! through [`TimeRangeOutcome`] rather than being hidden behind the result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::tools::{Invoker, ToolKind, field_extraction_args};

/// First/last packet timestamps in seconds since the Unix epoch.
///
/// `first_ts <= last_ts` holds for every non-empty capture; an empty capture
/// reports `first_ts == last_ts == 0.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub first_ts: f64,
    pub last_ts: f64,
}

impl TimeRange {
    pub fn duration(&self) -> f64 {
        self.last_ts - self.first_ts
    }
}

/// How a time range was obtained.
#[derive(Debug, Clone)]
pub enum TimeRangeOutcome {
    /// The metadata tool answered directly.
    Primary(TimeRange),
    /// The metadata tool failed; per-frame extraction produced the range.
    Fallback {
        range: TimeRange,
        primary_error: String,
    },
}

impl TimeRangeOutcome {
    pub fn range(&self) -> TimeRange {
        match self {
            TimeRangeOutcome::Primary(range) => *range,
            TimeRangeOutcome::Fallback { range, .. } => *range,
        }
    }

    pub fn used_fallback(&self) -> bool {
        matches!(self, TimeRangeOutcome::Fallback { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CachedStats {
    range: Option<TimeRange>,
    count: Option<u64>,
}

/// Per-run metadata reader with an internal read-mostly cache.
///
/// Each capture is interrogated at most once per statistic per run; repeated
/// lookups (the preprocess report asks for every file twice) hit the cache.
#[derive(Debug)]
pub struct MetadataService {
    invoker: Invoker,
    cache: Mutex<HashMap<PathBuf, CachedStats>>,
}

impl MetadataService {
    pub fn new(invoker: Invoker) -> Self {
        Self {
            invoker,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// First/last packet timestamps for `capture`.
    ///
    /// Falls back to per-frame extraction iff the primary path raises a
    /// `CaptureMetadata` error; tool resolution and execution errors from
    /// the fallback propagate as-is.
    pub fn time_range(&self, capture: &Path) -> Result<TimeRangeOutcome> {
        if let Some(range) = self.cached(capture, |stats| stats.range) {
            return Ok(TimeRangeOutcome::Primary(range));
        }

        let outcome = match self.time_range_primary(capture) {
            Ok(range) => TimeRangeOutcome::Primary(range),
            Err(err @ Error::CaptureMetadata { .. }) => {
                warn!(
                    "metadata tool failed for {}; falling back to frame extraction: {err}",
                    capture.display()
                );
                let range = self.time_range_fallback(capture)?;
                TimeRangeOutcome::Fallback {
                    range,
                    primary_error: err.to_string(),
                }
            }
            Err(err) => return Err(err),
        };

        self.store(capture, |stats| stats.range = Some(outcome.range()));
        Ok(outcome)
    }

    /// Packet count for `capture`; SI-suffixed counts (`156 k`) are expanded.
    pub fn packet_count(&self, capture: &Path) -> Result<u64> {
        if let Some(count) = self.cached(capture, |stats| stats.count) {
            return Ok(count);
        }

        let args = vec!["-c".to_string(), capture.display().to_string()];
        let output = self.invoker.invoke(ToolKind::Capinfos, &args)?;
        let count = parse_packet_count(&output.stdout, capture)?;
        self.store(capture, |stats| stats.count = Some(count));
        Ok(count)
    }

    fn time_range_primary(&self, capture: &Path) -> Result<TimeRange> {
        let args = vec![
            "-T".to_string(),
            "-m".to_string(),
            "-Q".to_string(),
            "-r".to_string(),
            "-S".to_string(),
            capture.display().to_string(),
        ];
        let output = self.invoker.invoke(ToolKind::Capinfos, &args)?;
        parse_time_range_table(&output.stdout, capture)
    }

    fn time_range_fallback(&self, capture: &Path) -> Result<TimeRange> {
        let args = field_extraction_args(capture, &["frame.time_epoch"], '\t', None);
        let mut first: Option<f64> = None;
        let mut last: Option<f64> = None;
        self.invoker
            .invoke_streaming(ToolKind::Tshark, &args, |line| {
                let Ok(ts) = line.trim().parse::<f64>() else {
                    return;
                };
                first = Some(first.map_or(ts, |cur| cur.min(ts)));
                last = Some(last.map_or(ts, |cur| cur.max(ts)));
            })?;

        debug!(
            "frame-extraction time range for {}: {:?}..{:?}",
            capture.display(),
            first,
            last
        );
        match (first, last) {
            (Some(first_ts), Some(last_ts)) => Ok(TimeRange { first_ts, last_ts }),
            // Empty capture: a zero-width range, not an error.
            _ => Ok(TimeRange {
                first_ts: 0.0,
                last_ts: 0.0,
            }),
        }
    }

    fn cached<T>(&self, capture: &Path, get: impl Fn(&CachedStats) -> Option<T>) -> Option<T> {
        let cache = self.cache.lock().expect("metadata cache poisoned");
        cache.get(capture).and_then(get)
    }

    fn store(&self, capture: &Path, set: impl FnOnce(&mut CachedStats)) {
        let mut cache = self.cache.lock().expect("metadata cache poisoned");
        set(cache.entry(capture.to_path_buf()).or_default());
    }
}

/// Index of the earliest-timestamp column in the metadata table output.
const TABLE_FIRST_TS_INDEX: usize = 11;
/// Index of the latest-timestamp column in the metadata table output.
const TABLE_LAST_TS_INDEX: usize = 12;

fn parse_time_range_table(output: &str, capture: &Path) -> Result<TimeRange> {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let Some(line) = lines.last() else {
        return Err(Error::CaptureMetadata {
            path: capture.to_path_buf(),
            reason: "metadata tool produced no output".to_string(),
        });
    };

    let parts: Vec<&str> = line
        .split(',')
        .map(|p| p.trim().trim_matches('"'))
        .collect();
    if parts.len() <= TABLE_LAST_TS_INDEX {
        return Err(Error::CaptureMetadata {
            path: capture.to_path_buf(),
            reason: format!("unexpected table output: {line:?}"),
        });
    }

    let parse = |value: &str| -> Result<f64> {
        value.parse::<f64>().map_err(|_| Error::CaptureMetadata {
            path: capture.to_path_buf(),
            reason: format!("unparseable timestamp field: {value:?}"),
        })
    };
    let first_ts = parse(parts[TABLE_FIRST_TS_INDEX])?;
    let last_ts = parse(parts[TABLE_LAST_TS_INDEX])?;
    Ok(TimeRange { first_ts, last_ts })
}

fn parse_packet_count(output: &str, capture: &Path) -> Result<u64> {
    for line in output.lines() {
        if !line.contains("Number of packets") {
            continue;
        }
        let Some((_, value)) = line.split_once(':') else {
            continue;
        };
        let raw = value.trim().replace(',', "");
        if raw.is_empty() {
            continue;
        }

        let mut tokens = raw.split_whitespace();
        let mut num_token = tokens.next().unwrap_or("").to_string();
        let suffix_token = tokens.next().unwrap_or("");

        // SI suffix either as a separate token ("156 k") or glued on ("156k").
        let mut suffix = suffix_token.chars().next().unwrap_or('\0');
        if suffix == '\0' {
            if let Some(last) = num_token.chars().last() {
                if !last.is_ascii_digit() {
                    suffix = last;
                    num_token.pop();
                }
            }
        }

        let multiplier: u64 = match suffix.to_ascii_lowercase() {
            'k' => 1_000,
            'm' => 1_000_000,
            'g' => 1_000_000_000,
            _ => 1,
        };

        return num_token
            .parse::<f64>()
            .map(|base| (base * multiplier as f64) as u64)
            .map_err(|_| Error::CaptureMetadata {
                path: capture.to_path_buf(),
                reason: format!("unparseable packet count line: {line:?}"),
            });
    }

    Err(Error::CaptureMetadata {
        path: capture.to_path_buf(),
        reason: "output did not contain a packet count line".to_string(),
    })
}
