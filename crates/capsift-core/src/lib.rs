//! CapSift core library for capture-file cleanup and correlation.
//!
//! This crate exposes the pipeline used by the CLI and tests: an invoker
//! shells out to the Wireshark command-line tools for field extraction and
//! capture editing, a metadata service reads packet counts and time ranges
//! with an explicit fallback path, and the higher layers build on those:
//! the preprocess pipeline (time alignment, deduplication, one-way stream
//! removal, archival), the analysis module registry and dispatcher, and the
//! cross-capture TCP connection matcher.
//!
//! Key guarantees:
//! - Preprocess outputs stay positionally aligned with their inputs.
//! - Report and match outputs are deterministic and stable across runs.
//! - Module and report files are written atomically, each with a
//!   `.meta.json` sidecar.
//!
//! # Examples
//! ```no_run
//! use std::path::Path;
//!
//! use capsift_core::connections::extract_connections;
//! use capsift_core::matching::{MatchConfig, match_connections};
//! use capsift_core::tools::{Invoker, ToolPaths};
//!
//! let invoker = Invoker::new(ToolPaths::default());
//! let a = extract_connections(&invoker, Path::new("hop1.pcap"))?;
//! let b = extract_connections(&invoker, Path::new("hop2.pcap"))?;
//! let result = match_connections(&a, &b, &MatchConfig::default())?;
//! println!("matched {} pairs", result.pairs.len());
//! # Ok::<(), capsift_core::Error>(())
//! ```

pub mod analyze;
pub mod connections;
pub mod diff;
mod error;
pub mod matching;
pub mod metadata;
pub mod oneway;
pub mod preprocess;
pub mod report;
pub mod tools;

pub use error::{Error, Result, warn_or_strict};

/// Capture file extensions accepted as inputs.
pub const CAPTURE_EXTENSIONS: [&str; 2] = ["pcap", "pcapng"];

/// Whether a path looks like a capture file by extension.
pub fn is_capture_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            CAPTURE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
