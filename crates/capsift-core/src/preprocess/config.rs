//! Preprocess runtime configuration.
//!
//! Pipeline code depends only on [`PreprocessRuntimeConfig`]; nothing below
//! this layer reads the environment or CLI state after construction.

use std::path::PathBuf;

use crate::tools::ToolPaths;

/// Business configuration for the preprocess steps.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    // Step toggles (automatic mode).
    pub time_align_enabled: bool,
    pub dedup_enabled: bool,
    pub oneway_enabled: bool,
    pub archive_original: bool,
    pub archive_compress: bool,

    // Dedup parameters. `None` window means the editor tool's default.
    pub dedup_window_packets: Option<u32>,
    pub dedup_ignore_bytes: u32,

    // Oneway parameters.
    pub oneway_ack_threshold: u64,

    // Time-align parameters.
    pub time_align_allow_empty: bool,

    // Reporting.
    pub report_enabled: bool,
    pub report_path: Option<PathBuf>,

    // Performance.
    pub workers: usize,

    // Warnings become errors.
    pub strict: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            time_align_enabled: true,
            dedup_enabled: true,
            oneway_enabled: true,
            archive_original: false,
            archive_compress: true,
            dedup_window_packets: None,
            dedup_ignore_bytes: 0,
            oneway_ack_threshold: 20,
            time_align_allow_empty: false,
            report_enabled: true,
            report_path: None,
            workers: 4,
            strict: false,
        }
    }
}

/// Aggregated runtime configuration for one preprocess run.
#[derive(Debug, Clone, Default)]
pub struct PreprocessRuntimeConfig {
    pub tools: ToolPaths,
    pub preprocess: PreprocessConfig,
}
