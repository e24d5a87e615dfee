//! Error taxonomy shared by all CapSift components.
//!
//! Every fallible core API returns [`Result`]. Variants map one-to-one to
//! user-visible failure categories; [`Error::suggestion`] carries the
//! remediation hint the CLI prints on its `Suggestion:` line.

use std::path::PathBuf;

use log::warn;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("File not found: {path}")]
    InputNotFound { path: PathBuf },

    #[error("No capture files found in: {path}")]
    NoMatchingFiles { path: String },

    #[error("Need at least {required} capture files, found {found}")]
    InsufficientFiles { required: usize, found: usize },

    #[error("{tool} command not found")]
    ToolNotFound { tool: String, env_var: String },

    #[error("{tool} failed with exit code {code}: {stderr}")]
    ToolExecution {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("Capture metadata error for {path}: {reason}")]
    CaptureMetadata { path: PathBuf, reason: String },

    #[error("Cannot use output directory {path}: {reason}")]
    OutputDirectory { path: PathBuf, reason: String },

    #[error("No protocols detected in: {path}")]
    NoProtocolsDetected { path: PathBuf },

    #[error("Strict mode violation: {message}")]
    Strict { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Remediation hint for the CLI's `Suggestion:` line, when one exists.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::Config { .. } => None,
            Error::InputNotFound { .. } => {
                Some("Please check that the file exists and the path is correct.".to_string())
            }
            Error::NoMatchingFiles { .. } => Some(
                "Please ensure the location contains .pcap or .pcapng files.".to_string(),
            ),
            Error::InsufficientFiles { required, .. } => Some(format!(
                "Please provide at least {required} capture files for this operation."
            )),
            Error::ToolNotFound { tool, env_var } => Some(format!(
                "Please install Wireshark tools and/or set {env_var} to the full path of the \
                 {tool} binary:\n  macOS:  brew install wireshark\n  Ubuntu: sudo apt install \
                 tshark\n  Verify: which {tool}"
            )),
            Error::ToolExecution { .. } => Some(
                "Please verify that the capture file is valid and that the tool supports the \
                 requested options."
                    .to_string(),
            ),
            Error::ToolTimeout { .. } => Some(
                "Consider increasing the timeout or using smaller capture files.".to_string(),
            ),
            Error::CaptureMetadata { .. } => Some(
                "Ensure the file is a valid capture and the metadata tool is functional."
                    .to_string(),
            ),
            Error::OutputDirectory { .. } => Some(
                "Please check directory permissions or specify a different output directory."
                    .to_string(),
            ),
            Error::NoProtocolsDetected { .. } => Some(
                "The capture file may be empty or corrupted. Please verify the file contents."
                    .to_string(),
            ),
            Error::Strict { .. } => {
                Some("Fix the warning or run without --strict to ignore.".to_string())
            }
            Error::Io(_) => None,
        }
    }
}

/// Either log `message` as a warning or, in strict mode, fail with it.
///
/// All strict-mode downgrade points route through this helper so the
/// behaviour stays uniform across components.
pub fn warn_or_strict(strict: bool, message: impl Into<String>) -> Result<()> {
    let message = message.into();
    if strict {
        return Err(Error::Strict { message });
    }
    warn!("{message}");
    Ok(())
}
