//! Per-protocol statistical analysis.
//!
//! Analysis modules are small descriptors: a name, an output suffix, the
//! protocols they need, an argument builder for the field extractor, and a
//! pure post-processor over the raw tool output. The registry is built once
//! at startup; the dispatcher consults each module's protocol requirements
//! against the capture's detected protocols and runs the eligible ones
//! independently, in parallel, with atomic output writes.

mod dispatch;
mod modules;
mod registry;

pub use dispatch::{DispatchConfig, ModuleOutcome, detect_protocols, dispatch, parse_protocol_tokens};
pub use registry::{AnalysisModule, ModuleRegistry};

pub(crate) use modules::register_builtin_modules;
