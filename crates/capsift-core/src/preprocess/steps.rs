//! Preprocess step algebra: names, automatic ordering, and fusion.

use crate::error::{Error, Result};

use super::config::PreprocessConfig;

/// A preprocess pipeline step.
///
/// `TimeAlignDedup` is an internal optimisation only; it never appears in
/// user-facing step lists and is introduced by [`fuse_steps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ArchiveOriginal,
    TimeAlign,
    Dedup,
    Oneway,
    TimeAlignDedup,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::ArchiveOriginal => "archive-original",
            Step::TimeAlign => "time-align",
            Step::Dedup => "dedup",
            Step::Oneway => "oneway",
            Step::TimeAlignDedup => "time-align+dedup",
        }
    }

    /// Parse a user-supplied step name. The fused step is not accepted.
    pub fn parse(name: &str) -> Result<Step> {
        match name {
            "archive-original" => Ok(Step::ArchiveOriginal),
            "time-align" => Ok(Step::TimeAlign),
            "dedup" => Ok(Step::Dedup),
            "oneway" => Ok(Step::Oneway),
            other => Err(Error::Config {
                reason: format!(
                    "unknown preprocess step '{other}' (expected archive-original, time-align, \
                     dedup or oneway)"
                ),
            }),
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Step list for automatic mode: fixed order, filtered by the enable flags.
pub fn automatic_steps(config: &PreprocessConfig) -> Vec<Step> {
    let mut steps = Vec::new();
    if config.archive_original {
        steps.push(Step::ArchiveOriginal);
    }
    if config.time_align_enabled {
        steps.push(Step::TimeAlign);
    }
    if config.dedup_enabled {
        steps.push(Step::Dedup);
    }
    if config.oneway_enabled {
        steps.push(Step::Oneway);
    }
    steps
}

/// Fold each consecutive `time-align`+`dedup` pair into the combined step.
///
/// External semantics are unchanged; each affected file is scanned once
/// instead of twice.
pub fn fuse_steps(steps: &[Step]) -> Vec<Step> {
    let mut fused = Vec::with_capacity(steps.len());
    let mut i = 0;
    while i < steps.len() {
        if steps[i] == Step::TimeAlign && steps.get(i + 1) == Some(&Step::Dedup) {
            fused.push(Step::TimeAlignDedup);
            i += 2;
        } else {
            fused.push(steps[i]);
            i += 1;
        }
    }
    fused
}
