//! Analysis module contract and registry.

use std::collections::BTreeSet;
use std::path::Path;

use crate::report::ReportFormat;

/// Capability interface implemented by every analysis module.
///
/// `build_args` is pure: it returns the extractor arguments that follow
/// `-r <capture>` on the command line. `post_process` is pure in its inputs
/// and defaults to passing the raw tool output through.
pub trait AnalysisModule: Send + Sync {
    /// Stable module name, e.g. `protocol_hierarchy`.
    fn name(&self) -> &'static str;

    /// Output file suffix (without extension), e.g. `protocol-hierarchy`.
    fn suffix(&self) -> &'static str;

    /// Protocols required for this module to run; empty means always run.
    fn required_protocols(&self) -> &'static [&'static str] {
        &[]
    }

    /// Extractor arguments appended after `-r <capture>`.
    fn build_args(&self, capture: &Path) -> Vec<String>;

    /// Transform raw tool output into the report body.
    fn post_process(&self, raw: &str, _format: ReportFormat) -> String {
        raw.to_string()
    }

    /// A module runs when it has no requirements or any requirement is
    /// among the detected protocols.
    fn should_execute(&self, detected: &BTreeSet<String>) -> bool {
        let required = self.required_protocols();
        required.is_empty() || required.iter().any(|proto| detected.contains(*proto))
    }
}

/// Ordered collection of analysis modules.
///
/// Constructed once at startup; the dispatcher only reads it. Insertion
/// order is preserved and defines output ordering.
pub struct ModuleRegistry {
    modules: Vec<Box<dyn AnalysisModule>>,
}

impl ModuleRegistry {
    /// Empty registry, for callers composing their own module set.
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Registry populated with the built-in module catalogue.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        super::register_builtin_modules(&mut registry);
        registry
    }

    pub fn register(&mut self, module: Box<dyn AnalysisModule>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn AnalysisModule> {
        self.modules.iter().map(|m| m.as_ref())
    }

    /// Modules eligible to run for the given detected protocol set, in
    /// registration order.
    pub fn executable(&self, detected: &BTreeSet<String>) -> Vec<&dyn AnalysisModule> {
        self.iter().filter(|m| m.should_execute(detected)).collect()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
