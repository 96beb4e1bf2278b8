//! Kernel source requests.

use std::path::PathBuf;

use crate::device::arch::TargetArch;
use crate::error::{LoaderError, Result};

/// Name under which inline source text is handed to the toolchain.
///
/// Diagnostics for the submitted text point into this file.
pub const MAIN_PROGRAM_NAME: &str = "main.cu";

/// Where the top-level kernel text comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelSource {
    /// Inline source text.
    Text(String),
    /// Logical name resolved through the registered include providers.
    Named(String),
}

impl KernelSource {
    /// Inline source text.
    pub fn text(source: impl Into<String>) -> Self {
        KernelSource::Text(source.into())
    }

    /// Source resolved by logical name.
    pub fn named(name: impl Into<String>) -> Self {
        KernelSource::Named(name.into())
    }
}

/// Builds a one-line program that includes `name`.
///
/// Useful when the whole kernel lives in a header and only needs to be
/// instantiated by entry expression.
pub fn main_file(name: &str) -> String {
    format!("#include \"{}\"\n", name)
}

/// One compilation request.
///
/// Immutable once submitted; every field that changes the compiled output is
/// part of the request's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRequest {
    /// Entry expressions to extract, e.g. `add` or `AxpyKernel<int>`.
    pub entries: Vec<String>,
    /// Constant (global) variables whose device addresses are needed.
    pub constants: Vec<String>,
    /// Top-level source.
    pub source: KernelSource,
    /// Extra filesystem include roots, searched before registered providers.
    pub include_dirs: Vec<PathBuf>,
    /// Compiler flags, in order.
    pub flags: Vec<String>,
    /// Target architecture, e.g. `sm_80`.
    pub arch: String,
    /// Emit the numbered source listing and toolchain log at debug level.
    pub verbose: bool,
}

impl KernelRequest {
    /// Creates a request for a single entry.
    pub fn new(entry: impl Into<String>, source: KernelSource, arch: impl Into<String>) -> Self {
        Self {
            entries: vec![entry.into()],
            constants: Vec::new(),
            source,
            include_dirs: Vec::new(),
            flags: Vec::new(),
            arch: arch.into(),
            verbose: false,
        }
    }

    /// Adds another entry expression.
    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entries.push(entry.into());
        self
    }

    /// Requests the device address of a constant variable.
    #[must_use]
    pub fn with_constant(mut self, name: impl Into<String>) -> Self {
        self.constants.push(name.into());
        self
    }

    /// Appends a compiler flag.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Appends several compiler flags.
    #[must_use]
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Adds a per-request filesystem include root.
    #[must_use]
    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    /// Compiles with device debug information (`-G`).
    #[must_use]
    pub fn debug(self) -> Self {
        self.with_flag("-G")
    }

    /// Enables verbose compile logging.
    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Label used in logs and errors.
    pub fn label(&self) -> String {
        self.entries.join(", ")
    }

    /// Checks the request for structural problems before any work is done.
    pub fn validate(&self) -> Result<TargetArch> {
        if self.entries.is_empty() {
            return Err(LoaderError::Config(
                "kernel request has no entry symbols".to_string(),
            ));
        }
        if let Some(empty) = self.entries.iter().find(|e| e.trim().is_empty()) {
            return Err(LoaderError::Config(format!(
                "kernel request has an empty entry symbol: {:?}",
                empty
            )));
        }
        if let KernelSource::Named(name) = &self.source {
            if name.is_empty() {
                return Err(LoaderError::Config(
                    "kernel source name is empty".to_string(),
                ));
            }
        }
        self.arch.parse::<TargetArch>().map_err(LoaderError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_file() {
        assert_eq!(main_file("axpy.cuh"), "#include \"axpy.cuh\"\n");
    }

    #[test]
    fn test_builder() {
        let req = KernelRequest::new("AxpyKernel<int>", KernelSource::named("axpy.cu"), "sm_80")
            .with_entry("AxpyKernel<float>")
            .with_constant("c_data")
            .with_flags(["-O3", "-lineinfo"])
            .with_include_dir("/opt/kernels")
            .debug()
            .verbose();

        assert_eq!(req.entries.len(), 2);
        assert_eq!(req.flags, vec!["-O3", "-lineinfo", "-G"]);
        assert_eq!(req.constants, vec!["c_data"]);
        assert!(req.verbose);
        assert_eq!(req.label(), "AxpyKernel<int>, AxpyKernel<float>");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let mut req = KernelRequest::new("add", KernelSource::text("x"), "sm_80");
        req.entries.clear();
        assert!(matches!(req.validate(), Err(LoaderError::Config(_))));

        let req = KernelRequest::new("add", KernelSource::text("x"), "gfx90a");
        assert!(matches!(req.validate(), Err(LoaderError::Config(_))));

        let req = KernelRequest::new("add", KernelSource::named(""), "sm_80");
        assert!(req.validate().is_err());
    }
}
