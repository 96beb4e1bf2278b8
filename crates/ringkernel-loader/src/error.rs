//! Error types for kernel loading.
//!
//! Failures come from three independent subsystems (include resolution, the
//! runtime compiler, and the device driver) plus the on-disk artifact cache.
//! Each one gets a typed error here, and [`LoaderError`] folds them into the
//! single result type returned by [`KernelLoader::get_kernel`].
//!
//! [`KernelLoader::get_kernel`]: crate::KernelLoader::get_kernel

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::DriverStatus;

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Top-level loader error.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A logical include or the top-level source could not be resolved.
    #[error("Source not found: '{name}'{}", included_from_suffix(.included_from))]
    SourceNotFound {
        /// Logical name that failed to resolve.
        name: String,
        /// Logical name of the file containing the include directive.
        included_from: Option<String>,
        /// Provider ids that were searched, in search order.
        searched: Vec<String>,
    },

    /// A provider has the source but failed to read it.
    #[error("Failed to read source '{name}' from {provider}: {source}")]
    SourceUnreadable {
        /// Logical name being resolved.
        name: String,
        /// Id of the provider that failed.
        provider: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The toolchain rejected the source.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The driver rejected the compiled artifact or the context binding failed.
    #[error(transparent)]
    DeviceLoad(#[from] DeviceLoadError),

    /// Failure reading or writing the on-disk cache.
    #[error(transparent)]
    CacheIo(#[from] CacheIoError),

    /// Invalid request or loader configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn included_from_suffix(included_from: &Option<String>) -> String {
    match included_from {
        Some(parent) => format!(" (included from '{}')", parent),
        None => String::new(),
    }
}

impl LoaderError {
    /// Whether retrying the identical request could succeed.
    ///
    /// Always false for compile and device errors: a fingerprint that failed
    /// once fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoaderError::CacheIo(_) | LoaderError::SourceUnreadable { .. }
        )
    }
}

/// Severity of a single compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Hard error.
    Error,
    /// Warning.
    Warning,
    /// Informational remark.
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

/// A single diagnostic reported by the toolchain.
///
/// Line numbers refer to the file named in `file`. For the top-level program
/// that is the source exactly as submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// File the diagnostic points into.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column, when the toolchain reports one.
    pub column: Option<u32>,
    /// Severity.
    pub severity: Severity,
    /// Message text.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(
                f,
                "{}:{}:{}: {}: {}",
                self.file, self.line, column, self.severity, self.message
            ),
            None => write!(
                f,
                "{}:{}: {}: {}",
                self.file, self.line, self.severity, self.message
            ),
        }
    }
}

/// The toolchain rejected a kernel.
#[derive(Debug, Clone, Error)]
#[error("Failed to compile kernel '{kernel}': {}", compile_summary(.missing_include, .diagnostics, .log))]
pub struct CompileError {
    /// Entry expression(s) of the failed request, for context.
    pub kernel: String,
    /// Parsed diagnostics.
    pub diagnostics: Vec<Diagnostic>,
    /// Raw toolchain log.
    pub log: String,
    /// Include that could not be resolved while the toolchain was running.
    pub missing_include: Option<String>,
}

impl CompileError {
    /// Diagnostics with error severity.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }
}

fn compile_summary(
    missing_include: &Option<String>,
    diagnostics: &[Diagnostic],
    log: &str,
) -> String {
    if let Some(missing) = missing_include {
        return format!("cannot open include '{}'", missing);
    }
    match diagnostics.iter().find(|d| d.severity == Severity::Error) {
        Some(first) => first.to_string(),
        None => log
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("toolchain reported failure without a log")
            .to_string(),
    }
}

/// What went wrong while loading a module onto the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLoadErrorKind {
    /// The device context could not be made current or is no longer valid.
    InvalidContext,
    /// The artifact targets an architecture the active device cannot run.
    ArchitectureMismatch {
        /// Architecture the artifact was built for.
        artifact: String,
        /// Architecture of the active device.
        device: String,
    },
    /// The binary image is malformed or truncated.
    InvalidImage,
    /// A requested entry symbol or constant is absent from the module.
    MissingSymbol(String),
    /// Any other driver failure.
    Driver,
}

impl fmt::Display for DeviceLoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLoadErrorKind::InvalidContext => write!(f, "invalid device context"),
            DeviceLoadErrorKind::ArchitectureMismatch { artifact, device } => write!(
                f,
                "artifact built for {} cannot run on {} device",
                artifact, device
            ),
            DeviceLoadErrorKind::InvalidImage => write!(f, "invalid module image"),
            DeviceLoadErrorKind::MissingSymbol(name) => write!(f, "missing symbol '{}'", name),
            DeviceLoadErrorKind::Driver => write!(f, "driver error"),
        }
    }
}

/// The driver rejected a compiled artifact.
#[derive(Debug, Clone, Error)]
#[error("Device load failed ({kind}): {message}{}", status_suffix(.status))]
pub struct DeviceLoadError {
    /// Failure category.
    pub kind: DeviceLoadErrorKind,
    /// Raw driver status, when the failure came from a driver call.
    pub status: Option<DriverStatus>,
    /// Human-readable context.
    pub message: String,
}

fn status_suffix(status: &Option<DriverStatus>) -> String {
    match status {
        Some(s) => format!(" [{}]", s),
        None => String::new(),
    }
}

impl DeviceLoadError {
    /// Creates an error without an underlying driver status.
    pub fn new(kind: DeviceLoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Creates an error from a failed driver call, classifying the status code.
    pub fn from_status(status: DriverStatus, message: impl Into<String>) -> Self {
        Self {
            kind: status.classify(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Whether the artifact itself is at fault, so recompiling can fix it.
    pub fn is_artifact_fault(&self) -> bool {
        matches!(
            self.kind,
            DeviceLoadErrorKind::InvalidImage | DeviceLoadErrorKind::MissingSymbol(_)
        )
    }

    /// Device load errors are never retried automatically.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Error types for on-disk artifact cache operations.
#[derive(Debug, Error)]
pub enum CacheIoError {
    /// Failed to create cache directory.
    #[error("Failed to create cache directory {}: {source}", path.display())]
    CreateDirFailed {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to read a cached artifact.
    #[error("Failed to read cached artifact {}: {source}", path.display())]
    ReadFailed {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to write an artifact to the cache.
    #[error("Failed to write artifact to cache {}: {source}", path.display())]
    WriteFailed {
        /// File that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Cache entry is corrupted or invalid.
    #[error("Cache entry corrupted {}: {reason}", path.display())]
    Corrupted {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}

/// Result type for on-disk cache operations.
pub type CacheIoResult<T> = std::result::Result<T, CacheIoError>;
