//! Runtime compilation of kernel sources.
//!
//! This module provides:
//! - The [`Toolchain`] seam over the external runtime compiler (NVRTC with
//!   the `cuda` feature, [`crate::mock::MockToolchain`] otherwise)
//! - [`KernelCompiler`], which feeds resolved sources to a toolchain, answers
//!   its include requests and turns failures into [`CompileError`]s
//! - [`ArtifactStore`], the persistent on-disk artifact cache

mod diagnostics;
#[cfg(feature = "cuda")]
mod nvrtc;
mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::TargetArch;
use crate::error::{CompileError, LoaderError, Result};
use crate::fingerprint::ToolchainIdentity;
use crate::request::{KernelRequest, MAIN_PROGRAM_NAME};
use crate::resolve::{source_text, ResolvedDependency, ResolvedSource, SourceResolver};

pub use diagnostics::{missing_include, parse_diagnostics};
#[cfg(feature = "cuda")]
pub use nvrtc::NvrtcToolchain;
pub use store::{ArtifactStore, ArtifactStoreStats};

/// Flags applied to every compilation unless the configuration overrides them.
pub const DEFAULT_FLAGS: &[&str] = &[
    "-std=c++17",
    "--use_fast_math",
    "--generate-line-info",
    "-D__NVCC__=1",
    "-DCUDA_NO_HOST=1",
];

/// Binary format of a compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// PTX text, JIT-compiled by the driver at load time.
    Ptx,
    /// Device machine code.
    Cubin,
}

impl ArtifactFormat {
    /// File extension used in the artifact store.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Ptx => "ptx",
            ArtifactFormat::Cubin => "cubin",
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Toolchain output for one fingerprint. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    /// Raw image bytes, exactly as the driver consumes them.
    pub image: Vec<u8>,
    /// Image format.
    pub format: ArtifactFormat,
    /// Target architecture, e.g. `sm_80`.
    pub arch: String,
    /// Entry expression to lowered symbol name.
    pub entries: BTreeMap<String, String>,
    /// Constant variable name to lowered symbol name.
    pub constants: BTreeMap<String, String>,
}

/// Everything a toolchain needs for one compilation.
#[derive(Debug)]
pub struct CompileJob<'a> {
    /// Name of the top-level program, used in diagnostics.
    pub program_name: &'a str,
    /// Top-level source, as submitted.
    pub source: &'a [u8],
    /// Headers known up front, as `(include name, content)`.
    pub headers: &'a [(String, Vec<u8>)],
    /// Compiler options, excluding the architecture.
    pub options: &'a [String],
    /// Target architecture.
    pub arch: TargetArch,
    /// Name expressions whose lowered names are needed.
    pub name_expressions: &'a [String],
}

/// Answers include requests raised by a toolchain during one compilation.
pub trait IncludeCallback {
    /// Returns the content of `name`, included from `includer`, or `None`.
    fn include(&mut self, name: &str, includer: Option<&str>) -> Option<Vec<u8>>;
}

/// Successful toolchain output.
#[derive(Debug, Clone)]
pub struct ToolchainOutput {
    /// Image bytes.
    pub image: Vec<u8>,
    /// Image format.
    pub format: ArtifactFormat,
    /// Name expression to lowered name.
    pub lowered_names: BTreeMap<String, String>,
    /// Info log (warnings), possibly empty.
    pub log: String,
}

/// Failed toolchain invocation.
#[derive(Debug, Clone)]
pub struct ToolchainFailure {
    /// Error log as produced by the toolchain.
    pub log: String,
}

/// An external runtime compiler.
pub trait Toolchain: Send + Sync {
    /// Name and version; part of every fingerprint.
    fn identity(&self) -> ToolchainIdentity;

    /// Compiles one program.
    fn compile(
        &self,
        job: &CompileJob<'_>,
        includes: &mut dyn IncludeCallback,
    ) -> std::result::Result<ToolchainOutput, ToolchainFailure>;
}

/// Result of a successful [`KernelCompiler::compile`].
#[derive(Debug, Clone)]
pub struct Compilation {
    /// The artifact.
    pub artifact: CompiledArtifact,
    /// Includes the toolchain asked for that the eager scan had not seen.
    ///
    /// Non-empty means the fingerprint does not cover everything the
    /// artifact was built from.
    pub extra_dependencies: Vec<ResolvedDependency>,
}

/// Adapter between resolved sources and a [`Toolchain`].
#[derive(Clone)]
pub struct KernelCompiler {
    toolchain: Arc<dyn Toolchain>,
    builtin_includes: Vec<String>,
    verbose: bool,
}

impl KernelCompiler {
    /// Creates a compiler. Names in `builtin_includes` are left to the
    /// toolchain's own search path.
    pub fn new(toolchain: Arc<dyn Toolchain>, builtin_includes: Vec<String>) -> Self {
        Self {
            toolchain,
            builtin_includes,
            verbose: false,
        }
    }

    /// Logs listings and toolchain output for every request, not only
    /// verbose ones.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Header names left to the toolchain's own search path.
    pub fn builtin_includes(&self) -> &[String] {
        &self.builtin_includes
    }

    /// Toolchain identity.
    pub fn identity(&self) -> ToolchainIdentity {
        self.toolchain.identity()
    }

    /// Compiles a request against its pre-resolved sources.
    ///
    /// Never retries: a failure is reported immediately as
    /// [`LoaderError::Compile`], or as [`LoaderError::SourceNotFound`] when
    /// the toolchain needed one of the scan's deferred includes.
    pub fn compile(
        &self,
        request: &KernelRequest,
        arch: TargetArch,
        flags: &[String],
        source: &ResolvedSource,
        resolver: &SourceResolver,
    ) -> Result<Compilation> {
        let program_name = match &request.source {
            crate::request::KernelSource::Named(name) => name.as_str(),
            crate::request::KernelSource::Text(_) => MAIN_PROGRAM_NAME,
        };

        let verbose = self.verbose || request.verbose;
        let mut name_expressions = request.entries.clone();
        name_expressions.extend(request.constants.iter().map(|c| format!("&{}", c)));

        if verbose {
            tracing::debug!(
                kernel = %request.label(),
                "Compiling {}:\n{}",
                program_name,
                numbered_listing(&source_text(&source.text))
            );
        }

        let headers = source.headers();
        let job = CompileJob {
            program_name,
            source: &source.text,
            headers: &headers,
            options: flags,
            arch,
            name_expressions: &name_expressions,
        };
        let mut session = IncludeSession {
            source,
            resolver,
            builtin_includes: &self.builtin_includes,
            extra: Vec::new(),
            missing: None,
            unreadable: None,
        };

        let started = std::time::Instant::now();
        let output = match self.toolchain.compile(&job, &mut session) {
            Ok(output) => output,
            Err(failure) => {
                if let Some(err) = session.unreadable.take() {
                    return Err(err);
                }
                let diagnostics = parse_diagnostics(&failure.log);
                let (missing, includer) = match session.missing.take() {
                    Some((name, includer)) => (Some(name), includer),
                    None => (missing_include(&failure.log), None),
                };

                // A deferred include turned out to be live.
                if let Some(name) = missing
                    .as_ref()
                    .filter(|name| source.deferred_includes.contains(name))
                {
                    tracing::error!(
                        kernel = %request.label(),
                        include = %name,
                        "No provider has a required include:\n{}",
                        failure.log
                    );
                    return Err(LoaderError::SourceNotFound {
                        name: name.clone(),
                        included_from: includer
                            .or_else(|| diagnostics.first().map(|d| d.file.clone())),
                        searched: resolver.search_order(),
                    });
                }

                let err = CompileError {
                    kernel: request.label(),
                    diagnostics,
                    missing_include: missing,
                    log: failure.log,
                };
                tracing::error!(
                    kernel = %err.kernel,
                    arch = %arch,
                    "Kernel compilation failed:\n{}",
                    err.log
                );
                return Err(LoaderError::Compile(err));
            }
        };

        tracing::info!(
            kernel = %request.label(),
            arch = %arch,
            size = output.image.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compiled kernel"
        );
        if verbose && !output.log.trim().is_empty() {
            tracing::debug!(kernel = %request.label(), "Toolchain log:\n{}", output.log);
        }

        let lowered = |expr: &str| {
            output
                .lowered_names
                .get(expr)
                .cloned()
                .unwrap_or_else(|| expr.trim_start_matches('&').to_string())
        };
        let entries = request
            .entries
            .iter()
            .map(|e| (e.clone(), lowered(e)))
            .collect();
        let constants = request
            .constants
            .iter()
            .map(|c| (c.clone(), lowered(&format!("&{}", c))))
            .collect();

        Ok(Compilation {
            artifact: CompiledArtifact {
                image: output.image,
                format: output.format,
                arch: arch.to_string(),
                entries,
                constants,
            },
            extra_dependencies: session.extra,
        })
    }
}

impl fmt::Debug for KernelCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCompiler")
            .field("toolchain", &self.toolchain.identity())
            .field("builtin_includes", &self.builtin_includes)
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// Include callback state for one compilation. Dropped when it returns.
struct IncludeSession<'a> {
    source: &'a ResolvedSource,
    resolver: &'a SourceResolver,
    builtin_includes: &'a [String],
    extra: Vec<ResolvedDependency>,
    missing: Option<(String, Option<String>)>,
    unreadable: Option<LoaderError>,
}

impl IncludeCallback for IncludeSession<'_> {
    fn include(&mut self, name: &str, includer: Option<&str>) -> Option<Vec<u8>> {
        let includer_provider = includer
            .and_then(|i| self.source.dependency(i, None))
            .map(|d| d.provider.as_str());

        if let Some(dep) = self.source.dependency(name, includer_provider) {
            return Some(dep.content.clone());
        }
        if let Some(dep) = self.extra.iter().find(|d| d.name == name) {
            return Some(dep.content.clone());
        }
        if self.builtin_includes.iter().any(|b| b == name) {
            return None;
        }

        match self.resolver.resolve(name) {
            Ok(Some(hit)) => {
                tracing::warn!(
                    include = %name,
                    provider = %hit.provider,
                    "Toolchain requested an include the scan did not find"
                );
                self.extra.push(ResolvedDependency {
                    name: name.to_string(),
                    provider: hit.provider,
                    content: hit.content.clone(),
                    included_from: includer.map(str::to_string),
                });
                Some(hit.content)
            }
            Ok(None) => {
                if self.missing.is_none() {
                    self.missing = Some((name.to_string(), includer.map(str::to_string)));
                }
                None
            }
            Err(err) => {
                if self.unreadable.is_none() {
                    self.unreadable = Some(err);
                }
                None
            }
        }
    }
}

/// Source with `[00001]`-style line numbers, for verbose logs.
pub fn numbered_listing(source: &str) -> String {
    let mut out = String::with_capacity(source.len() + source.len() / 4);
    for (index, line) in source.lines().enumerate() {
        out.push_str(&format!("[{:05}] {}\n", index + 1, line));
    }
    out
}
