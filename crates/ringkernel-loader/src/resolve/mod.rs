//! Source resolution for kernel text and include directives.
//!
//! A [`SourceResolver`] holds an ordered set of [`IncludeProvider`]s. A bare
//! logical name is answered by the first provider (in search order) that has
//! it; nothing is merged across providers.
//!
//! # Search order
//!
//! 1. Per-request include roots, in the order given on the request.
//! 2. Registered providers by descending priority.
//! 3. On equal priority, filesystem providers before embedded ones, so local
//!    overrides win over bundled headers.
//! 4. On equal priority and kind, registration order.
//!
//! Content is raw bytes. A provider that has a file but fails to read it
//! stops the search with [`LoaderError::SourceUnreadable`]; it never falls
//! through to a lower-priority copy.

mod embedded;
mod filesystem;
mod scan;

use std::borrow::Cow;
use std::cmp::Reverse;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{LoaderError, Result};

pub use embedded::{EmbeddedProvider, BUNDLED_HEADERS};
pub use filesystem::FilesystemProvider;
pub use scan::{include_directives, scan_sources, IncludeDirective};

/// Lossy text view of source bytes, for directive scanning and listings.
pub fn source_text(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

/// Broad category of a provider, used to break priority ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProviderKind {
    /// Reads from a directory tree.
    Filesystem,
    /// Serves a compiled-in, read-only resource table.
    Embedded,
    /// Anything else.
    Other,
}

/// A source of header/source text, queried by logical name.
///
/// Implementations must be side-effect free from the loader's point of view
/// and must return the same content for the same name while a request is
/// being processed.
pub trait IncludeProvider: Send + Sync + fmt::Debug {
    /// Stable identity of this provider. Part of every fingerprint that uses
    /// content from it.
    fn id(&self) -> &str;

    /// Provider category.
    fn kind(&self) -> ProviderKind {
        ProviderKind::Other
    }

    /// Returns the content for `name`, or `None` if this provider does not
    /// have it. An error means the provider has `name` but cannot read it.
    fn try_resolve(&self, name: &str) -> io::Result<Option<Cow<'_, [u8]>>>;
}

/// Content returned by a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Id of the provider that answered.
    pub provider: String,
    /// File content.
    pub content: Vec<u8>,
}

#[derive(Clone)]
struct Registered {
    provider: Arc<dyn IncludeProvider>,
    priority: i32,
    pinned: bool,
    seq: u64,
}

impl Registered {
    fn sort_key(&self) -> (bool, Reverse<i32>, ProviderKind, u64) {
        (
            !self.pinned,
            Reverse(self.priority),
            self.provider.kind(),
            self.seq,
        )
    }
}

/// Ordered set of include providers.
#[derive(Clone, Default)]
pub struct SourceResolver {
    providers: Vec<Registered>,
    next_seq: u64,
}

impl SourceResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider. Higher priority is searched first.
    ///
    /// Registering a provider whose id is already present replaces it.
    pub fn register(&mut self, provider: Arc<dyn IncludeProvider>, priority: i32) {
        self.insert(provider, priority, false);
    }

    /// Removes the provider with the given id. Returns whether one was removed.
    pub fn unregister(&mut self, id: &str) -> bool {
        let before = self.providers.len();
        self.providers.retain(|r| r.provider.id() != id);
        self.providers.len() != before
    }

    /// Returns a copy with per-request filesystem roots searched first.
    pub fn with_request_roots(&self, roots: &[PathBuf]) -> Self {
        let mut resolver = self.clone();
        for root in roots {
            resolver.insert(Arc::new(FilesystemProvider::new(root)), 0, true);
        }
        resolver
    }

    fn insert(&mut self, provider: Arc<dyn IncludeProvider>, priority: i32, pinned: bool) {
        self.unregister(provider.id());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.providers.push(Registered {
            provider,
            priority,
            pinned,
            seq,
        });
        self.providers.sort_by_key(Registered::sort_key);
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider ids in search order.
    pub fn search_order(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|r| r.provider.id().to_string())
            .collect()
    }

    /// Searches all providers in order; the first hit wins.
    pub fn resolve(&self, name: &str) -> Result<Option<Resolution>> {
        for registered in &self.providers {
            if let Some(hit) = Self::ask(registered.provider.as_ref(), name)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Asks one specific provider.
    pub fn resolve_in(&self, provider_id: &str, name: &str) -> Result<Option<Resolution>> {
        match self.providers.iter().find(|r| r.provider.id() == provider_id) {
            Some(registered) => Self::ask(registered.provider.as_ref(), name),
            None => Ok(None),
        }
    }

    fn ask(provider: &dyn IncludeProvider, name: &str) -> Result<Option<Resolution>> {
        match provider.try_resolve(name) {
            Ok(content) => Ok(content.map(|content| Resolution {
                provider: provider.id().to_string(),
                content: content.into_owned(),
            })),
            Err(source) => {
                tracing::warn!(
                    include = %name,
                    provider = %provider.id(),
                    error = %source,
                    "Unable to read source"
                );
                Err(LoaderError::SourceUnreadable {
                    name: name.to_string(),
                    provider: provider.id().to_string(),
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceResolver")
            .field("search_order", &self.search_order())
            .finish()
    }
}

/// One include resolved while walking a request's sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    /// Logical name as written in the include directive.
    pub name: String,
    /// Id of the provider that supplied it.
    pub provider: String,
    /// Content.
    pub content: Vec<u8>,
    /// Logical name of the file that first included it.
    pub included_from: Option<String>,
}

/// The top-level text of a request plus its transitive includes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    /// Where the top-level text came from (`text` or `provider:name`).
    pub origin: String,
    /// Top-level text.
    pub text: Vec<u8>,
    /// Transitive includes, in discovery order.
    pub dependencies: Vec<ResolvedDependency>,
    /// Include names left to the toolchain's own search path.
    pub builtin_includes: Vec<String>,
    /// Include names no provider has. Possibly inside disabled conditional
    /// blocks; the toolchain decides whether they are needed.
    pub deferred_includes: Vec<String>,
}

impl ResolvedSource {
    /// Looks up a dependency by logical name, preferring `provider` if given.
    pub fn dependency(&self, name: &str, provider: Option<&str>) -> Option<&ResolvedDependency> {
        provider
            .and_then(|p| {
                self.dependencies
                    .iter()
                    .find(|d| d.name == name && d.provider == p)
            })
            .or_else(|| self.dependencies.iter().find(|d| d.name == name))
    }

    /// One `(name, content)` pair per distinct logical name, first discovery
    /// wins. This is the header table handed to toolchains that need all
    /// headers up front.
    pub fn headers(&self) -> Vec<(String, Vec<u8>)> {
        let mut seen = std::collections::HashSet::new();
        self.dependencies
            .iter()
            .filter(|d| seen.insert(d.name.as_str()))
            .map(|d| (d.name.clone(), d.content.clone()))
            .collect()
    }
}
