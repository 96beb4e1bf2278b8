//! Embedded (compiled-in) include provider.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;

use super::{IncludeProvider, ProviderKind};

/// Headers shipped with this crate, embedded at compile time.
pub const BUNDLED_HEADERS: &[(&str, &str)] = &[(
    "ringkernel/loader.cuh",
    include_str!("../../include/ringkernel/loader.cuh"),
)];

/// Builds a static `(name, content)` table from files next to the invoking
/// source file.
///
/// ```ignore
/// static KERNELS: &[(&str, &str)] = ringkernel_loader::embed_sources! {
///     "axpy.cuh" => "kernels/axpy.cuh",
///     "unary.cuh" => "kernels/unary.cuh",
/// };
/// let provider = EmbeddedProvider::new("kernels", KERNELS);
/// ```
#[macro_export]
macro_rules! embed_sources {
    ($($name:literal => $path:literal),* $(,)?) => {
        &[$(($name, include_str!($path))),*]
    };
}

/// Read-only, in-memory resource table.
#[derive(Debug, Clone)]
pub struct EmbeddedProvider {
    id: String,
    files: BTreeMap<String, Cow<'static, str>>,
}

impl EmbeddedProvider {
    /// Creates a provider over a static table.
    pub fn new(name: &str, files: &'static [(&'static str, &'static str)]) -> Self {
        Self {
            id: format!("embedded:{}", name),
            files: files
                .iter()
                .map(|(n, c)| (normalize(n), Cow::Borrowed(*c)))
                .collect(),
        }
    }

    /// Creates a provider from owned entries, e.g. generated headers.
    pub fn from_entries<I>(name: &str, files: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            id: format!("embedded:{}", name),
            files: files
                .into_iter()
                .map(|(n, c)| (normalize(&n), Cow::Owned(c)))
                .collect(),
        }
    }

    /// The headers bundled with this crate.
    pub fn bundled() -> Self {
        Self::new("ringkernel", BUNDLED_HEADERS)
    }

    /// Logical names served, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.replace('\\', "/").trim_start_matches("./").to_string()
}

impl IncludeProvider for EmbeddedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Embedded
    }

    fn try_resolve(&self, name: &str) -> io::Result<Option<Cow<'_, [u8]>>> {
        Ok(self
            .files
            .get(&normalize(name))
            .map(|c| Cow::Borrowed(c.as_bytes())))
    }
}
