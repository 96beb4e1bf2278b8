//! Content fingerprints over a kernel's full compilation inputs.
//!
//! A [`Fingerprint`] is a SHA-256 digest over a length-prefixed, tagged
//! encoding of:
//! - the cache format version and the toolchain identity
//! - the entry and constant expressions
//! - the top-level source text and where it came from
//! - the compile flags (in submitted order) and the target architecture
//! - every resolved dependency, sorted by `(logical name, provider)`
//! - header names left to the toolchain's own search path
//!
//! Sorting the dependency set makes the digest independent of the order in
//! which includes were discovered.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::request::KernelRequest;
use crate::resolve::ResolvedSource;

/// Current cache format version. Increment to invalidate all cached entries.
pub const CACHE_VERSION: u32 = 1;

/// Fixed-width digest identifying one compilation's input closure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Wraps raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, used for on-disk file names.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }

    /// Computes the fingerprint of a request against its resolved sources.
    pub fn compute(
        request: &KernelRequest,
        flags: &[String],
        source: &ResolvedSource,
        toolchain: &ToolchainIdentity,
    ) -> Self {
        let mut fp = FingerprintBuilder::new();
        fp.u32("version", CACHE_VERSION);
        fp.str("toolchain", &toolchain.name);
        fp.str("toolchain-version", &toolchain.version);

        fp.list("entries", &request.entries);
        fp.list("constants", &request.constants);

        fp.str("origin", &source.origin);
        fp.bytes("source", &source.text);

        fp.list("flags", flags);
        fp.str("arch", &request.arch);

        let mut deps: Vec<_> = source.dependencies.iter().collect();
        deps.sort_by(|a, b| (&a.name, &a.provider).cmp(&(&b.name, &b.provider)));
        fp.u32("dependencies", deps.len() as u32);
        for dep in deps {
            fp.str("dep-name", &dep.name);
            fp.str("dep-provider", &dep.provider);
            fp.bytes("dep-content", &dep.content);
        }

        let mut builtins: Vec<_> = source.builtin_includes.iter().collect();
        builtins.sort();
        builtins.dedup();
        fp.list("builtins", builtins);

        let mut deferred: Vec<_> = source.deferred_includes.iter().collect();
        deferred.sort();
        deferred.dedup();
        fp.list("deferred", deferred);

        fp.finish()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(format!("expected 64 hex characters, got '{}'", s));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| format!("invalid hex in '{}': {}", s, e))?;
        }
        Ok(Self(bytes))
    }
}

/// Name and version of the toolchain that produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainIdentity {
    /// Toolchain name (e.g. `nvrtc`).
    pub name: String,
    /// Toolchain version string.
    pub version: String,
}

impl fmt::Display for ToolchainIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Incremental, unambiguous encoder feeding a SHA-256 hasher.
///
/// Every field is written as `tag | len | bytes` so that no two distinct
/// field sequences can produce the same byte stream.
struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn bytes(&mut self, tag: &str, bytes: &[u8]) {
        self.hasher.update((tag.len() as u64).to_le_bytes());
        self.hasher.update(tag.as_bytes());
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    fn str(&mut self, tag: &str, value: &str) {
        self.bytes(tag, value.as_bytes());
    }

    fn u32(&mut self, tag: &str, value: u32) {
        self.bytes(tag, &value.to_le_bytes());
    }

    fn list<I, S>(&mut self, tag: &str, items: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items: Vec<S> = items.into_iter().collect();
        self.u32(tag, items.len() as u32);
        for item in &items {
            self.str(tag, item.as_ref());
        }
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}
