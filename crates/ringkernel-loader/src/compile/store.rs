//! Persistent on-disk artifact cache.
//!
//! Every fingerprint maps to two files under the cache directory:
//! - `<fingerprint>.json`, a manifest with the lowered symbol names, format,
//!   architecture, image length and image SHA-256
//! - `<fingerprint>.ptx` (or `.cubin`), the raw image exactly as the driver
//!   consumes it
//!
//! Both are written to a unique temporary file and renamed into place. The
//! manifest is committed first and the image rename is the commit point: a
//! reader that finds no image sees a miss, and a reader that finds an image
//! always finds the manifest describing it. An entry whose manifest is
//! unreadable or does not match its image is corrupt; it is removed and
//! reported so the caller can recompile.
//!
//! # Cache Location
//!
//! Default: `~/.cache/ringkernel/kernels/`
//! Override: `RINGKERNEL_LOADER_CACHE_DIR` environment variable

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CacheIoError, CacheIoResult};
use crate::fingerprint::{Fingerprint, CACHE_VERSION};

use super::{ArtifactFormat, CompiledArtifact};

/// Environment variable overriding the default cache directory.
pub const CACHE_DIR_ENV: &str = "RINGKERNEL_LOADER_CACHE_DIR";

const MANIFEST_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    fingerprint: String,
    format: ArtifactFormat,
    arch: String,
    entries: BTreeMap<String, String>,
    constants: BTreeMap<String, String>,
    image_len: u64,
    image_sha256: String,
}

/// File-based artifact cache keyed by fingerprint.
///
/// Shared between processes; the write-then-rename protocol is the only
/// cross-process synchronization.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    /// Directory where artifacts are stored.
    cache_dir: PathBuf,
    /// Whether caching is enabled.
    enabled: bool,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::disabled())
    }
}

impl ArtifactStore {
    /// Creates a store in the default or environment-configured directory.
    pub fn new() -> CacheIoResult<Self> {
        Self::with_dir(Self::default_cache_dir())
    }

    /// Creates a store in a specific directory, creating it if needed.
    pub fn with_dir(cache_dir: impl Into<PathBuf>) -> CacheIoResult<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).map_err(|source| CacheIoError::CreateDirFailed {
                path: cache_dir.clone(),
                source,
            })?;
        }

        Ok(Self {
            cache_dir,
            enabled: true,
        })
    }

    /// Creates a disabled store; every lookup misses and writes are dropped.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            cache_dir: PathBuf::new(),
            enabled: false,
        }
    }

    /// Returns whether the store is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the cache directory path.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn manifest_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", fingerprint.to_hex(), MANIFEST_EXT))
    }

    fn image_path(&self, fingerprint: &Fingerprint, format: ArtifactFormat) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", fingerprint.to_hex(), format.extension()))
    }

    /// Whether a committed image exists for `fingerprint`.
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.enabled
            && [ArtifactFormat::Ptx, ArtifactFormat::Cubin]
                .iter()
                .any(|f| self.image_path(fingerprint, *f).is_file())
    }

    /// Loads the artifact for `fingerprint`.
    ///
    /// Returns `Ok(None)` on a miss. A corrupt entry is removed and reported
    /// as [`CacheIoError::Corrupted`].
    pub fn load(&self, fingerprint: &Fingerprint) -> CacheIoResult<Option<CompiledArtifact>> {
        if !self.enabled {
            return Ok(None);
        }

        let manifest_path = self.manifest_path(fingerprint);
        let manifest_bytes = match fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheIoError::ReadFailed {
                    path: manifest_path,
                    source,
                })
            }
        };

        let manifest: Manifest = match serde_json::from_slice(&manifest_bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                // Without a readable manifest we do not know the image format.
                if self.contains(fingerprint) {
                    return Err(self.corrupted(fingerprint, manifest_path, e.to_string()));
                }
                return Ok(None);
            }
        };

        let image_path = self.image_path(fingerprint, manifest.format);
        let image = match fs::read(&image_path) {
            Ok(bytes) => bytes,
            // Manifest committed, image not yet: a writer is mid-flight.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheIoError::ReadFailed {
                    path: image_path,
                    source,
                })
            }
        };

        if let Some(reason) = validate(&manifest, fingerprint, &image) {
            return Err(self.corrupted(fingerprint, image_path, reason));
        }

        tracing::debug!(
            path = %image_path.display(),
            size = image.len(),
            "Loaded cached artifact"
        );

        Ok(Some(CompiledArtifact {
            image,
            format: manifest.format,
            arch: manifest.arch,
            entries: manifest.entries,
            constants: manifest.constants,
        }))
    }

    fn corrupted(&self, fingerprint: &Fingerprint, path: PathBuf, reason: String) -> CacheIoError {
        self.remove(fingerprint);
        CacheIoError::Corrupted { path, reason }
    }

    /// Persists an artifact.
    ///
    /// Returns `Ok(false)` without writing when the store is disabled or the
    /// fingerprint is already committed: an artifact is written at most once.
    pub fn store(
        &self,
        fingerprint: &Fingerprint,
        artifact: &CompiledArtifact,
    ) -> CacheIoResult<bool> {
        if !self.enabled {
            return Ok(false);
        }

        let image_path = self.image_path(fingerprint, artifact.format);
        if image_path.is_file() {
            tracing::debug!(path = %image_path.display(), "Artifact already cached");
            return Ok(false);
        }

        let manifest = Manifest {
            version: CACHE_VERSION,
            fingerprint: fingerprint.to_hex(),
            format: artifact.format,
            arch: artifact.arch.clone(),
            entries: artifact.entries.clone(),
            constants: artifact.constants.clone(),
            image_len: artifact.image.len() as u64,
            image_sha256: sha256_hex(&artifact.image),
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| {
            CacheIoError::WriteFailed {
                path: self.manifest_path(fingerprint),
                source: std::io::Error::new(ErrorKind::InvalidData, e),
            }
        })?;

        self.write_atomic(&self.manifest_path(fingerprint), &manifest_bytes)?;
        self.write_atomic(&image_path, &artifact.image)?;

        tracing::debug!(
            path = %image_path.display(),
            size = artifact.image.len(),
            "Cached artifact"
        );

        Ok(true)
    }

    /// Writes to a unique temporary file, then renames it over `path`.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> CacheIoResult<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self.cache_dir.join(format!(
            ".{}.{}.{}.{}",
            file_name,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
            TMP_EXT
        ));

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp_path, path)
        };

        write().map_err(|source| {
            let _ = fs::remove_file(&temp_path);
            CacheIoError::WriteFailed {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Removes every file belonging to `fingerprint`. Best effort.
    pub fn remove(&self, fingerprint: &Fingerprint) {
        if !self.enabled {
            return;
        }
        // Image first, so no reader sees an image without its manifest.
        for format in [ArtifactFormat::Ptx, ArtifactFormat::Cubin] {
            let _ = fs::remove_file(self.image_path(fingerprint, format));
        }
        let _ = fs::remove_file(self.manifest_path(fingerprint));
    }

    /// Clears all cached artifacts.
    pub fn clear(&self) -> CacheIoResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let entries = fs::read_dir(&self.cache_dir).map_err(|source| CacheIoError::ReadFailed {
            path: self.cache_dir.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if is_store_file(&path) {
                let _ = fs::remove_file(path);
            }
        }

        Ok(())
    }

    /// Returns statistics about the store.
    #[must_use]
    pub fn stats(&self) -> ArtifactStoreStats {
        if !self.enabled {
            return ArtifactStoreStats::default();
        }

        let mut entries = 0;
        let mut bytes = 0;

        if let Ok(dir) = fs::read_dir(&self.cache_dir) {
            for entry in dir.flatten() {
                let path = entry.path();
                if is_image_file(&path) {
                    entries += 1;
                    if let Ok(metadata) = fs::metadata(&path) {
                        bytes += metadata.len();
                    }
                }
            }
        }

        ArtifactStoreStats {
            entries,
            bytes,
            cache_dir: self.cache_dir.clone(),
        }
    }

    /// Returns the default cache directory.
    pub fn default_cache_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            return PathBuf::from(dir);
        }

        #[cfg(target_os = "linux")]
        {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(".cache/ringkernel/kernels");
            }
        }

        #[cfg(target_os = "macos")]
        {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join("Library/Caches/ringkernel/kernels");
            }
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(local_app_data) = std::env::var("LOCALAPPDATA") {
                return PathBuf::from(local_app_data).join("ringkernel/kernels");
            }
        }

        std::env::temp_dir().join("ringkernel/kernels")
    }
}

fn validate(manifest: &Manifest, fingerprint: &Fingerprint, image: &[u8]) -> Option<String> {
    if manifest.version != CACHE_VERSION {
        return Some(format!(
            "cache version {} (expected {})",
            manifest.version, CACHE_VERSION
        ));
    }
    if manifest.fingerprint != fingerprint.to_hex() {
        return Some("manifest belongs to a different fingerprint".to_string());
    }
    if manifest.image_len != image.len() as u64 {
        return Some(format!(
            "image is {} bytes, manifest says {}",
            image.len(),
            manifest.image_len
        ));
    }
    if manifest.image_sha256 != sha256_hex(image) {
        return Some("image checksum mismatch".to_string());
    }
    None
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn is_image_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| {
        ext == ArtifactFormat::Ptx.extension() || ext == ArtifactFormat::Cubin.extension()
    })
}

fn is_store_file(path: &Path) -> bool {
    is_image_file(path) || path.extension().is_some_and(|ext| ext == MANIFEST_EXT || ext == TMP_EXT)
}

/// Statistics about the artifact store.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStoreStats {
    /// Number of committed artifacts.
    pub entries: usize,
    /// Total image size in bytes.
    pub bytes: u64,
    /// Cache directory path.
    pub cache_dir: PathBuf,
}

impl std::fmt::Display for ArtifactStoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Kernel cache: {} entries, {:.2} KB at {}",
            self.entries,
            self.bytes as f64 / 1024.0,
            self.cache_dir.display()
        )
    }
}
