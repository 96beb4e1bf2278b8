//! Kernel loader facade.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::{CacheStats, KernelCache, KernelHandle};
use crate::compile::{ArtifactStore, KernelCompiler, Toolchain};
use crate::config::LoaderConfig;
use crate::device::{DeviceDriver, DeviceInfo, ModuleLoader};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::request::KernelRequest;
use crate::resolve::{EmbeddedProvider, FilesystemProvider, IncludeProvider, SourceResolver};

/// Priority of include roots listed in [`LoaderConfig::include_dirs`].
///
/// The first listed root gets this priority, later roots one less each.
pub const CONFIG_INCLUDE_PRIORITY: i32 = 100;

/// Priority of the headers bundled with this crate.
pub const BUNDLED_PRIORITY: i32 = -100;

/// Compiles, caches and loads kernels for one device context.
///
/// Dropping the loader drops its cache; every module without an outstanding
/// [`KernelHandle`] is unloaded.
pub struct KernelLoader {
    config: LoaderConfig,
    resolver: RwLock<Arc<SourceResolver>>,
    cache: KernelCache,
}

impl KernelLoader {
    /// Creates a loader over a toolchain and a driver bound to one context.
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        driver: Arc<dyn DeviceDriver>,
        config: LoaderConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mut resolver = SourceResolver::new();
        for (i, dir) in config.include_dirs.iter().enumerate() {
            resolver.register(
                Arc::new(FilesystemProvider::new(dir)),
                CONFIG_INCLUDE_PRIORITY - i as i32,
            );
        }
        if config.bundled_headers {
            resolver.register(Arc::new(EmbeddedProvider::bundled()), BUNDLED_PRIORITY);
        }

        let store = config.artifact_store()?;
        let compiler = KernelCompiler::new(toolchain, config.builtin_includes.clone())
            .verbose(config.verbose);
        let cache = KernelCache::new(
            compiler,
            ModuleLoader::new(driver),
            store,
            config.default_flags.clone(),
        );

        tracing::debug!(
            device = %cache.modules().device().name,
            toolchain = %cache.compiler().identity(),
            providers = ?resolver.search_order(),
            cache_dir = %cache.store().cache_dir().display(),
            disk_cache = cache.store().is_enabled(),
            "Created kernel loader"
        );

        Ok(Self {
            config,
            resolver: RwLock::new(Arc::new(resolver)),
            cache,
        })
    }

    /// Creates a loader for CUDA device `ordinal` using NVRTC.
    #[cfg(feature = "cuda")]
    pub fn cuda(ordinal: usize, config: LoaderConfig) -> Result<Self> {
        let toolchain = crate::compile::NvrtcToolchain::new()?;
        let driver = crate::device::CudaDriver::new(ordinal)?;
        Self::new(Arc::new(toolchain), Arc::new(driver), config)
    }

    /// Registers an include provider. Higher priority is searched first.
    ///
    /// Replaces any provider with the same id. Requests already in progress
    /// keep the provider set they started with.
    pub fn register_provider(&self, provider: Arc<dyn IncludeProvider>, priority: i32) {
        let mut current = self.resolver.write();
        let mut resolver = SourceResolver::clone(&current);
        tracing::debug!(provider = %provider.id(), priority, "Registered include provider");
        resolver.register(provider, priority);
        *current = Arc::new(resolver);
    }

    /// Removes the provider with the given id. Returns whether one was removed.
    pub fn unregister_provider(&self, id: &str) -> bool {
        let mut current = self.resolver.write();
        let mut resolver = SourceResolver::clone(&current);
        let removed = resolver.unregister(id);
        if removed {
            tracing::debug!(provider = %id, "Unregistered include provider");
            *current = Arc::new(resolver);
        }
        removed
    }

    /// Provider ids in search order.
    pub fn search_order(&self) -> Vec<String> {
        self.resolver.read().search_order()
    }

    fn resolver(&self) -> Arc<SourceResolver> {
        Arc::clone(&self.resolver.read())
    }

    /// Returns the kernel for `request`, compiling it if nothing is cached.
    pub fn get_kernel(&self, request: &KernelRequest) -> Result<KernelHandle> {
        self.cache.get_kernel(request, &self.resolver())
    }

    /// Fingerprint `request` would be cached under, without compiling.
    pub fn fingerprint(&self, request: &KernelRequest) -> Result<Fingerprint> {
        self.cache.fingerprint(request, &self.resolver())
    }

    /// Drops every cached module. Returns how many were dropped.
    pub fn release(&self) -> usize {
        self.cache.release()
    }

    /// Number of resident modules.
    pub fn cached_modules(&self) -> usize {
        self.cache.len()
    }

    /// Number of fingerprints with a compile or load in progress.
    pub fn compiles_in_flight(&self) -> usize {
        self.cache.in_flight()
    }

    /// Request counters.
    pub fn stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// The on-disk artifact store.
    pub fn store(&self) -> &ArtifactStore {
        self.cache.store()
    }

    /// Device this loader targets.
    pub fn device(&self) -> &DeviceInfo {
        self.cache.modules().device()
    }

    /// Active configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

impl fmt::Debug for KernelLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLoader")
            .field("device", self.device())
            .field("providers", &self.search_order())
            .field("cache", &self.cache)
            .finish()
    }
}

impl Drop for KernelLoader {
    fn drop(&mut self) {
        let released = self.cache.release();
        tracing::debug!(modules = released, "Dropped kernel loader");
    }
}
