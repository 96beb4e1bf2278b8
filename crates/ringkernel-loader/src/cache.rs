//! Kernel cache.
//!
//! Three tiers: the in-process index of loaded modules, the on-disk artifact
//! store, and the compiler. A request walks them in that order and the first
//! tier that answers wins.
//!
//! Compilation is serialized per fingerprint only. The first caller to miss
//! takes the fingerprint's in-flight slot; later callers for the same
//! fingerprint block on that slot and then find the module in the index.
//! Callers for other fingerprints never touch the slot.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::compile::{ArtifactFormat, ArtifactStore, KernelCompiler};
use crate::device::{
    DeviceGlobal, KernelFunction, LaunchConfig, LoadedModule, ModuleLoader, TargetArch,
};
use crate::error::{
    CacheIoError, CompileError, DeviceLoadError, DeviceLoadErrorKind, LoaderError, Result,
};
use crate::fingerprint::Fingerprint;
use crate::request::KernelRequest;
use crate::resolve::{scan_sources, ResolvedSource, SourceResolver};

/// Counters describing how requests were served.
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    compilations: AtomicU64,
    disk_writes: AtomicU64,
    corrupt_recoveries: AtomicU64,
    persistence_failures: AtomicU64,
}

impl CacheStats {
    /// Create zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests answered from the in-process index.
    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(AtomicOrdering::Relaxed)
    }

    /// Requests answered from the on-disk store.
    pub fn disk_hits(&self) -> u64 {
        self.disk_hits.load(AtomicOrdering::Relaxed)
    }

    /// Successful compiler invocations.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(AtomicOrdering::Relaxed)
    }

    /// Artifacts written to the on-disk store.
    pub fn disk_writes(&self) -> u64 {
        self.disk_writes.load(AtomicOrdering::Relaxed)
    }

    /// Corrupted on-disk artifacts discarded and rebuilt.
    pub fn corrupt_recoveries(&self) -> u64 {
        self.corrupt_recoveries.load(AtomicOrdering::Relaxed)
    }

    /// Artifacts that could not be persisted.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(AtomicOrdering::Relaxed)
    }

    /// Fraction of requests served without compiling.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits() + self.disk_hits();
        let total = hits + self.compilations();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Per-fingerprint guards for compiles in progress.
///
/// A slot remembers the compile error of its holder so that callers queued on
/// the same fingerprint fail the same way instead of compiling again.
#[derive(Default)]
struct InflightCompiles {
    slots: Mutex<HashMap<Fingerprint, Arc<Mutex<Option<CompileError>>>>>,
}

impl InflightCompiles {
    fn slot(&self, fingerprint: Fingerprint) -> InflightSlot<'_> {
        let slot = Arc::clone(self.slots.lock().entry(fingerprint).or_default());
        InflightSlot {
            arena: self,
            fingerprint,
            slot: Some(slot),
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

struct InflightSlot<'a> {
    arena: &'a InflightCompiles,
    fingerprint: Fingerprint,
    slot: Option<Arc<Mutex<Option<CompileError>>>>,
}

impl InflightSlot<'_> {
    fn lock(&self) -> Option<MutexGuard<'_, Option<CompileError>>> {
        self.slot.as_ref().map(|slot| slot.lock())
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // Reference counts only change under the arena lock.
        let mut slots = self.arena.slots.lock();
        drop(self.slot.take());
        if slots
            .get(&self.fingerprint)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.fingerprint);
        }
    }
}

/// Handle to one entry of a loaded module.
///
/// Cheap to clone. The module stays resident while any handle to it exists,
/// even after [`KernelCache::release`].
#[derive(Clone)]
pub struct KernelHandle {
    module: Arc<LoadedModule>,
    function: Arc<KernelFunction>,
}

impl KernelHandle {
    fn new(
        module: Arc<LoadedModule>,
        entry: &str,
    ) -> std::result::Result<Self, DeviceLoadError> {
        let function = module.shared_function(entry).ok_or_else(|| {
            DeviceLoadError::new(
                DeviceLoadErrorKind::MissingSymbol(entry.to_string()),
                format!("module {} has no entry '{}'", module.fingerprint().short(), entry),
            )
        })?;
        Ok(Self { module, function })
    }

    /// The function for this handle's entry.
    pub fn function(&self) -> &KernelFunction {
        &self.function
    }

    /// Entry expression.
    pub fn entry(&self) -> &str {
        self.function.entry()
    }

    /// Handle to another entry of the same module.
    pub fn with_entry(&self, entry: &str) -> Option<KernelHandle> {
        let function = self.module.shared_function(entry)?;
        Some(Self {
            module: Arc::clone(&self.module),
            function,
        })
    }

    /// The loaded module.
    pub fn module(&self) -> &Arc<LoadedModule> {
        &self.module
    }

    /// Fingerprint of the module.
    pub fn fingerprint(&self) -> Fingerprint {
        self.module.fingerprint()
    }

    /// Whether both handles refer to the same loaded module.
    pub fn same_module(&self, other: &KernelHandle) -> bool {
        Arc::ptr_eq(&self.module, &other.module)
    }

    /// Device address and size of a constant variable.
    pub fn constant(&self, name: &str) -> Option<DeviceGlobal> {
        self.module.constant(name)
    }

    /// Copies `bytes` into a constant variable of the module.
    pub fn fill_constant(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.module.fill_constant(name, bytes)
    }

    /// Block size that maximizes occupancy.
    pub fn best_block_size(&self) -> u32 {
        self.function.best_block_size()
    }

    /// Launches the entry.
    ///
    /// # Safety
    ///
    /// Same contract as [`KernelFunction::launch`].
    pub unsafe fn launch(
        &self,
        config: &LaunchConfig,
        params: &mut [*mut c_void],
    ) -> std::result::Result<(), DeviceLoadError> {
        self.function.launch(config, params)
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("entry", &self.entry())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Everything needed to serve a request, computed before touching any cache.
struct Prepared {
    arch: TargetArch,
    flags: Vec<String>,
    resolver: SourceResolver,
    source: ResolvedSource,
    fingerprint: Fingerprint,
}

/// Fingerprint-keyed cache of loaded modules for one device context.
pub struct KernelCache {
    compiler: KernelCompiler,
    modules: ModuleLoader,
    store: ArtifactStore,
    default_flags: Vec<String>,
    index: RwLock<HashMap<Fingerprint, Arc<LoadedModule>>>,
    inflight: InflightCompiles,
    stats: CacheStats,
}

impl KernelCache {
    /// Creates a cache. `default_flags` precede every request's own flags.
    pub fn new(
        compiler: KernelCompiler,
        modules: ModuleLoader,
        store: ArtifactStore,
        default_flags: Vec<String>,
    ) -> Self {
        Self {
            compiler,
            modules,
            store,
            default_flags,
            index: RwLock::new(HashMap::new()),
            inflight: InflightCompiles::default(),
            stats: CacheStats::new(),
        }
    }

    /// Fingerprint a request would be cached under.
    pub fn fingerprint(
        &self,
        request: &KernelRequest,
        resolver: &SourceResolver,
    ) -> Result<Fingerprint> {
        Ok(self.prepare(request, resolver)?.fingerprint)
    }

    fn prepare(&self, request: &KernelRequest, resolver: &SourceResolver) -> Result<Prepared> {
        let arch = request.validate()?;
        // PTX is the most permissive format: if it cannot run, nothing can.
        self.modules.check_arch(&arch, ArtifactFormat::Ptx)?;

        let mut flags = self.default_flags.clone();
        flags.extend(request.flags.iter().cloned());

        let resolver = resolver.with_request_roots(&request.include_dirs);
        let source = scan_sources(&request.source, &resolver, self.compiler.builtin_includes())?;
        let fingerprint =
            Fingerprint::compute(request, &flags, &source, &self.compiler.identity());

        Ok(Prepared {
            arch,
            flags,
            resolver,
            source,
            fingerprint,
        })
    }

    /// Returns the kernel for `request`, loading or compiling it on a miss.
    pub fn get_kernel(
        &self,
        request: &KernelRequest,
        resolver: &SourceResolver,
    ) -> Result<KernelHandle> {
        let prepared = self.prepare(request, resolver)?;
        let fingerprint = prepared.fingerprint;
        let entry = request.entries[0].as_str();

        if let Some(module) = self.lookup(&fingerprint) {
            CacheStats::bump(&self.stats.memory_hits);
            tracing::debug!(
                fingerprint = %fingerprint.short(),
                kernel = %request.label(),
                "Kernel cache hit"
            );
            return Ok(KernelHandle::new(module, entry)?);
        }

        let slot = self.inflight.slot(fingerprint);
        let mut guard = slot.lock();

        if let Some(err) = guard.as_deref().and_then(Option::as_ref) {
            return Err(LoaderError::Compile(err.clone()));
        }
        if let Some(module) = self.lookup(&fingerprint) {
            CacheStats::bump(&self.stats.memory_hits);
            tracing::debug!(
                fingerprint = %fingerprint.short(),
                kernel = %request.label(),
                "Kernel cache hit after waiting for compile"
            );
            return Ok(KernelHandle::new(module, entry)?);
        }

        if let Some(module) = self.load_from_disk(fingerprint)? {
            CacheStats::bump(&self.stats.disk_hits);
            let module = self.insert(fingerprint, module);
            return Ok(KernelHandle::new(module, entry)?);
        }

        tracing::debug!(
            fingerprint = %fingerprint.short(),
            kernel = %request.label(),
            "Kernel cache miss"
        );
        let compilation = match self.compiler.compile(
            request,
            prepared.arch,
            &prepared.flags,
            &prepared.source,
            &prepared.resolver,
        ) {
            Ok(compilation) => compilation,
            Err(err) => {
                if let LoaderError::Compile(compile) = &err {
                    if let Some(failed) = guard.as_deref_mut() {
                        *failed = Some(compile.clone());
                    }
                }
                return Err(err);
            }
        };
        CacheStats::bump(&self.stats.compilations);

        if !compilation.extra_dependencies.is_empty() {
            tracing::warn!(
                fingerprint = %fingerprint.short(),
                kernel = %request.label(),
                includes = ?compilation.extra_dependencies,
                "Toolchain pulled in includes the scan did not see; result will not be cached"
            );
            let module = self.modules.load(fingerprint, &compilation.artifact)?;
            return Ok(KernelHandle::new(Arc::new(module), entry)?);
        }

        match self.store.store(&fingerprint, &compilation.artifact) {
            Ok(true) => CacheStats::bump(&self.stats.disk_writes),
            Ok(false) => {}
            Err(e) => {
                CacheStats::bump(&self.stats.persistence_failures);
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Failed to persist compiled kernel"
                );
            }
        }

        let module = self.modules.load(fingerprint, &compilation.artifact)?;
        let module = self.insert(fingerprint, module);
        Ok(KernelHandle::new(module, entry)?)
    }

    /// Loads the stored artifact for `fingerprint`, discarding it if it is
    /// corrupt or the driver rejects its image.
    fn load_from_disk(&self, fingerprint: Fingerprint) -> Result<Option<LoadedModule>> {
        let artifact = match self.store.load(&fingerprint) {
            Ok(Some(artifact)) => artifact,
            Ok(None) => return Ok(None),
            Err(CacheIoError::Corrupted { path, reason }) => {
                CacheStats::bump(&self.stats.corrupt_recoveries);
                tracing::warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Discarded corrupted kernel artifact, recompiling"
                );
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Failed to read kernel cache, recompiling"
                );
                return Ok(None);
            }
        };

        match self.modules.load(fingerprint, &artifact) {
            Ok(module) => {
                tracing::debug!(
                    fingerprint = %fingerprint.short(),
                    "Loaded kernel from disk cache"
                );
                Ok(Some(module))
            }
            Err(e) if e.is_artifact_fault() => {
                CacheStats::bump(&self.stats.corrupt_recoveries);
                tracing::warn!(
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Driver rejected cached artifact, recompiling"
                );
                self.store.remove(&fingerprint);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<LoadedModule>> {
        self.index.read().get(fingerprint).cloned()
    }

    fn insert(&self, fingerprint: Fingerprint, module: LoadedModule) -> Arc<LoadedModule> {
        Arc::clone(
            self.index
                .write()
                .entry(fingerprint)
                .or_insert_with(|| Arc::new(module)),
        )
    }

    /// Whether a module for `fingerprint` is resident.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.index.read().contains_key(fingerprint)
    }

    /// Number of resident modules.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Whether no module is resident.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Number of fingerprints currently being compiled or loaded.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Drops every module from the index. Returns how many were dropped.
    ///
    /// Modules still referenced by a [`KernelHandle`] are unloaded when the
    /// last handle goes away.
    pub fn release(&self) -> usize {
        let released: Vec<_> = self.index.write().drain().collect();
        if !released.is_empty() {
            tracing::debug!(modules = released.len(), "Released kernel cache");
        }
        released.len()
    }

    /// Request counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The on-disk artifact store.
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// The module loader.
    pub fn modules(&self) -> &ModuleLoader {
        &self.modules
    }

    /// The compiler.
    pub fn compiler(&self) -> &KernelCompiler {
        &self.compiler
    }

    /// Flags prepended to every request.
    pub fn default_flags(&self) -> &[String] {
        &self.default_flags
    }
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("modules", &self.len())
            .field("inflight", &self.inflight.len())
            .field("store", &self.store)
            .field("stats", &self.stats)
            .finish()
    }
}
