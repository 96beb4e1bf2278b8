//! Runtime Kernel Loader for RingKernel
//!
//! Compiles device kernels from source at runtime and caches the results.
//!
//! # Features
//!
//! - Content fingerprints over source, every resolved include, flags,
//!   architecture and toolchain version
//! - In-process module index plus an on-disk artifact store shared between
//!   processes (atomic write-then-rename)
//! - At most one compile per fingerprint, without a global lock
//! - Pluggable include providers (filesystem roots, embedded headers)
//! - Typed errors for missing sources, compile failures, driver rejections
//!   and cache I/O
//!
//! The NVRTC toolchain and CUDA driver backends need the `cuda` feature. The
//! [`mock`] backends run the whole pipeline on hosts without a GPU.
//!
//! # Example
//!
//! ```ignore
//! use ringkernel_loader::{KernelLoader, KernelRequest, KernelSource, LoaderConfig};
//!
//! let loader = KernelLoader::cuda(0, LoaderConfig::default())?;
//! let request = KernelRequest::new(
//!     "add",
//!     KernelSource::text(r#"
//!         #include <ringkernel/loader.cuh>
//!         extern "C" __global__ void add(float* c, const float* a, const float* b, int n) {
//!             int i = ringkernel::global_thread_id_x();
//!             if (i < n) c[i] = a[i] + b[i];
//!         }
//!     "#),
//!     "sm_80",
//! )
//! .with_flag("-O3");
//!
//! let kernel = loader.get_kernel(&request)?;
//! println!("block size: {}", kernel.best_block_size());
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod compile;
pub mod config;
pub mod device;
pub mod error;
pub mod fingerprint;
pub mod loader;
pub mod mock;
pub mod request;
pub mod resolve;

pub use cache::{CacheStats, KernelCache, KernelHandle};
pub use compile::{
    ArtifactFormat, ArtifactStore, ArtifactStoreStats, CompiledArtifact, KernelCompiler,
    Toolchain, DEFAULT_FLAGS,
};
pub use config::LoaderConfig;
pub use device::{
    DeviceDriver, DeviceGlobal, DeviceInfo, DriverStatus, KernelFunction, LaunchConfig,
    LoadedModule, ModuleLoader, TargetArch,
};
pub use error::{
    CacheIoError, CompileError, DeviceLoadError, DeviceLoadErrorKind, Diagnostic, LoaderError,
    Result, Severity,
};
pub use fingerprint::{Fingerprint, ToolchainIdentity, CACHE_VERSION};
pub use loader::KernelLoader;
pub use request::{main_file, KernelRequest, KernelSource};
pub use resolve::{
    EmbeddedProvider, FilesystemProvider, IncludeProvider, ProviderKind, Resolution,
    SourceResolver,
};

#[cfg(feature = "cuda")]
pub use compile::NvrtcToolchain;
#[cfg(feature = "cuda")]
pub use device::CudaDriver;

/// Check if CUDA is available at runtime.
///
/// Returns false if the `cuda` feature is disabled, the CUDA libraries are
/// not installed, or no device is present.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Get CUDA device count.
///
/// Returns 0 if CUDA is not available or libraries are not installed.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        // cudarc panics if CUDA libraries are not found, so we catch that
        std::panic::catch_unwind(|| {
            cudarc::driver::CudaContext::device_count().unwrap_or(0) as usize
        })
        .unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_cuda_unavailable_without_feature() {
        assert!(!is_cuda_available());
        assert_eq!(cuda_device_count(), 0);
    }
}
