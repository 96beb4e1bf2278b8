//! Device driver abstraction and module loading.
//!
//! [`DeviceDriver`] is the narrow driver surface the loader needs: binding
//! the owning context, loading a module image, looking up functions and
//! globals, occupancy queries and launches. Every call reports failure as a
//! [`DriverStatus`], which [`ModuleLoader`] turns into a typed
//! [`DeviceLoadError`].
//!
//! The CUDA implementation lives in [`cuda`] and is only built with the
//! `cuda` feature; [`crate::mock::MockDriver`] covers hosts without a GPU.

pub mod arch;
#[cfg(feature = "cuda")]
pub mod cuda;
mod module;

use std::ffi::c_void;
use std::fmt;

use crate::error::DeviceLoadErrorKind;

pub use arch::TargetArch;
#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;
pub use module::{KernelFunction, LoadedModule, ModuleLoader};

/// Driver status codes the loader distinguishes.
///
/// Values match `CUresult`.
pub mod status {
    /// Success.
    pub const SUCCESS: i32 = 0;
    /// Driver not initialized.
    pub const NOT_INITIALIZED: i32 = 3;
    /// Driver is shutting down.
    pub const DEINITIALIZED: i32 = 4;
    /// Malformed module image.
    pub const INVALID_IMAGE: i32 = 200;
    /// No valid context is current.
    pub const INVALID_CONTEXT: i32 = 201;
    /// No binary in the image runs on this device.
    pub const NO_BINARY_FOR_GPU: i32 = 209;
    /// PTX JIT compilation failed.
    pub const INVALID_PTX: i32 = 218;
    /// PTX version newer than the driver supports.
    pub const UNSUPPORTED_PTX_VERSION: i32 = 222;
    /// Named symbol not found.
    pub const NOT_FOUND: i32 = 500;
    /// Context was destroyed.
    pub const CONTEXT_IS_DESTROYED: i32 = 709;
}

/// A non-success status returned by a driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    /// Numeric status code.
    pub code: i32,
    /// Symbolic name, e.g. `CUDA_ERROR_INVALID_IMAGE`.
    pub name: String,
    /// Driver-provided description, possibly with JIT log output appended.
    pub description: String,
}

impl DriverStatus {
    /// Creates a status.
    pub fn new(code: i32, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            description: description.into(),
        }
    }

    /// Maps the status code onto a load failure category.
    pub fn classify(&self) -> DeviceLoadErrorKind {
        match self.code {
            status::NOT_INITIALIZED
            | status::DEINITIALIZED
            | status::INVALID_CONTEXT
            | status::CONTEXT_IS_DESTROYED => DeviceLoadErrorKind::InvalidContext,
            status::INVALID_IMAGE | status::INVALID_PTX | status::UNSUPPORTED_PTX_VERSION => {
                DeviceLoadErrorKind::InvalidImage
            }
            _ => DeviceLoadErrorKind::Driver,
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.code)?;
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

/// Result of a raw driver call.
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

/// Static information about the device a driver is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device ordinal.
    pub ordinal: usize,
    /// Device name.
    pub name: String,
    /// Compute capability as (major, minor).
    pub compute_capability: (u32, u32),
}

impl DeviceInfo {
    /// Real architecture of the device.
    pub fn arch(&self) -> TargetArch {
        TargetArch::sm(self.compute_capability.0, self.compute_capability.1)
    }
}

/// Opaque loaded-module handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Opaque function handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub u64);

/// Device memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// A global (constant) variable inside a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGlobal {
    /// Device address.
    pub ptr: DevicePtr,
    /// Size in bytes.
    pub size: usize,
}

/// Driver-suggested launch shape for a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occupancy {
    /// Minimum grid size needed for full occupancy.
    pub min_grid_size: u32,
    /// Block size that maximizes occupancy.
    pub block_size: u32,
}

/// Launch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Grid dimensions (number of blocks in x, y, z).
    pub grid_dim: (u32, u32, u32),
    /// Block dimensions (threads per block in x, y, z).
    pub block_dim: (u32, u32, u32),
    /// Dynamic shared memory per block in bytes.
    pub shared_mem_bytes: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            grid_dim: (1, 1, 1),
            block_dim: (256, 1, 1),
            shared_mem_bytes: 0,
        }
    }
}

impl LaunchConfig {
    /// One-dimensional launch covering `elements` with `block_size` threads per block.
    pub fn for_elements(elements: u64, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let blocks = elements.div_ceil(block_size as u64).max(1);
        Self {
            grid_dim: (blocks.min(u32::MAX as u64) as u32, 1, 1),
            block_dim: (block_size, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    /// Sets the dynamic shared memory size.
    #[must_use]
    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }
}

/// The driver operations the loader depends on.
///
/// Implementations are bound to one device context. Callers invoke
/// [`bind_current`](Self::bind_current) on the calling thread before any
/// other operation.
pub trait DeviceDriver: Send + Sync {
    /// Device this driver is bound to.
    fn device(&self) -> &DeviceInfo;

    /// Makes the owning context current on the calling thread.
    fn bind_current(&self) -> DriverResult<()>;

    /// Loads a module image (PTX text or cubin).
    fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle>;

    /// Looks up a function by lowered name.
    fn get_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle>;

    /// Looks up a global variable by lowered name.
    fn get_global(&self, module: ModuleHandle, name: &str) -> DriverResult<DeviceGlobal>;

    /// Queries the occupancy-maximizing block size.
    fn occupancy(&self, function: FunctionHandle) -> DriverResult<Occupancy>;

    /// Unloads a module.
    fn unload_module(&self, module: ModuleHandle) -> DriverResult<()>;

    /// Copies host bytes to device memory.
    fn copy_to_device(&self, dst: DevicePtr, bytes: &[u8]) -> DriverResult<()>;

    /// Launches a function.
    ///
    /// # Safety
    ///
    /// `params` must hold one valid pointer per kernel parameter, each
    /// pointing at a value of the type the kernel expects, and every device
    /// pointer passed must stay valid until the kernel completes.
    unsafe fn launch(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        params: &mut [*mut c_void],
    ) -> DriverResult<()>;
}
