//! CUDA driver backend.
//!
//! Modules are loaded directly through the driver API (`cuModuleLoadDataEx`,
//! `cuModuleGetFunction`, `cuModuleGetGlobal`) rather than through cudarc's
//! `CudaModule`, so raw handles and JIT logs stay available.

use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::ptr;
use std::sync::Arc;

use cudarc::driver::result::DriverError;
use cudarc::driver::sys as cuda_sys;
use cudarc::driver::CudaContext;

use crate::error::{DeviceLoadError, DeviceLoadErrorKind};

use super::{
    DeviceDriver, DeviceGlobal, DeviceInfo, DevicePtr, DriverResult, DriverStatus, FunctionHandle,
    LaunchConfig, ModuleHandle, Occupancy,
};

/// Size of the JIT error log buffer passed to `cuModuleLoadDataEx`.
const JIT_LOG_SIZE: usize = 8192;

fn status_of(result: cuda_sys::CUresult) -> DriverStatus {
    let err = DriverError(result);
    let name = err
        .error_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| format!("{:?}", result));
    let description = err
        .error_string()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    DriverStatus::new(result as i32, name, description)
}

fn check(result: cuda_sys::CUresult) -> DriverResult<()> {
    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(status_of(result))
    }
}

fn symbol_name(name: &str) -> DriverResult<CString> {
    CString::new(name).map_err(|_| status_of(cuda_sys::CUresult::CUDA_ERROR_INVALID_VALUE))
}

/// Driver bound to one CUDA context.
pub struct CudaDriver {
    context: Arc<CudaContext>,
    info: DeviceInfo,
}

impl CudaDriver {
    /// Creates (or retains) the primary context of device `ordinal`.
    pub fn new(ordinal: usize) -> std::result::Result<Self, DeviceLoadError> {
        let context_error = |what: &str, e: DriverError| DeviceLoadError {
            kind: DeviceLoadErrorKind::InvalidContext,
            status: Some(status_of(e.0)),
            message: format!("{} for CUDA device {}", what, ordinal),
        };

        let context = CudaContext::new(ordinal)
            .map_err(|e| context_error("failed to create context", e))?;
        let name = context
            .name()
            .map_err(|e| context_error("failed to query name", e))?;
        let (major, minor) = context
            .compute_capability()
            .map_err(|e| context_error("failed to query compute capability", e))?;

        Ok(Self {
            context,
            info: DeviceInfo {
                ordinal,
                name,
                compute_capability: (major as u32, minor as u32),
            },
        })
    }

    /// The underlying cudarc context.
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }
}

impl fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDriver").field("device", &self.info).finish()
    }
}

impl DeviceDriver for CudaDriver {
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn bind_current(&self) -> DriverResult<()> {
        self.context.bind_to_thread().map_err(|e| status_of(e.0))
    }

    fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        // PTX must be NUL-terminated for the driver.
        let owned: Vec<u8>;
        let image = if image.last() == Some(&0) {
            image
        } else {
            owned = image.iter().copied().chain(std::iter::once(0)).collect();
            &owned[..]
        };

        let mut log = vec![0u8; JIT_LOG_SIZE];
        let mut options = [
            cuda_sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER,
            cuda_sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
        ];
        let mut values = [
            log.as_mut_ptr() as *mut c_void,
            JIT_LOG_SIZE as *mut c_void,
        ];

        let mut module: cuda_sys::CUmodule = ptr::null_mut();
        let result = unsafe {
            cuda_sys::cuModuleLoadDataEx(
                &mut module,
                image.as_ptr() as *const c_void,
                options.len() as u32,
                options.as_mut_ptr(),
                values.as_mut_ptr(),
            )
        };

        if result != cuda_sys::CUresult::CUDA_SUCCESS {
            let mut status = status_of(result);
            let jit_log = CStr::from_bytes_until_nul(&log)
                .map(|s| s.to_string_lossy().trim().to_string())
                .unwrap_or_default();
            if !jit_log.is_empty() {
                status.description = format!("{}\n{}", status.description, jit_log);
            }
            return Err(status);
        }

        Ok(ModuleHandle(module as usize as u64))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle> {
        let name = symbol_name(name)?;
        let mut func: cuda_sys::CUfunction = ptr::null_mut();
        check(unsafe {
            cuda_sys::cuModuleGetFunction(
                &mut func,
                module.0 as usize as cuda_sys::CUmodule,
                name.as_ptr(),
            )
        })?;
        Ok(FunctionHandle(func as usize as u64))
    }

    fn get_global(&self, module: ModuleHandle, name: &str) -> DriverResult<DeviceGlobal> {
        let name = symbol_name(name)?;
        let mut dptr: cuda_sys::CUdeviceptr = 0;
        let mut size: usize = 0;
        check(unsafe {
            cuda_sys::cuModuleGetGlobal_v2(
                &mut dptr,
                &mut size,
                module.0 as usize as cuda_sys::CUmodule,
                name.as_ptr() as *const c_char,
            )
        })?;
        Ok(DeviceGlobal {
            ptr: DevicePtr(dptr as u64),
            size,
        })
    }

    fn occupancy(&self, function: FunctionHandle) -> DriverResult<Occupancy> {
        let mut min_grid_size = 0;
        let mut block_size = 0;
        check(unsafe {
            cuda_sys::cuOccupancyMaxPotentialBlockSize(
                &mut min_grid_size,
                &mut block_size,
                function.0 as usize as cuda_sys::CUfunction,
                None,
                0,
                0,
            )
        })?;
        Ok(Occupancy {
            min_grid_size: min_grid_size.max(0) as u32,
            block_size: block_size.max(0) as u32,
        })
    }

    fn unload_module(&self, module: ModuleHandle) -> DriverResult<()> {
        check(unsafe { cuda_sys::cuModuleUnload(module.0 as usize as cuda_sys::CUmodule) })
    }

    fn copy_to_device(&self, dst: DevicePtr, bytes: &[u8]) -> DriverResult<()> {
        check(unsafe {
            cuda_sys::cuMemcpyHtoD_v2(
                dst.0 as cuda_sys::CUdeviceptr,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
            )
        })
    }

    unsafe fn launch(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        let (gx, gy, gz) = config.grid_dim;
        let (bx, by, bz) = config.block_dim;
        check(cuda_sys::cuLaunchKernel(
            function.0 as usize as cuda_sys::CUfunction,
            gx,
            gy,
            gz,
            bx,
            by,
            bz,
            config.shared_mem_bytes,
            ptr::null_mut(),
            params.as_mut_ptr(),
            ptr::null_mut(),
        ))
    }
}
