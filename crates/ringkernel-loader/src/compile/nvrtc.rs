//! NVRTC toolchain.
//!
//! Drives NVRTC through the raw `cudarc::nvrtc::sys` bindings: the safe
//! cudarc wrappers do not expose headers, name expressions or lowered names.
//! NVRTC has no include callback, so headers are handed over up front and a
//! "cannot open source file" failure is answered by asking the include
//! callback and compiling again.

use std::collections::BTreeMap;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

use cudarc::nvrtc::sys as nvrtc_sys;

use crate::error::{LoaderError, Result};
use crate::fingerprint::ToolchainIdentity;

use super::{
    missing_include, ArtifactFormat, CompileJob, IncludeCallback, Toolchain, ToolchainFailure,
    ToolchainOutput,
};

/// Upper bound on compile attempts spent discovering late includes.
const MAX_INCLUDE_ROUNDS: usize = 64;

/// The NVIDIA runtime compiler.
#[derive(Debug, Clone)]
pub struct NvrtcToolchain {
    version: String,
}

impl NvrtcToolchain {
    /// Loads NVRTC and queries its version.
    pub fn new() -> Result<Self> {
        // cudarc panics if the NVRTC library cannot be found.
        let version = std::panic::catch_unwind(|| {
            let mut major = 0;
            let mut minor = 0;
            let status = unsafe { nvrtc_sys::nvrtcVersion(&mut major, &mut minor) };
            (status, major, minor)
        })
        .map_err(|_| LoaderError::Config("NVRTC library could not be loaded".to_string()))?;

        match version {
            (nvrtc_sys::nvrtcResult::NVRTC_SUCCESS, major, minor) => Ok(Self {
                version: format!("{}.{}", major, minor),
            }),
            (status, _, _) => Err(LoaderError::Config(format!(
                "nvrtcVersion failed: {}",
                error_string(status)
            ))),
        }
    }

    /// NVRTC version as `major.minor`.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Toolchain for NvrtcToolchain {
    fn identity(&self) -> ToolchainIdentity {
        ToolchainIdentity {
            name: "nvrtc".to_string(),
            version: self.version.clone(),
        }
    }

    fn compile(
        &self,
        job: &CompileJob<'_>,
        includes: &mut dyn IncludeCallback,
    ) -> std::result::Result<ToolchainOutput, ToolchainFailure> {
        let mut headers: Vec<(String, Vec<u8>)> = job.headers.to_vec();

        for _ in 0..MAX_INCLUDE_ROUNDS {
            match compile_once(job, &headers) {
                Ok(output) => return Ok(output),
                Err(failure) => {
                    let Some(name) = missing_include(&failure.log) else {
                        return Err(failure);
                    };
                    if headers.iter().any(|(n, _)| *n == name) {
                        return Err(failure);
                    }
                    match includes.include(&name, None) {
                        Some(content) => headers.push((name, content)),
                        None => return Err(failure),
                    }
                }
            }
        }

        Err(ToolchainFailure {
            log: format!(
                "gave up after {} rounds of include discovery",
                MAX_INCLUDE_ROUNDS
            ),
        })
    }
}

fn error_string(status: nvrtc_sys::nvrtcResult) -> String {
    unsafe {
        let msg = nvrtc_sys::nvrtcGetErrorString(status);
        if msg.is_null() {
            format!("{:?}", status)
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn cstring(what: &str, value: &str) -> std::result::Result<CString, ToolchainFailure> {
    CString::new(value).map_err(|_| ToolchainFailure {
        log: format!("{} contains a NUL byte: {:?}", what, value),
    })
}

fn cbytes(what: &str, value: &[u8]) -> std::result::Result<CString, ToolchainFailure> {
    CString::new(value).map_err(|_| ToolchainFailure {
        log: format!("{} contains a NUL byte", what),
    })
}

fn check(
    status: nvrtc_sys::nvrtcResult,
    call: &str,
) -> std::result::Result<(), ToolchainFailure> {
    if status == nvrtc_sys::nvrtcResult::NVRTC_SUCCESS {
        Ok(())
    } else {
        Err(ToolchainFailure {
            log: format!("{} failed: {}", call, error_string(status)),
        })
    }
}

/// Destroys the program when dropped.
struct Program(nvrtc_sys::nvrtcProgram);

impl Drop for Program {
    fn drop(&mut self) {
        unsafe {
            let _ = nvrtc_sys::nvrtcDestroyProgram(&mut self.0);
        }
    }
}

impl Program {
    fn log(&self) -> String {
        unsafe {
            let mut size = 0usize;
            if nvrtc_sys::nvrtcGetProgramLogSize(self.0, &mut size)
                != nvrtc_sys::nvrtcResult::NVRTC_SUCCESS
                || size == 0
            {
                return String::new();
            }
            let mut buf = vec![0u8; size];
            if nvrtc_sys::nvrtcGetProgramLog(self.0, buf.as_mut_ptr() as *mut c_char)
                != nvrtc_sys::nvrtcResult::NVRTC_SUCCESS
            {
                return String::new();
            }
            String::from_utf8_lossy(&buf)
                .trim_end_matches('\0')
                .to_string()
        }
    }
}

fn compile_once(
    job: &CompileJob<'_>,
    headers: &[(String, Vec<u8>)],
) -> std::result::Result<ToolchainOutput, ToolchainFailure> {
    let source = cbytes(job.program_name, job.source)?;
    let program_name = cstring("program name", job.program_name)?;
    let header_names = headers
        .iter()
        .map(|(n, _)| cstring("header name", n))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let header_sources = headers
        .iter()
        .map(|(n, c)| cbytes(n, c))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let header_name_ptrs: Vec<*const c_char> = header_names.iter().map(|c| c.as_ptr()).collect();
    let header_source_ptrs: Vec<*const c_char> =
        header_sources.iter().map(|c| c.as_ptr()).collect();

    let mut options: Vec<String> = job.options.to_vec();
    options.push(format!("--gpu-architecture={}", job.arch.to_virtual()));
    let options = options
        .iter()
        .map(|o| cstring("option", o))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let option_ptrs: Vec<*const c_char> = options.iter().map(|c| c.as_ptr()).collect();

    let expressions = job
        .name_expressions
        .iter()
        .map(|e| cstring("name expression", e))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut raw: nvrtc_sys::nvrtcProgram = ptr::null_mut();
    unsafe {
        check(
            nvrtc_sys::nvrtcCreateProgram(
                &mut raw,
                source.as_ptr(),
                program_name.as_ptr(),
                headers.len() as i32,
                header_source_ptrs.as_ptr(),
                header_name_ptrs.as_ptr(),
            ),
            "nvrtcCreateProgram",
        )?;
    }
    let program = Program(raw);

    for expression in &expressions {
        unsafe {
            check(
                nvrtc_sys::nvrtcAddNameExpression(program.0, expression.as_ptr()),
                "nvrtcAddNameExpression",
            )?;
        }
    }

    let status = unsafe {
        nvrtc_sys::nvrtcCompileProgram(program.0, option_ptrs.len() as i32, option_ptrs.as_ptr())
    };
    let log = program.log();
    if status != nvrtc_sys::nvrtcResult::NVRTC_SUCCESS {
        return Err(ToolchainFailure {
            log: if log.trim().is_empty() {
                format!("nvrtcCompileProgram failed: {}", error_string(status))
            } else {
                log
            },
        });
    }

    let image = unsafe {
        let mut size = 0usize;
        check(
            nvrtc_sys::nvrtcGetPTXSize(program.0, &mut size),
            "nvrtcGetPTXSize",
        )?;
        let mut buf = vec![0u8; size];
        check(
            nvrtc_sys::nvrtcGetPTX(program.0, buf.as_mut_ptr() as *mut c_char),
            "nvrtcGetPTX",
        )?;
        // The driver wants the terminating NUL; keep exactly one.
        while buf.len() > 1 && buf[buf.len() - 1] == 0 && buf[buf.len() - 2] == 0 {
            buf.pop();
        }
        buf
    };

    let mut lowered_names = BTreeMap::new();
    for (expression, c_expression) in job.name_expressions.iter().zip(&expressions) {
        let mut lowered: *const c_char = ptr::null();
        unsafe {
            check(
                nvrtc_sys::nvrtcGetLoweredName(program.0, c_expression.as_ptr(), &mut lowered),
                "nvrtcGetLoweredName",
            )?;
            if !lowered.is_null() {
                lowered_names.insert(
                    expression.clone(),
                    CStr::from_ptr(lowered).to_string_lossy().into_owned(),
                );
            }
        }
    }

    Ok(ToolchainOutput {
        image,
        format: ArtifactFormat::Ptx,
        lowered_names,
        log,
    })
}
