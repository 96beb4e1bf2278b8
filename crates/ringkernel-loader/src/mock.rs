//! In-process toolchain and driver.
//!
//! Lets the loader run end to end on hosts without a GPU: the toolchain
//! emits a small text image listing entries and globals, and the driver
//! "loads" that image into a handle table. Both count their work so tests can
//! assert exactly how often the compiler and the driver were invoked.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::compile::{
    ArtifactFormat, CompileJob, IncludeCallback, Toolchain, ToolchainFailure, ToolchainOutput,
};
use crate::device::{
    status, DeviceDriver, DeviceGlobal, DeviceInfo, DevicePtr, DriverResult, DriverStatus,
    FunctionHandle, LaunchConfig, ModuleHandle, Occupancy, TargetArch,
};
use crate::fingerprint::ToolchainIdentity;
use crate::resolve::{include_directives, source_text};

/// First line of every mock image.
pub const MOCK_IMAGE_HEADER: &str = "// mock-ptx";

/// Size reported for every constant variable in a mock image.
pub const MOCK_CONSTANT_SIZE: usize = 4;

/// Macros every mock compilation starts with.
const PREDEFINED_MACROS: &[&str] = &["__CUDACC__", "__CUDACC_RTC__", "__CUDA_ARCH__"];

/// Renders a mock image.
pub fn mock_image(arch: &str, entries: &[&str], constants: &[(&str, usize)]) -> Vec<u8> {
    let mut image = format!("{}\n.target {}\n", MOCK_IMAGE_HEADER, arch);
    for entry in entries {
        image.push_str(&format!(".entry {}\n", entry));
    }
    for (name, size) in constants {
        image.push_str(&format!(".global {} {}\n", name, size));
    }
    image.into_bytes()
}

/// Toolchain that "compiles" by walking includes and listing symbols.
#[derive(Debug)]
pub struct MockToolchain {
    version: String,
    delay: Option<Duration>,
    hidden_includes: Vec<String>,
    system_headers: Vec<String>,
    gates: Vec<(String, Arc<Mutex<()>>)>,
    compiles: AtomicUsize,
}

impl Default for MockToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockToolchain {
    /// Creates a mock toolchain reporting version `1.0`.
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            delay: None,
            hidden_includes: Vec::new(),
            system_headers: vec![
                "cuda_fp16.h".to_string(),
                "cuda_bf16.h".to_string(),
                "cuda_runtime.h".to_string(),
            ],
            gates: Vec::new(),
            compiles: AtomicUsize::new(0),
        }
    }

    /// Reports a different version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sleeps this long in every compile, to widen race windows.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests `name` from the include callback on every compile, as if a
    /// macro-computed include had been expanded.
    #[must_use]
    pub fn with_hidden_include(mut self, name: impl Into<String>) -> Self {
        self.hidden_includes.push(name.into());
        self
    }

    /// Compiles naming `entry` wait for `gate` to be free, so a test can hold
    /// one compilation in flight for as long as it likes.
    #[must_use]
    pub fn with_gate(mut self, entry: impl Into<String>, gate: Arc<Mutex<()>>) -> Self {
        self.gates.push((entry.into(), gate));
        self
    }

    /// Number of compile calls so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    fn lower(expression: &str) -> String {
        if let Some(variable) = expression.strip_prefix('&') {
            return variable.trim().to_string();
        }
        if expression
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return expression.to_string();
        }
        let mangled: String = expression
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("_Z{}{}", mangled.len(), mangled)
    }
}

impl Toolchain for MockToolchain {
    fn identity(&self) -> ToolchainIdentity {
        ToolchainIdentity {
            name: "mock".to_string(),
            version: self.version.clone(),
        }
    }

    fn compile(
        &self,
        job: &CompileJob<'_>,
        includes: &mut dyn IncludeCallback,
    ) -> Result<ToolchainOutput, ToolchainFailure> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        for (entry, gate) in &self.gates {
            if job.name_expressions.contains(entry) {
                drop(gate.lock());
            }
        }

        let headers: HashMap<&str, &[u8]> = job
            .headers
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_slice()))
            .collect();
        let predefined = predefined_macros(job.options);

        // Preprocess: every live include must come from the header table,
        // the system headers or the callback.
        let mut defined = predefined.clone();
        let mut visited = HashSet::new();
        let mut pending = vec![(job.program_name.to_string(), job.source.to_vec())];
        while let Some((file, text)) = pending.pop() {
            let live = live_lines(&source_text(&text), &mut defined);
            for directive in include_directives(&live) {
                if self.system_headers.contains(&directive.name)
                    || !visited.insert(directive.name.clone())
                {
                    continue;
                }
                let content = match headers.get(directive.name.as_str()) {
                    Some(content) => Some(content.to_vec()),
                    None => includes.include(&directive.name, Some(&file)),
                };
                match content {
                    Some(content) => pending.push((directive.name, content)),
                    None => {
                        return Err(ToolchainFailure {
                            log: format!(
                                "{}({}): catastrophic error: cannot open source file \"{}\"\n",
                                file, directive.line, directive.name
                            ),
                        })
                    }
                }
            }
        }

        for hidden in &self.hidden_includes {
            if includes.include(hidden, Some(job.program_name)).is_none() {
                return Err(ToolchainFailure {
                    log: format!(
                        "{}(1): catastrophic error: cannot open source file \"{}\"\n",
                        job.program_name, hidden
                    ),
                });
            }
        }

        let main = live_lines(&source_text(job.source), &mut predefined.clone());
        for (index, line) in main.lines().enumerate() {
            if let Some(rest) = line.trim_start().strip_prefix("#error") {
                return Err(ToolchainFailure {
                    log: format!(
                        "{}({}): error: #error directive: {}\n\n1 error detected in the compilation of \"{}\".\n",
                        job.program_name,
                        index + 1,
                        rest.trim(),
                        job.program_name
                    ),
                });
            }
        }

        let lowered_names: BTreeMap<String, String> = job
            .name_expressions
            .iter()
            .map(|e| (e.clone(), Self::lower(e)))
            .collect();
        let entries: Vec<&str> = job
            .name_expressions
            .iter()
            .filter(|e| !e.starts_with('&'))
            .map(|e| lowered_names[e].as_str())
            .collect();
        let constants: Vec<(&str, usize)> = job
            .name_expressions
            .iter()
            .filter(|e| e.starts_with('&'))
            .map(|e| (lowered_names[e].as_str(), MOCK_CONSTANT_SIZE))
            .collect();

        Ok(ToolchainOutput {
            image: mock_image(&job.arch.to_string(), &entries, &constants),
            format: ArtifactFormat::Ptx,
            lowered_names,
            log: String::new(),
        })
    }
}

fn predefined_macros(options: &[String]) -> HashSet<String> {
    let mut defined: HashSet<String> = PREDEFINED_MACROS.iter().map(|m| m.to_string()).collect();
    for option in options {
        let definition = option
            .strip_prefix("-D")
            .or_else(|| option.strip_prefix("--define-macro="));
        if let Some(definition) = definition {
            let name = definition.split('=').next().unwrap_or_default();
            if !name.is_empty() {
                defined.insert(name.to_string());
            }
        }
    }
    defined
}

/// Blanks the lines of conditional blocks that are switched off, keeping
/// line numbers. Understands `#ifdef`, `#ifndef`, `#if [!]defined(X)`,
/// `#if 0`, `#elif`, `#else`, `#endif` and `#define`. Any other condition
/// counts as true.
fn live_lines(text: &str, defined: &mut HashSet<String>) -> String {
    let mut out = String::with_capacity(text.len());
    // (enclosing block live, this branch live, some branch taken)
    let mut stack: Vec<(bool, bool, bool)> = Vec::new();
    for line in text.lines() {
        let live = stack
            .last()
            .map_or(true, |&(outer, branch, _)| outer && branch);
        let mut keep = live;
        if let Some(directive) = line.trim_start().strip_prefix('#') {
            let directive = directive.trim_start();
            let (word, rest) = directive
                .split_once(char::is_whitespace)
                .unwrap_or((directive, ""));
            let rest = rest.trim();
            match word {
                "ifdef" | "ifndef" | "if" => {
                    let taken = match word {
                        "ifdef" => defined.contains(rest),
                        "ifndef" => !defined.contains(rest),
                        _ => condition(rest, defined),
                    };
                    stack.push((live, taken, taken));
                    keep = false;
                }
                "elif" => {
                    if let Some(top) = stack.last_mut() {
                        let taken = !top.2 && condition(rest, defined);
                        top.1 = taken;
                        top.2 |= taken;
                    }
                    keep = false;
                }
                "else" => {
                    if let Some(top) = stack.last_mut() {
                        top.1 = !top.2;
                        top.2 = true;
                    }
                    keep = false;
                }
                "endif" => {
                    stack.pop();
                    keep = false;
                }
                "define" if live => {
                    let name = rest
                        .split(|c: char| c.is_whitespace() || c == '(')
                        .next()
                        .unwrap_or_default();
                    if !name.is_empty() {
                        defined.insert(name.to_string());
                    }
                }
                _ => {}
            }
        }
        if keep {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn condition(expression: &str, defined: &HashSet<String>) -> bool {
    let expression = expression.trim();
    if let Some(inner) = expression.strip_prefix('!') {
        return !condition(inner, defined);
    }
    if let Some(name) = expression.strip_prefix("defined") {
        let name = name.trim().trim_start_matches('(').trim_end_matches(')').trim();
        return defined.contains(name);
    }
    expression != "0"
}

#[derive(Debug, Default)]
struct MockModule {
    functions: HashMap<String, u64>,
    globals: HashMap<String, DeviceGlobal>,
}

#[derive(Debug, Default)]
struct MockState {
    modules: HashMap<u64, MockModule>,
    memory: HashMap<u64, Vec<u8>>,
}

/// Driver over an in-memory handle table.
#[derive(Debug)]
pub struct MockDriver {
    info: DeviceInfo,
    state: Mutex<MockState>,
    next_handle: AtomicU64,
    fail_bind: AtomicBool,
    binds: AtomicUsize,
    loads: AtomicUsize,
    launches: AtomicUsize,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A compute capability 8.0 device.
    pub fn new() -> Self {
        Self::with_compute_capability(8, 0)
    }

    /// A device of the given compute capability.
    pub fn with_compute_capability(major: u32, minor: u32) -> Self {
        Self {
            info: DeviceInfo {
                ordinal: 0,
                name: "Mock Device".to_string(),
                compute_capability: (major, minor),
            },
            state: Mutex::new(MockState::default()),
            next_handle: AtomicU64::new(1),
            fail_bind: AtomicBool::new(false),
            binds: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
        }
    }

    /// Makes every subsequent context bind fail.
    pub fn fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    /// Modules currently loaded.
    pub fn loaded_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Successful module loads so far.
    pub fn total_loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Context binds so far.
    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    /// Launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Bytes last copied into a global, if any.
    pub fn read_global(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        self.state.lock().memory.get(&ptr.0).cloned()
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

fn fail(code: i32, name: &str, description: impl Into<String>) -> DriverStatus {
    DriverStatus::new(code, name, description)
}

const INVALID_HANDLE: i32 = 400;

impl DeviceDriver for MockDriver {
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn bind_current(&self) -> DriverResult<()> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(fail(
                status::INVALID_CONTEXT,
                "CUDA_ERROR_INVALID_CONTEXT",
                "invalid device context",
            ));
        }
        Ok(())
    }

    fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        let invalid = |why: &str| {
            fail(
                status::INVALID_IMAGE,
                "CUDA_ERROR_INVALID_IMAGE",
                format!("device kernel image is invalid: {}", why),
            )
        };
        let text = std::str::from_utf8(image).map_err(|_| invalid("not UTF-8"))?;
        let mut lines = text.lines();
        if lines.next() != Some(MOCK_IMAGE_HEADER) {
            return Err(invalid("missing header"));
        }

        let mut module = MockModule::default();
        let mut target = None;
        for line in lines {
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some(".target"), Some(arch), None) => {
                    target = Some(
                        arch.parse::<TargetArch>()
                            .map_err(|_| invalid("bad target"))?,
                    );
                }
                (Some(".entry"), Some(name), None) => {
                    module.functions.insert(name.to_string(), self.handle());
                }
                (Some(".global"), Some(name), Some(size)) => {
                    let size = size.parse().map_err(|_| invalid("bad global size"))?;
                    module.globals.insert(
                        name.to_string(),
                        DeviceGlobal {
                            ptr: DevicePtr(self.handle() << 8),
                            size,
                        },
                    );
                }
                (None, _, _) => {}
                _ => return Err(invalid("unrecognized directive")),
            }
        }

        let target = target.ok_or_else(|| invalid("missing target"))?;
        if !target.ptx_runs_on(&self.info.arch()) {
            return Err(fail(
                status::NO_BINARY_FOR_GPU,
                "CUDA_ERROR_NO_BINARY_FOR_GPU",
                "no kernel image is available for execution on the device",
            ));
        }

        let handle = self.handle();
        self.state.lock().modules.insert(handle, module);
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ModuleHandle(handle))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> DriverResult<FunctionHandle> {
        let state = self.state.lock();
        let module = state
            .modules
            .get(&module.0)
            .ok_or_else(|| fail(INVALID_HANDLE, "CUDA_ERROR_INVALID_HANDLE", "invalid module"))?;
        module
            .functions
            .get(name)
            .map(|h| FunctionHandle(*h))
            .ok_or_else(|| fail(status::NOT_FOUND, "CUDA_ERROR_NOT_FOUND", "named symbol not found"))
    }

    fn get_global(&self, module: ModuleHandle, name: &str) -> DriverResult<DeviceGlobal> {
        let state = self.state.lock();
        let module = state
            .modules
            .get(&module.0)
            .ok_or_else(|| fail(INVALID_HANDLE, "CUDA_ERROR_INVALID_HANDLE", "invalid module"))?;
        module
            .globals
            .get(name)
            .copied()
            .ok_or_else(|| fail(status::NOT_FOUND, "CUDA_ERROR_NOT_FOUND", "named symbol not found"))
    }

    fn occupancy(&self, _function: FunctionHandle) -> DriverResult<Occupancy> {
        Ok(Occupancy {
            min_grid_size: 216,
            block_size: 256,
        })
    }

    fn unload_module(&self, module: ModuleHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let removed = state
            .modules
            .remove(&module.0)
            .ok_or_else(|| fail(INVALID_HANDLE, "CUDA_ERROR_INVALID_HANDLE", "invalid module"))?;
        for global in removed.globals.values() {
            state.memory.remove(&global.ptr.0);
        }
        Ok(())
    }

    fn copy_to_device(&self, dst: DevicePtr, bytes: &[u8]) -> DriverResult<()> {
        let mut state = self.state.lock();
        let known = state
            .modules
            .values()
            .flat_map(|m| m.globals.values())
            .any(|g| g.ptr == dst && g.size >= bytes.len());
        if !known {
            return Err(fail(1, "CUDA_ERROR_INVALID_VALUE", "invalid device pointer"));
        }
        state.memory.insert(dst.0, bytes.to_vec());
        Ok(())
    }

    unsafe fn launch(
        &self,
        function: FunctionHandle,
        _config: &LaunchConfig,
        _params: &mut [*mut c_void],
    ) -> DriverResult<()> {
        let known = self
            .state
            .lock()
            .modules
            .values()
            .any(|m| m.functions.values().any(|h| *h == function.0));
        if !known {
            return Err(fail(INVALID_HANDLE, "CUDA_ERROR_INVALID_HANDLE", "invalid function"));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoIncludes;

    impl IncludeCallback for NoIncludes {
        fn include(&mut self, _name: &str, _includer: Option<&str>) -> Option<Vec<u8>> {
            None
        }
    }

    #[test]
    fn test_mock_toolchain_lowering() {
        assert_eq!(MockToolchain::lower("add"), "add");
        assert_eq!(MockToolchain::lower("&c_data"), "c_data");
        assert_eq!(MockToolchain::lower("axpy<float>"), "_Z11axpy_float_");
    }

    #[test]
    fn test_mock_toolchain_reports_missing_header() {
        let toolchain = MockToolchain::new();
        let job = CompileJob {
            program_name: "main.cu",
            source: b"#include <cuda_fp16.h>\n#include \"gone.cuh\"\n",
            headers: &[],
            options: &[],
            arch: TargetArch::sm(8, 0),
            name_expressions: &["k".to_string()],
        };
        let failure = toolchain.compile(&job, &mut NoIncludes).unwrap_err();
        assert!(failure.log.contains("main.cu(2)"));
        assert!(failure.log.contains("gone.cuh"));
        assert_eq!(toolchain.compile_count(), 1);
    }

    #[test]
    fn test_mock_toolchain_skips_disabled_blocks() {
        let toolchain = MockToolchain::new();
        let source = b"#ifndef __CUDACC_RTC__\n#include <cstdio>\n#else\n#define DEVICE_ONLY\n#endif\n\
#if !defined(DEVICE_ONLY)\n#error host build\n#endif\n\
#ifdef NO_SUCH_MACRO\n#include \"gone.cuh\"\n#elif defined(WIDE)\n#include \"wide.cuh\"\n#endif\n";
        let job = CompileJob {
            program_name: "main.cu",
            source: &source[..],
            headers: &[],
            options: &[],
            arch: TargetArch::sm(8, 0),
            name_expressions: &["k".to_string()],
        };
        assert!(toolchain.compile(&job, &mut NoIncludes).is_ok());

        // -DWIDE switches the `#elif` branch on.
        let options = ["-DWIDE=1".to_string()];
        let job = CompileJob {
            options: &options,
            ..job
        };
        let failure = toolchain.compile(&job, &mut NoIncludes).unwrap_err();
        assert!(failure.log.contains("main.cu(12)"));
        assert!(failure.log.contains("wide.cuh"));
    }

    #[test]
    fn test_live_lines_keeps_line_numbers() {
        let mut defined = HashSet::new();
        let live = live_lines("a\n#if 0\nb\n#endif\nc\n", &mut defined);
        assert_eq!(live, "a\n\n\n\nc\n");
    }

    #[test]
    fn test_mock_driver_rejects_foreign_images() {
        let driver = MockDriver::new();
        let err = driver.load_module(b"\x7fELF").unwrap_err();
        assert_eq!(err.code, status::INVALID_IMAGE);

        let err = driver
            .load_module(&mock_image("sm_90", &["k"], &[]))
            .unwrap_err();
        assert_eq!(err.code, status::NO_BINARY_FOR_GPU);

        let handle = driver.load_module(&mock_image("sm_75", &["k"], &[])).unwrap();
        assert!(driver.get_function(handle, "k").is_ok());
        assert_eq!(
            driver.get_function(handle, "nope").unwrap_err().code,
            status::NOT_FOUND
        );
        driver.unload_module(handle).unwrap();
        assert_eq!(driver.loaded_modules(), 0);
    }
}
