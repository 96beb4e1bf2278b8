//! Loading compiled artifacts onto the device.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::compile::{ArtifactFormat, CompiledArtifact};
use crate::error::{DeviceLoadError, DeviceLoadErrorKind, LoaderError, Result};
use crate::fingerprint::Fingerprint;

use super::{
    status, DeviceDriver, DeviceGlobal, DeviceInfo, DriverStatus, FunctionHandle, LaunchConfig,
    ModuleHandle, Occupancy, TargetArch,
};

fn bind(driver: &dyn DeviceDriver) -> std::result::Result<(), DeviceLoadError> {
    driver.bind_current().map_err(|status| DeviceLoadError {
        kind: DeviceLoadErrorKind::InvalidContext,
        message: "failed to make the device context current".to_string(),
        status: Some(status),
    })
}

/// Loads compiled artifacts into the driver's context.
#[derive(Clone)]
pub struct ModuleLoader {
    driver: Arc<dyn DeviceDriver>,
}

impl ModuleLoader {
    /// Creates a loader over a driver.
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        Self { driver }
    }

    /// Device the loader targets.
    pub fn device(&self) -> &DeviceInfo {
        self.driver.device()
    }

    /// Checks that an artifact of `format` built for `target` can run on the
    /// device.
    pub fn check_arch(
        &self,
        target: &TargetArch,
        format: ArtifactFormat,
    ) -> std::result::Result<(), DeviceLoadError> {
        let device = self.device().arch();
        let compatible = match format {
            ArtifactFormat::Ptx => target.ptx_runs_on(&device),
            ArtifactFormat::Cubin => target.cubin_runs_on(&device),
        };
        if compatible {
            Ok(())
        } else {
            Err(DeviceLoadError::new(
                DeviceLoadErrorKind::ArchitectureMismatch {
                    artifact: target.to_string(),
                    device: device.to_string(),
                },
                format!(
                    "{} artifact for {} is not loadable on {}",
                    format,
                    target,
                    self.device().name
                ),
            ))
        }
    }

    /// Loads an artifact and resolves every entry and constant it lists.
    pub fn load(
        &self,
        fingerprint: Fingerprint,
        artifact: &CompiledArtifact,
    ) -> std::result::Result<LoadedModule, DeviceLoadError> {
        let target: TargetArch = artifact.arch.parse().map_err(|e: String| {
            DeviceLoadError::new(DeviceLoadErrorKind::InvalidImage, e)
        })?;
        self.check_arch(&target, artifact.format)?;

        let driver = self.driver.as_ref();
        bind(driver)?;

        let handle = driver.load_module(&artifact.image).map_err(|status| {
            if status.code == status::NO_BINARY_FOR_GPU {
                DeviceLoadError {
                    kind: DeviceLoadErrorKind::ArchitectureMismatch {
                        artifact: target.to_string(),
                        device: self.device().arch().to_string(),
                    },
                    message: "driver found no compatible binary in the image".to_string(),
                    status: Some(status),
                }
            } else {
                DeviceLoadError::from_status(status, "failed to load module image")
            }
        })?;

        // From here on the module is unloaded on drop if anything fails.
        let mut module = LoadedModule {
            driver: Arc::clone(&self.driver),
            handle,
            fingerprint,
            arch: artifact.arch.clone(),
            functions: BTreeMap::new(),
            constants: BTreeMap::new(),
        };

        for (entry, lowered) in &artifact.entries {
            let function = driver
                .get_function(handle, lowered)
                .map_err(|status| symbol_error(status, entry, lowered))?;
            let occupancy = driver.occupancy(function).map_err(|status| {
                DeviceLoadError::from_status(
                    status,
                    format!("occupancy query failed for '{}'", entry),
                )
            })?;
            module.functions.insert(
                entry.clone(),
                Arc::new(KernelFunction {
                    driver: Arc::clone(&self.driver),
                    entry: entry.clone(),
                    lowered_name: lowered.clone(),
                    handle: function,
                    occupancy,
                }),
            );
        }

        for (name, lowered) in &artifact.constants {
            let global = driver
                .get_global(handle, lowered)
                .map_err(|status| symbol_error(status, name, lowered))?;
            module.constants.insert(name.clone(), global);
        }

        tracing::debug!(
            fingerprint = %fingerprint.short(),
            functions = module.functions.len(),
            constants = module.constants.len(),
            device = %self.device().name,
            "Loaded module"
        );

        Ok(module)
    }
}

fn symbol_error(status: DriverStatus, name: &str, lowered: &str) -> DeviceLoadError {
    if status.code == status::NOT_FOUND {
        DeviceLoadError {
            kind: DeviceLoadErrorKind::MissingSymbol(name.to_string()),
            message: format!("symbol '{}' not present in module", lowered),
            status: Some(status),
        }
    } else {
        DeviceLoadError::from_status(status, format!("lookup of '{}' failed", lowered))
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("device", self.device())
            .finish()
    }
}

/// A module resident on the device, with its resolved functions and globals.
///
/// Unloaded through the driver when dropped.
pub struct LoadedModule {
    driver: Arc<dyn DeviceDriver>,
    handle: ModuleHandle,
    fingerprint: Fingerprint,
    arch: String,
    functions: BTreeMap<String, Arc<KernelFunction>>,
    constants: BTreeMap<String, DeviceGlobal>,
}

impl LoadedModule {
    /// Fingerprint of the artifact this module was loaded from.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Architecture the artifact targets.
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Raw module handle.
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    /// Function for an entry expression.
    pub fn function(&self, entry: &str) -> Option<&KernelFunction> {
        self.functions.get(entry).map(Arc::as_ref)
    }

    pub(crate) fn shared_function(&self, entry: &str) -> Option<Arc<KernelFunction>> {
        self.functions.get(entry).cloned()
    }

    /// Entry expressions available in this module, sorted.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Device address and size of a constant variable.
    pub fn constant(&self, name: &str) -> Option<DeviceGlobal> {
        self.constants.get(name).copied()
    }

    /// Copies `bytes` into a constant variable.
    ///
    /// The length must equal the variable's size.
    pub fn fill_constant(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let global = self.constant(name).ok_or_else(|| {
            DeviceLoadError::new(
                DeviceLoadErrorKind::MissingSymbol(name.to_string()),
                "constant was not requested when the kernel was loaded",
            )
        })?;
        if global.size != bytes.len() {
            return Err(LoaderError::Config(format!(
                "constant '{}' is {} bytes, got {}",
                name,
                global.size,
                bytes.len()
            )));
        }

        bind(self.driver.as_ref())?;
        self.driver
            .copy_to_device(global.ptr, bytes)
            .map_err(|status| {
                DeviceLoadError::from_status(status, format!("copy to constant '{}' failed", name))
            })?;
        Ok(())
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        // Rebind: the last reference may be dropped on any thread.
        let result = self
            .driver
            .bind_current()
            .and_then(|()| self.driver.unload_module(self.handle));
        match result {
            Ok(()) => tracing::trace!(fingerprint = %self.fingerprint.short(), "Unloaded module"),
            // The driver is already shutting down at process exit.
            Err(status) if status.code == status::DEINITIALIZED => {}
            Err(status) => tracing::warn!(
                fingerprint = %self.fingerprint.short(),
                status = %status,
                "Failed to unload module"
            ),
        }
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("fingerprint", &self.fingerprint)
            .field("arch", &self.arch)
            .field("handle", &self.handle)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("constants", &self.constants)
            .finish()
    }
}

/// An invocable device function inside a [`LoadedModule`].
pub struct KernelFunction {
    driver: Arc<dyn DeviceDriver>,
    entry: String,
    lowered_name: String,
    handle: FunctionHandle,
    occupancy: Occupancy,
}

impl KernelFunction {
    /// Entry expression as requested.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Lowered (mangled) symbol name.
    pub fn lowered_name(&self) -> &str {
        &self.lowered_name
    }

    /// Raw function handle.
    pub fn handle(&self) -> FunctionHandle {
        self.handle
    }

    /// Block size that maximizes occupancy.
    pub fn best_block_size(&self) -> u32 {
        self.occupancy.block_size
    }

    /// Minimum grid size for full occupancy at [`best_block_size`](Self::best_block_size).
    pub fn min_grid_size(&self) -> u32 {
        self.occupancy.min_grid_size
    }

    /// Launches the function on the owning context.
    ///
    /// # Safety
    ///
    /// `params` must match the kernel's parameter list exactly (one pointer
    /// per parameter, each to a value of the expected type), and all device
    /// memory referenced must stay valid until the kernel completes.
    pub unsafe fn launch(
        &self,
        config: &LaunchConfig,
        params: &mut [*mut c_void],
    ) -> std::result::Result<(), DeviceLoadError> {
        bind(self.driver.as_ref())?;
        self.driver
            .launch(self.handle, config, params)
            .map_err(|status| {
                DeviceLoadError::from_status(status, format!("launch of '{}' failed", self.entry))
            })
    }
}

impl fmt::Debug for KernelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelFunction")
            .field("entry", &self.entry)
            .field("lowered_name", &self.lowered_name)
            .field("handle", &self.handle)
            .field("occupancy", &self.occupancy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{mock_image, MockDriver};

    fn artifact(arch: &str, entries: &[&str]) -> CompiledArtifact {
        CompiledArtifact {
            image: mock_image(arch, entries, &[("c_scale", 4)]),
            format: ArtifactFormat::Ptx,
            arch: arch.to_string(),
            entries: entries
                .iter()
                .map(|e| (e.to_string(), e.to_string()))
                .collect(),
            constants: [("c_scale".to_string(), "c_scale".to_string())]
                .into_iter()
                .collect(),
        }
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint::from_bytes([7; 32])
    }

    #[test]
    fn test_load_resolves_functions_and_constants() {
        let driver = Arc::new(MockDriver::new());
        let loader = ModuleLoader::new(driver.clone());

        let module = loader
            .load(fingerprint(), &artifact("sm_80", &["add", "sub"]))
            .unwrap();
        assert_eq!(module.entries().collect::<Vec<_>>(), vec!["add", "sub"]);
        let add = module.function("add").unwrap();
        assert!(add.best_block_size() > 0);
        assert_eq!(module.constant("c_scale").unwrap().size, 4);

        module.fill_constant("c_scale", &2.0f32.to_le_bytes()).unwrap();
        assert!(module.fill_constant("c_scale", &[0u8; 8]).is_err());
        assert!(module.fill_constant("missing", &[0u8; 4]).is_err());

        assert_eq!(driver.loaded_modules(), 1);
        drop(module);
        assert_eq!(driver.loaded_modules(), 0);
    }

    #[test]
    fn test_architecture_mismatch_is_not_an_artifact_fault() {
        let loader = ModuleLoader::new(Arc::new(MockDriver::new()));
        let err = loader
            .load(fingerprint(), &artifact("sm_90", &["add"]))
            .unwrap_err();
        assert!(matches!(
            err.kind,
            DeviceLoadErrorKind::ArchitectureMismatch { .. }
        ));
        assert!(!err.is_artifact_fault());
    }

    #[test]
    fn test_missing_symbol() {
        let driver = Arc::new(MockDriver::new());
        let loader = ModuleLoader::new(driver.clone());
        let mut art = artifact("sm_80", &["add"]);
        art.entries.insert("mul".to_string(), "mul".to_string());

        let err = loader.load(fingerprint(), &art).unwrap_err();
        assert_eq!(err.kind, DeviceLoadErrorKind::MissingSymbol("mul".to_string()));
        assert!(err.is_artifact_fault());
        // The partially loaded module was released.
        assert_eq!(driver.loaded_modules(), 0);
    }

    #[test]
    fn test_corrupt_image() {
        let loader = ModuleLoader::new(Arc::new(MockDriver::new()));
        let mut art = artifact("sm_80", &["add"]);
        art.image.truncate(3);
        let err = loader.load(fingerprint(), &art).unwrap_err();
        assert_eq!(err.kind, DeviceLoadErrorKind::InvalidImage);
    }

    #[test]
    fn test_bind_failure_is_invalid_context() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_bind(true);
        let loader = ModuleLoader::new(driver);
        let err = loader
            .load(fingerprint(), &artifact("sm_80", &["add"]))
            .unwrap_err();
        assert_eq!(err.kind, DeviceLoadErrorKind::InvalidContext);
    }

    #[test]
    fn test_launch_binds_and_counts() {
        let driver = Arc::new(MockDriver::new());
        let loader = ModuleLoader::new(driver.clone());
        let module = loader
            .load(fingerprint(), &artifact("sm_80", &["add"]))
            .unwrap();
        let add = module.function("add").unwrap();
        let mut n: u32 = 16;
        let mut params = [&mut n as *mut u32 as *mut c_void];
        unsafe {
            add.launch(&LaunchConfig::for_elements(16, 8), &mut params)
                .unwrap();
        }
        assert_eq!(driver.launches(), 1);
    }
}
