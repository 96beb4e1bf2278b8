//! Loader configuration.
//!
//! Loaded from a TOML file layered with `RINGKERNEL_LOADER_*` environment
//! variables using the `config` crate, or built in code.
//!
//! ```toml
//! cache_dir = "/var/cache/kernels"
//! default_flags = ["-std=c++17", "--use_fast_math"]
//! include_dirs = ["kernels/include"]
//! verbose = true
//! ```

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::compile::{ArtifactStore, DEFAULT_FLAGS};
use crate::error::{LoaderError, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RINGKERNEL_LOADER";

/// Configuration for a [`KernelLoader`](crate::KernelLoader).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// On-disk cache directory. `None` uses the platform default.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Persist compiled artifacts to disk.
    #[serde(default = "default_disk_cache")]
    pub disk_cache: bool,

    /// Flags prepended to every request's flags.
    #[serde(default = "default_flags")]
    pub default_flags: Vec<String>,

    /// Filesystem include roots registered at startup, in search order.
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,

    /// Register the headers bundled with this crate.
    #[serde(default = "default_bundled_headers")]
    pub bundled_headers: bool,

    /// Headers left to the toolchain's own search path.
    #[serde(default = "default_builtin_includes")]
    pub builtin_includes: Vec<String>,

    /// Log source listings and toolchain output for every compile.
    #[serde(default)]
    pub verbose: bool,
}

fn default_disk_cache() -> bool {
    true
}

fn default_flags() -> Vec<String> {
    DEFAULT_FLAGS.iter().map(|f| f.to_string()).collect()
}

fn default_bundled_headers() -> bool {
    true
}

fn default_builtin_includes() -> Vec<String> {
    ["cuda_fp16.h", "cuda_bf16.h", "cuda_runtime.h"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            disk_cache: default_disk_cache(),
            default_flags: default_flags(),
            include_dirs: Vec::new(),
            bundled_headers: default_bundled_headers(),
            builtin_includes: default_builtin_includes(),
            verbose: false,
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("default_flags")
        .with_list_parse_key("include_dirs")
        .with_list_parse_key("builtin_includes")
}

fn config_error(e: config::ConfigError) -> LoaderError {
    LoaderError::Config(e.to_string())
}

impl LoaderConfig {
    /// Loads a TOML file, overridden by environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(environment())
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from environment variables only.
    pub fn from_env() -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(environment())
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text, overridden by environment variables.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .add_source(environment())
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the on-disk cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self.disk_cache = true;
        self
    }

    /// Disables the on-disk cache.
    #[must_use]
    pub fn without_disk_cache(mut self) -> Self {
        self.disk_cache = false;
        self
    }

    /// Appends a default flag.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.default_flags.push(flag.into());
        self
    }

    /// Replaces the default flags.
    #[must_use]
    pub fn with_default_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Registers a filesystem include root at startup.
    #[must_use]
    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    /// Leaves `header` to the toolchain's own search path.
    #[must_use]
    pub fn with_builtin_include(mut self, header: impl Into<String>) -> Self {
        self.builtin_includes.push(header.into());
        self
    }

    /// Skips registering the bundled headers.
    #[must_use]
    pub fn without_bundled_headers(mut self) -> Self {
        self.bundled_headers = false;
        self
    }

    /// Enables verbose compile logging.
    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(flag) = self.default_flags.iter().find(|f| f.trim().is_empty()) {
            return Err(LoaderError::Config(format!("Empty default flag: {:?}", flag)));
        }
        if let Some(flag) = self.default_flags.iter().find(|f| is_arch_flag(f)) {
            return Err(LoaderError::Config(format!(
                "Architecture flag '{}' is not allowed in default flags; set it per request",
                flag
            )));
        }
        Ok(())
    }

    /// Opens the artifact store this configuration describes.
    pub fn artifact_store(&self) -> Result<ArtifactStore> {
        if !self.disk_cache {
            return Ok(ArtifactStore::disabled());
        }
        let dir = self
            .cache_dir
            .clone()
            .unwrap_or_else(ArtifactStore::default_cache_dir);
        Ok(ArtifactStore::with_dir(dir)?)
    }
}

fn is_arch_flag(flag: &str) -> bool {
    flag.starts_with("--gpu-architecture") || flag.starts_with("-arch")
}
