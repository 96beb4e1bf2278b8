//! Target architecture strings (`sm_80`, `compute_86`, `sm_90a`).

use std::fmt;
use std::str::FromStr;

/// A parsed NVIDIA target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetArch {
    /// Compute capability major version.
    pub major: u32,
    /// Compute capability minor version.
    pub minor: u32,
    /// `compute_XY` (virtual) rather than `sm_XY` (real).
    pub virtual_arch: bool,
    /// `sm_XYa`: uses features only present on exactly this compute
    /// capability, so the code runs nowhere else.
    pub arch_specific: bool,
}

impl TargetArch {
    /// Real architecture for a compute capability.
    pub const fn sm(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            virtual_arch: false,
            arch_specific: false,
        }
    }

    /// The architecture-specific (`a` suffix) variant.
    pub const fn to_arch_specific(self) -> Self {
        Self {
            arch_specific: true,
            ..self
        }
    }

    /// Virtual architecture of the same compute capability.
    pub const fn to_virtual(self) -> Self {
        Self {
            virtual_arch: true,
            ..self
        }
    }

    /// Compute capability as `(major, minor)`.
    pub const fn compute_capability(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    /// Whether PTX built for `self` can be JIT-compiled for `device`.
    ///
    /// PTX is forward compatible: any device of equal or newer compute
    /// capability accepts it. Architecture-specific PTX only runs on its own
    /// compute capability.
    pub fn ptx_runs_on(&self, device: &TargetArch) -> bool {
        if self.arch_specific {
            return device.compute_capability() == self.compute_capability();
        }
        device.compute_capability() >= self.compute_capability()
    }

    /// Whether a cubin built for `self` runs on `device`.
    ///
    /// Binary code is only compatible within one major version, from the
    /// same minor version upwards.
    pub fn cubin_runs_on(&self, device: &TargetArch) -> bool {
        if self.arch_specific {
            return device.compute_capability() == self.compute_capability();
        }
        device.major == self.major && device.minor >= self.minor
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.virtual_arch { "compute" } else { "sm" };
        let suffix = if self.arch_specific { "a" } else { "" };
        write!(f, "{}_{}{}{}", prefix, self.major, self.minor, suffix)
    }
}

impl FromStr for TargetArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digits, virtual_arch) = if let Some(rest) = s.strip_prefix("sm_") {
            (rest, false)
        } else if let Some(rest) = s.strip_prefix("compute_") {
            (rest, true)
        } else {
            return Err(format!(
                "unsupported target architecture '{}' (expected sm_XY or compute_XY)",
                s
            ));
        };
        let (digits, arch_specific) = match digits.strip_suffix('a') {
            Some(rest) => (rest, true),
            None => (digits, false),
        };

        if digits.len() < 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("malformed target architecture '{}'", s));
        }
        let (major, minor) = digits.split_at(digits.len() - 1);
        let major: u32 = major
            .parse()
            .map_err(|e| format!("malformed target architecture '{}': {}", s, e))?;
        let minor: u32 = minor
            .parse()
            .map_err(|e| format!("malformed target architecture '{}': {}", s, e))?;
        if major == 0 {
            return Err(format!("malformed target architecture '{}'", s));
        }

        Ok(Self {
            major,
            minor,
            virtual_arch,
            arch_specific,
        })
    }
}
