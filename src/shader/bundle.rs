//! The program bundle: every kernel the pipeline can activate, in one WGSL module.

use crate::error::ConfigError;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use std::borrow::Cow;

/// Kernels shipped with the crate.
const BUILTIN_KERNELS: &str = include_str!("kernels.wgsl");

/// A parsed and validated compute program.
pub struct ProgramBundle {
    source: Cow<'static, str>,
    module: naga::Module,
}

/// A compute entry point located in a [`ProgramBundle`].
#[derive(Debug, Clone, Copy)]
pub struct KernelEntry<'a> {
    pub name: &'static str,
    pub source: &'a str,
}

impl ProgramBundle {
    /// The bundle compiled into the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_source(Cow::Borrowed(BUILTIN_KERNELS))
    }

    pub fn from_source(source: impl Into<Cow<'static, str>>) -> Result<Self, ConfigError> {
        let source = source.into();
        let module = naga::front::wgsl::parse_str(&source)
            .map_err(|e| ConfigError::BundleParse(e.emit_to_string(&source)))?;

        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        validator
            .validate(&module)
            .map_err(|e| ConfigError::BundleValidation(format!("{:?}", e)))?;

        Ok(Self { source, module })
    }

    /// Looks up a compute entry point by name.
    pub fn kernel(&self, name: &'static str) -> Result<KernelEntry<'_>, ConfigError> {
        let entry = self
            .module
            .entry_points
            .iter()
            .find(|ep| ep.name == name)
            .ok_or_else(|| ConfigError::MissingKernel(name.to_string()))?;
        if entry.stage != naga::ShaderStage::Compute {
            return Err(ConfigError::NotCompute(name.to_string()));
        }
        Ok(KernelEntry {
            name,
            source: &self.source,
        })
    }

    pub fn kernel_names(&self) -> impl Iterator<Item = &str> {
        self.module
            .entry_points
            .iter()
            .filter(|ep| ep.stage == naga::ShaderStage::Compute)
            .map(|ep| ep.name.as_str())
    }
}
