//! Compute kernels and the stages compiled from them.

mod bundle;
mod registry;

pub use bundle::{KernelEntry, ProgramBundle};
pub use registry::{ActiveStages, EffectClock, ShaderRegistry};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entry point of the time-varying analog degradation kernel.
pub const DEGRADATION_KERNEL: &str = "vhs_kernel";

/// Geometric scale variants. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleKernel {
    /// 1:1 copy anchored at the top-left corner
    Passthrough,
    /// Stretch the input to the output size
    #[default]
    Scale,
    /// Cover the output, cropping the overflow
    ScaleToFill,
    /// Fit inside the output, letterboxing the rest
    ScaleToFit,
}

impl ScaleKernel {
    /// The ordered list effect selection indexes into.
    pub const SELECTABLE: [ScaleKernel; 3] = [
        ScaleKernel::Scale,
        ScaleKernel::ScaleToFit,
        ScaleKernel::ScaleToFill,
    ];

    pub const ALL: [ScaleKernel; 4] = [
        ScaleKernel::Passthrough,
        ScaleKernel::Scale,
        ScaleKernel::ScaleToFill,
        ScaleKernel::ScaleToFit,
    ];

    pub fn from_index(index: usize) -> Result<Self, ConfigError> {
        Self::SELECTABLE
            .get(index)
            .copied()
            .ok_or(ConfigError::KernelIndex(index))
    }

    /// Entry point name in the program bundle.
    pub fn entry_point(self) -> &'static str {
        match self {
            ScaleKernel::Passthrough => "passthrough_kernel",
            ScaleKernel::Scale => "scale_kernel",
            ScaleKernel::ScaleToFill => "scale_to_fill_kernel",
            ScaleKernel::ScaleToFit => "scale_to_fit_kernel",
        }
    }
}

impl fmt::Display for ScaleKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

impl FromStr for ScaleKernel {
    type Err = ConfigError;

    /// Accepts the entry point name or the short form (`scale_to_fit`, `passthrough`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| {
                let entry = k.entry_point();
                entry == wanted || entry.strip_suffix("_kernel") == Some(wanted.as_str())
            })
            .ok_or_else(|| ConfigError::UnknownKernel(s.to_string()))
    }
}

/// Device facts that decide threadgroup geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Preferred number of threads executing in lockstep
    pub execution_width: u32,
    /// Maximum invocations in one threadgroup
    pub max_threads_per_group: u32,
    pub max_group_width: u32,
    pub max_group_height: u32,
}

/// Threads per group for one stage. The depth is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadgroupGeometry {
    pub width: u32,
    pub height: u32,
}

impl ThreadgroupGeometry {
    /// `execution_width` wide and as tall as the per-group budget allows.
    pub fn for_device(limits: &DeviceLimits) -> Self {
        let max_threads = limits.max_threads_per_group.max(1);
        let width = limits
            .execution_width
            .clamp(1, limits.max_group_width.max(1))
            .min(max_threads);
        let height = (max_threads / width).clamp(1, limits.max_group_height.max(1));
        Self { width, height }
    }

    /// Groups needed to cover a `width` x `height` grid, one thread per pixel.
    pub fn groups_for(&self, width: u32, height: u32) -> (u32, u32, u32) {
        (width.div_ceil(self.width), height.div_ceil(self.height), 1)
    }
}

/// Compiles bundle kernels into pipeline objects for a particular device.
pub trait PipelineCompiler {
    type Pipeline;

    fn limits(&self) -> DeviceLimits;

    fn compile(
        &self,
        kernel: &KernelEntry<'_>,
        geometry: ThreadgroupGeometry,
    ) -> Result<Self::Pipeline, ConfigError>;
}

/// A compiled kernel ready for dispatch. Replaced, never mutated.
#[derive(Debug)]
pub struct Stage<P> {
    name: &'static str,
    geometry: ThreadgroupGeometry,
    pipeline: P,
}

impl<P> Stage<P> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn geometry(&self) -> ThreadgroupGeometry {
        self.geometry
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }
}
