//! wgpu device, kernel compilation and presentation.

mod backend;
mod bridge;
mod compiler;
mod context;
mod display;

pub use backend::WgpuBackend;
pub use bridge::{validate, TextureBridge};
pub use compiler::{KernelLayout, WgpuCompiler, KERNEL_OUTPUT_FORMAT};
pub use context::GpuContext;
pub use display::{Drawable, WindowDisplay};
