//! Compute pipeline creation for bundle kernels.

use crate::error::ConfigError;
use crate::shader::{DeviceLimits, KernelEntry, PipelineCompiler, ThreadgroupGeometry};
use std::borrow::Cow;
use tracing::debug;

/// Layout every kernel in the bundle is written against:
/// input texture, output storage texture, effect uniforms, sampler.
#[derive(Clone)]
pub struct KernelLayout {
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub pipeline_layout: wgpu::PipelineLayout,
}

/// Output format of every kernel. Matches the storage texture in the bundle.
pub const KERNEL_OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

impl KernelLayout {
    pub fn new(device: &wgpu::Device) -> Self {
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Kernel Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: KERNEL_OUTPUT_FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Kernel Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        Self {
            bind_group_layout,
            pipeline_layout,
        }
    }
}

/// Builds compute pipelines on a wgpu device.
///
/// The bundle is validated by naga before it gets here, so pipeline creation
/// only fails on device-level problems, which wgpu reports as fatal.
pub struct WgpuCompiler {
    device: wgpu::Device,
    layout: KernelLayout,
    limits: DeviceLimits,
}

impl WgpuCompiler {
    pub fn new(device: wgpu::Device, layout: KernelLayout, limits: DeviceLimits) -> Self {
        Self {
            device,
            layout,
            limits,
        }
    }
}

impl PipelineCompiler for WgpuCompiler {
    type Pipeline = wgpu::ComputePipeline;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn compile(
        &self,
        kernel: &KernelEntry<'_>,
        geometry: ThreadgroupGeometry,
    ) -> Result<wgpu::ComputePipeline, ConfigError> {
        if geometry.width * geometry.height > self.limits.max_threads_per_group {
            return Err(ConfigError::PipelineCompile {
                kernel: kernel.name.to_string(),
                message: format!(
                    "{}x{} threadgroup exceeds {} invocations",
                    geometry.width, geometry.height, self.limits.max_threads_per_group
                ),
            });
        }

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.name),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(kernel.source)),
        });

        let constants = [
            ("WG_X", geometry.width as f64),
            ("WG_Y", geometry.height as f64),
        ];
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.name),
            layout: Some(&self.layout.pipeline_layout),
            module: &module,
            entry_point: Some(kernel.name),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });
        debug!(kernel = kernel.name, "Created compute pipeline");
        Ok(pipeline)
    }
}
