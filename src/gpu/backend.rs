//! wgpu implementation of the compositor's backend.

use super::bridge::TextureBridge;
use super::compiler::{KernelLayout, KERNEL_OUTPUT_FORMAT};
use super::display::{Drawable, WindowDisplay};
use super::GpuContext;
use crate::compositor::{ComputeBackend, EffectParams, Pass, PassOutput};
use crate::error::{BridgeError, FrameError};
use crate::frame::Frame;
use std::iter;
use tracing::debug;

/// Number of passes a frame can encode. Each gets its own uniform buffer so
/// the second write does not clobber the first before submission.
const MAX_PASSES: usize = 2;

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bridge: TextureBridge,
    display: WindowDisplay,
    layout: KernelLayout,
    sampler: wgpu::Sampler,
    uniforms: [wgpu::Buffer; MAX_PASSES],
    pass_index: usize,
    intermediate: Option<wgpu::Texture>,
}

impl WgpuBackend {
    pub fn new(context: &GpuContext, display: WindowDisplay, layout: KernelLayout) -> Self {
        let device = context.device.clone();
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Kernel Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let uniforms = [0, 1].map(|i| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(if i == 0 { "Pass 0 Uniforms" } else { "Pass 1 Uniforms" }),
                size: std::mem::size_of::<EffectParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        Self {
            bridge: TextureBridge::new(device.clone(), context.queue.clone()),
            queue: context.queue.clone(),
            device,
            display,
            layout,
            sampler,
            uniforms,
            pass_index: 0,
            intermediate: None,
        }
    }

    pub fn display(&self) -> &WindowDisplay {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut WindowDisplay {
        &mut self.display
    }
}

impl ComputeBackend for WgpuBackend {
    type Pipeline = wgpu::ComputePipeline;
    type Texture = wgpu::Texture;
    type Drawable = Drawable;
    type Commands = wgpu::CommandEncoder;

    fn next_drawable(&mut self) -> Option<Drawable> {
        self.display.acquire()
    }

    fn drawable_size(&self, drawable: &Drawable) -> (u32, u32) {
        drawable.size()
    }

    fn bridge_texture(&mut self, frame: &Frame) -> Result<wgpu::Texture, BridgeError> {
        self.bridge.texture(frame)
    }

    fn intermediate_texture(&mut self, width: u32, height: u32) -> wgpu::Texture {
        if let Some(texture) = self
            .intermediate
            .as_ref()
            .filter(|t| t.width() == width && t.height() == height)
        {
            return texture.clone();
        }
        debug!(width, height, "Allocating intermediate texture");
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Intermediate Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: KERNEL_OUTPUT_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        self.intermediate = Some(texture.clone());
        texture
    }

    fn begin_commands(&mut self) -> Result<wgpu::CommandEncoder, FrameError> {
        self.pass_index = 0;
        Ok(self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            }))
    }

    fn encode_pass(&mut self, encoder: &mut wgpu::CommandEncoder, pass: Pass<'_, Self>) {
        let uniforms = &self.uniforms[self.pass_index.min(MAX_PASSES - 1)];
        self.pass_index += 1;
        self.queue
            .write_buffer(uniforms, 0, bytemuck::bytes_of(&pass.params));

        let output = match pass.output {
            PassOutput::Intermediate(texture) => texture,
            PassOutput::Display(drawable) => &drawable.target,
        };
        let input_view = pass.input.create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(pass.stage.name()),
            layout: &self.layout.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let (x, y, z) = pass.groups;
        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(pass.stage.name()),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(pass.stage.pipeline());
        compute_pass.set_bind_group(0, &bind_group, &[]);
        compute_pass.dispatch_workgroups(x, y, z);
    }

    fn present(&mut self, mut encoder: wgpu::CommandEncoder, drawable: Drawable) {
        self.display.encode_blit(&mut encoder, &drawable);
        self.queue.submit(iter::once(encoder.finish()));
        drawable.surface.present();
    }
}
