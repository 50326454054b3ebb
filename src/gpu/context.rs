//! Shared GPU context for wgpu resources.

use crate::error::ConfigError;
use crate::shader::DeviceLimits;
use std::sync::Arc;
use winit::window::Window;

/// GPU resources shared by kernel compilation, frame upload and presentation.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Initializes a device that can present to `window`.
    pub fn for_window(window: Arc<Window>) -> Result<(Self, wgpu::Surface<'static>), ConfigError> {
        let instance = Self::instance();
        let surface = instance
            .create_surface(window)
            .map_err(|e| ConfigError::Surface(e.to_string()))?;
        let context = Self::with_instance(instance, &surface)?;
        Ok((context, surface))
    }

    fn instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        })
    }

    fn with_instance(
        instance: wgpu::Instance,
        surface: &wgpu::Surface<'static>,
    ) -> Result<Self, ConfigError> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| ConfigError::NoAdapter(format!("{:?}", e)))?;

        let info = adapter.get_info();
        tracing::info!(adapter = %info.name, backend = ?info.backend, "Using GPU adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Retrocam Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| ConfigError::Device(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            instance,
            adapter,
        })
    }

    /// Threadgroup facts for kernel geometry.
    ///
    /// wgpu does not expose the SIMD width, so `execution_width` comes from
    /// configuration.
    pub fn device_limits(&self, execution_width: u32) -> DeviceLimits {
        let limits = self.device.limits();
        DeviceLimits {
            execution_width,
            max_threads_per_group: limits.max_compute_invocations_per_workgroup,
            max_group_width: limits.max_compute_workgroup_size_x,
            max_group_height: limits.max_compute_workgroup_size_y,
        }
    }
}
