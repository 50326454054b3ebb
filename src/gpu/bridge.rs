//! Frame pixels to sampleable GPU textures.

use crate::error::BridgeError;
use crate::frame::{Frame, PixelBuffer};
use tracing::debug;

/// Checks a buffer can back a texture of `expected` format on this device.
pub fn validate(buffer: &PixelBuffer, expected: wgpu::TextureFormat, max_dimension: u32) -> Result<(), BridgeError> {
    if buffer.width() == 0 || buffer.height() == 0 {
        return Err(BridgeError::EmptyFrame);
    }
    if buffer.format().texture_format() != expected {
        return Err(BridgeError::FormatMismatch {
            expected,
            actual: buffer.format(),
        });
    }
    if buffer.width() > max_dimension || buffer.height() > max_dimension {
        return Err(BridgeError::ExceedsLimits {
            width: buffer.width(),
            height: buffer.height(),
            max: max_dimension,
        });
    }
    Ok(())
}

/// Keeps one input texture alive across frames and refreshes its contents
/// from each frame's buffer. The texture is recreated only when the frame
/// size changes.
pub struct TextureBridge {
    device: wgpu::Device,
    queue: wgpu::Queue,
    format: wgpu::TextureFormat,
    max_dimension: u32,
    cached: Option<wgpu::Texture>,
}

impl TextureBridge {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let max_dimension = device.limits().max_texture_dimension_2d;
        Self {
            device,
            queue,
            format: wgpu::TextureFormat::Bgra8Unorm,
            max_dimension,
            cached: None,
        }
    }

    fn texture_for_size(&mut self, width: u32, height: u32) -> wgpu::Texture {
        if let Some(texture) = &self.cached {
            if texture.width() == width && texture.height() == height {
                return texture.clone();
            }
        }
        debug!(width, height, "Allocating input texture");
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Input Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.cached = Some(texture.clone());
        texture
    }

    /// Texture holding `frame`'s pixels, valid for this frame's commands.
    pub fn texture(&mut self, frame: &Frame) -> Result<wgpu::Texture, BridgeError> {
        let buffer = &frame.buffer;
        validate(buffer, self.format, self.max_dimension)?;

        let texture = self.texture_for_size(buffer.width(), buffer.height());
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            buffer.data(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(buffer.bytes_per_row() as u32),
                rows_per_image: Some(buffer.height()),
            },
            wgpu::Extent3d {
                width: buffer.width(),
                height: buffer.height(),
                depth_or_array_layers: 1,
            },
        );
        Ok(texture)
    }
}
