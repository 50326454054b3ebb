//! Frame payloads, presentation time and pixel conversions.

use crate::error::BridgeError;
use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::ops::Sub;
use std::sync::Arc;

/// Rational presentation time: `value / timescale` seconds.
///
/// Comparisons are exact across timescales.
#[derive(Debug, Clone, Copy)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

impl MediaTime {
    pub const fn new(value: i64, timescale: u32) -> Self {
        // A zero timescale has no meaning; treat it as seconds.
        let timescale = if timescale == 0 { 1 } else { timescale };
        Self { value, timescale }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.value as f64 / self.timescale as f64
    }

    /// Value expressed in another timescale, rounded toward negative infinity.
    pub fn rescale(&self, timescale: u32) -> i64 {
        if timescale == self.timescale {
            return self.value;
        }
        let scaled = self.value as i128 * timescale as i128;
        scaled.div_euclid(self.timescale as i128) as i64
    }

    fn cross(&self, other: &Self) -> (i128, i128) {
        (
            self.value as i128 * other.timescale as i128,
            other.value as i128 * self.timescale as i128,
        )
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = self.cross(other);
        a == b
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = self.cross(other);
        a.cmp(&b)
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    /// Exact difference in the least common multiple of both timescales.
    /// Only when that multiple overflows `u32` does it fall back to the finer
    /// timescale, rounding down.
    fn sub(self, rhs: MediaTime) -> MediaTime {
        let timescale = lcm(self.timescale, rhs.timescale).unwrap_or(self.timescale.max(rhs.timescale));
        MediaTime::new(self.rescale(timescale) - rhs.rescale(timescale), timescale)
    }
}

fn lcm(a: u32, b: u32) -> Option<u32> {
    let (mut x, mut y) = (a, b);
    while y != 0 {
        (x, y) = (y, x % y);
    }
    u32::try_from(a as u64 / x as u64 * b as u64).ok()
}

/// Pixel layouts a [`PixelBuffer`] can carry. Both are 8 bits per channel, 4 bytes per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// B G R A byte order (the camera's native layout)
    Bgra8,
    /// R G B A byte order
    Rgba8,
}

impl PixelFormat {
    pub const BYTES_PER_PIXEL: usize = 4;

    /// The matching sampleable GPU texture format.
    pub fn texture_format(&self) -> wgpu::TextureFormat {
        match self {
            PixelFormat::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
            PixelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// Immutable image memory shared by every consumer of a frame.
#[derive(Debug)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    bytes_per_row: usize,
    format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wraps BGRA pixels whose rows are `bytes_per_row` apart.
    pub fn new(
        width: u32,
        height: u32,
        bytes_per_row: usize,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, BridgeError> {
        if width == 0 || height == 0 {
            return Err(BridgeError::EmptyFrame);
        }
        let min_row = width as usize * PixelFormat::BYTES_PER_PIXEL;
        if bytes_per_row < min_row {
            return Err(BridgeError::BufferTooSmall {
                need: min_row,
                have: bytes_per_row,
            });
        }
        let need = bytes_per_row * (height as usize - 1) + min_row;
        if data.len() < need {
            return Err(BridgeError::BufferTooSmall {
                need,
                have: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            bytes_per_row,
            format,
            data,
        })
    }

    /// Tightly packed BGRA pixels.
    pub fn from_bgra(width: u32, height: u32, data: Vec<u8>) -> Result<Self, BridgeError> {
        Self::new(
            width,
            height,
            width as usize * PixelFormat::BYTES_PER_PIXEL,
            PixelFormat::Bgra8,
            data,
        )
    }

    /// Converts packed 24-bit RGB (what most webcam decoders hand out) to BGRA.
    pub fn from_rgb(width: u32, height: u32, rgb: &[u8]) -> Result<Self, BridgeError> {
        let pixel_count = width as usize * height as usize;
        if rgb.len() < pixel_count * 3 {
            return Err(BridgeError::BufferTooSmall {
                need: pixel_count * 3,
                have: rgb.len(),
            });
        }
        let mut bgra = vec![0u8; pixel_count * 4];
        for (dst, src) in bgra.chunks_exact_mut(4).zip(rgb.chunks_exact(3)) {
            dst[0] = src[2];
            dst[1] = src[1];
            dst[2] = src[0];
            dst[3] = 255;
        }
        Self::from_bgra(width, height, bgra)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_row(&self) -> usize {
        self.bytes_per_row
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pixel rows without stride padding. Borrows when already packed.
    pub fn packed(&self) -> Cow<'_, [u8]> {
        let row = self.width as usize * PixelFormat::BYTES_PER_PIXEL;
        if row == self.bytes_per_row {
            return Cow::Borrowed(&self.data[..row * self.height as usize]);
        }
        let mut packed = Vec::with_capacity(row * self.height as usize);
        for y in 0..self.height as usize {
            let start = y * self.bytes_per_row;
            packed.extend_from_slice(&self.data[start..start + row]);
        }
        Cow::Owned(packed)
    }
}

/// One captured image and its presentation time.
///
/// Cloning is cheap: the display path and the recording path hold read-only
/// views over the same [`PixelBuffer`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub buffer: Arc<PixelBuffer>,
    pub pts: MediaTime,
}

impl Frame {
    pub fn new(buffer: PixelBuffer, pts: MediaTime) -> Self {
        Self {
            buffer: Arc::new(buffer),
            pts,
        }
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Vertices for a full-screen quad.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}
