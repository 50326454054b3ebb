//! Webcam capture and the serialized frame delivery queue.

#[cfg(feature = "camera")]
mod nokhwa_backend;

#[cfg(feature = "camera")]
pub use nokhwa_backend::{AsyncCapture, NokhwaCapture};

use crate::error::CaptureError;
use crate::frame::{Frame, MediaTime, PixelBuffer};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Timescale of capture timestamps.
pub const CAPTURE_TIMESCALE: u32 = 90_000;

/// Receives frames from the delivery queue, one at a time, in capture order.
pub trait FrameHandler {
    fn on_frame(&mut self, frame: &Frame);

    /// A frame that could not be displayed in time. Same shape as `on_frame`.
    fn on_frame_dropped(&mut self, frame: &Frame);
}

/// Starts and stops frame production.
pub trait FrameSource {
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Stops future deliveries. Frames already queued are still drained.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Trait for webcam capture backends.
pub trait CaptureBackend {
    /// Returns a list of available camera devices.
    fn list_devices() -> Result<Vec<CameraInfo>>
    where
        Self: Sized;

    /// Opens the camera with the specified configuration.
    fn open(config: &CaptureConfig) -> Result<Self>
    where
        Self: Sized;

    /// Captures a single frame from the camera.
    fn capture_frame(&mut self) -> Result<PixelBuffer>;

    /// Returns the current frame dimensions.
    fn frame_size(&self) -> (u32, u32);
}

/// Information about a camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
}

/// Configuration for camera capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera device index
    pub device_index: u32,
    /// Desired frame width
    pub width: u32,
    /// Desired frame height
    pub height: u32,
    /// Desired frame rate
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

impl CaptureConfig {
    /// Nominal time between frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.fps.max(1) as u64)
    }
}

/// Turns capture instants into monotonic presentation timestamps.
#[derive(Debug, Clone)]
pub struct CaptureClock {
    start: Instant,
    last: i64,
}

impl CaptureClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self { start, last: 0 }
    }

    /// Timestamp for a frame captured at `at`. Never smaller than the previous one.
    pub fn stamp(&mut self, at: Instant) -> MediaTime {
        let nanos = at.saturating_duration_since(self.start).as_nanos();
        let ticks = (nanos * CAPTURE_TIMESCALE as u128 / 1_000_000_000) as i64;
        self.last = self.last.max(ticks);
        MediaTime::new(self.last, CAPTURE_TIMESCALE)
    }
}

impl Default for CaptureClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame waiting in the delivery queue.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: Frame,
    pub captured_at: Instant,
}

/// How a drained frame is handed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    OnTime,
    /// Recorded, not displayed
    Late,
}

/// A frame is late if a newer one is already pending or it waited longer
/// than one frame interval.
pub fn classify(captured_at: Instant, now: Instant, interval: Duration, superseded: bool) -> Delivery {
    if superseded || now.saturating_duration_since(captured_at) > interval {
        Delivery::Late
    } else {
        Delivery::OnTime
    }
}

/// Consumer side of the capture channel. Drained from one thread only.
pub struct DeliveryQueue {
    rx: mpsc::Receiver<CapturedFrame>,
    interval: Duration,
}

impl DeliveryQueue {
    /// Creates the channel capture threads send into.
    pub fn channel(interval: Duration) -> (mpsc::Sender<CapturedFrame>, DeliveryQueue) {
        let (tx, rx) = mpsc::channel();
        (tx, DeliveryQueue { rx, interval })
    }

    /// Delivers every pending frame in order. Returns how many were displayed.
    pub fn drain(&self, now: Instant, handler: &mut impl FrameHandler) -> usize {
        let pending: Vec<CapturedFrame> = self.rx.try_iter().collect();
        let newest = pending.len().saturating_sub(1);
        let mut on_time = 0;
        for (i, captured) in pending.into_iter().enumerate() {
            match classify(captured.captured_at, now, self.interval, i < newest) {
                Delivery::OnTime => {
                    on_time += 1;
                    handler.on_frame(&captured.frame);
                }
                Delivery::Late => handler.on_frame_dropped(&captured.frame),
            }
        }
        on_time
    }
}
