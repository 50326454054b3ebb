//! Error kinds, split by how the pipeline reacts to them.
//!
//! - [`ConfigError`] means the build artifact or the GPU setup is unusable.
//!   Nothing downstream tries to run degraded; callers abort.
//! - [`FrameError`] covers a single frame that could not be displayed. The
//!   coordinator logs and drops it; the next frame is unaffected.
//! - [`CaptureError`] is reported to whoever started capture.
//! - [`RecordingError`] is reported to whoever toggled recording. The sink is
//!   left idle and the toggle can be retried.

use crate::frame::PixelFormat;

/// Unrecoverable configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("shader bundle failed to parse: {0}")]
    BundleParse(String),

    #[error("shader bundle failed validation: {0}")]
    BundleValidation(String),

    #[error("kernel `{0}` is not in the shader bundle")]
    MissingKernel(String),

    #[error("entry point `{0}` is not a compute kernel")]
    NotCompute(String),

    #[error("pipeline for kernel `{kernel}` failed to compile: {message}")]
    PipelineCompile { kernel: String, message: String },

    #[error("unknown scale kernel `{0}`")]
    UnknownKernel(String),

    #[error("scale kernel index {0} is out of range")]
    KernelIndex(usize),

    #[error("no compatible GPU adapter: {0}")]
    NoAdapter(String),

    #[error("GPU device request failed: {0}")]
    Device(String),

    #[error("display surface unusable: {0}")]
    Surface(String),
}

/// Reasons a single frame was not presented.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("no drawable available")]
    NoDrawable,

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("no scale stage active")]
    NoScaleStage,

    #[error("command encoder unavailable: {0}")]
    Encoder(String),
}

/// Failures turning a frame into a GPU texture.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("pixel format mismatch: frame is {actual:?}, texture wants {expected:?}")]
    FormatMismatch {
        expected: wgpu::TextureFormat,
        actual: PixelFormat,
    },

    #[error("frame has zero width or height")]
    EmptyFrame,

    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("{width}x{height} exceeds the device texture limit of {max}")]
    ExceedsLimits { width: u32, height: u32, max: u32 },
}

/// Failures bringing up the frame source.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture is already running")]
    AlreadyRunning,

    #[error("failed to open camera: {0}")]
    Open(String),

    #[error("failed to spawn capture thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Session-level recording failures.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("a recording session is already active")]
    AlreadyRecording,

    #[error("no recording session is active")]
    NotRecording,

    #[error("the previous recording is still being finalized")]
    StillFinalizing,

    #[error("failed to remove previous recording: {0}")]
    RemoveExisting(#[source] std::io::Error),

    #[error("failed to create output container: {0}")]
    CreateContainer(#[source] std::io::Error),

    #[error("failed to add video track: {0}")]
    AddTrack(String),

    #[error("failed to write frame: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to finalize recording: {0}")]
    Finalize(String),

    #[error("recording writer exited unexpectedly")]
    WriterGone,
}
