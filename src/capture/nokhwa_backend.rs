//! Nokhwa-based webcam capture backend.

use super::{
    CameraInfo, CaptureBackend, CaptureClock, CaptureConfig, CapturedFrame, FrameSource,
};
use crate::error::CaptureError;
use crate::frame::{Frame, PixelBuffer};
use anyhow::Result;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Webcam capture using the nokhwa library.
pub struct NokhwaCapture {
    camera: Camera,
    width: u32,
    height: u32,
}

/// The requested format first, then common modes from large to small.
///
/// macOS built-in cameras usually lack MJPEG, USB webcams usually need it
/// for high resolutions, so uncompressed formats are tried before MJPEG.
fn seed_formats(config: &CaptureConfig) -> Vec<CameraFormat> {
    const FORMATS: [FrameFormat; 3] = [FrameFormat::NV12, FrameFormat::YUYV, FrameFormat::MJPEG];
    let requested = FORMATS.map(|f| {
        CameraFormat::new(Resolution::new(config.width, config.height), f, config.fps)
    });
    let common = [(1920, 1080), (1280, 720)]
        .into_iter()
        .flat_map(|(w, h)| [30, 25, 15].map(move |fps| (w, h, fps)))
        .chain([(640, 480, 30)])
        .flat_map(|(w, h, fps)| FORMATS.map(|f| CameraFormat::new(Resolution::new(w, h), f, fps)));
    requested.into_iter().chain(common).collect()
}

/// Exact match for the request if the device has one, otherwise the largest
/// and fastest mode, preferring NV12 over YUYV over MJPEG on ties.
fn pick_format(supported: &[CameraFormat], config: &CaptureConfig) -> Option<CameraFormat> {
    let exact = supported.iter().find(|f| {
        f.width() == config.width && f.height() == config.height && f.frame_rate() == config.fps
    });
    if let Some(format) = exact {
        return Some(*format);
    }
    supported.iter().copied().max_by_key(|f| {
        let format_rank = match f.format() {
            FrameFormat::NV12 => 3,
            FrameFormat::YUYV => 2,
            FrameFormat::MJPEG => 1,
            _ => 0,
        };
        (f.width() as u64 * f.height() as u64, f.frame_rate(), format_rank)
    })
}

impl CaptureBackend for NokhwaCapture {
    fn list_devices() -> Result<Vec<CameraInfo>> {
        let devices = nokhwa::query(nokhwa::utils::ApiBackend::Auto)?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo {
                index: d.index().as_index().unwrap_or(0),
                name: d.human_name().to_string(),
            })
            .collect())
    }

    fn open(config: &CaptureConfig) -> Result<Self> {
        // Creating the camera object is not enough for some drivers; the
        // stream has to open too.
        let mut opened = None;
        for seed in seed_formats(config) {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
            let Ok(mut cam) = Camera::new(CameraIndex::Index(config.device_index), requested) else {
                continue;
            };
            if cam.open_stream().is_ok() {
                debug!("Verified connection with seed format: {:?}", seed);
                opened = Some((cam, seed));
                break;
            }
        }
        let (mut camera, seed) = opened.ok_or_else(|| {
            anyhow::anyhow!(
                "Could not open a stream on camera index {} with any standard format",
                config.device_index
            )
        })?;

        match camera.compatible_camera_formats() {
            Ok(supported) if !supported.is_empty() => {
                if let Some(better) = pick_format(&supported, config).filter(|f| *f != seed) {
                    info!("Switching to camera format: {:?}", better);
                    let _ = camera.stop_stream();
                    let upgraded = camera
                        .set_camera_requset(RequestedFormat::new::<RgbFormat>(
                            RequestedFormatType::Closest(better),
                        ))
                        .is_ok()
                        && camera.open_stream().is_ok();
                    if !upgraded {
                        warn!("Failed to open stream with {:?}, reverting to seed format", better);
                        let _ = camera.set_camera_requset(RequestedFormat::new::<RgbFormat>(
                            RequestedFormatType::Closest(seed),
                        ));
                        camera.open_stream()?;
                    }
                }
            }
            _ => warn!("Device reported no supported formats; keeping seed format"),
        }

        let resolution = camera.resolution();
        info!("Camera opened with resolution: {}", resolution);

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
        })
    }

    fn capture_frame(&mut self) -> Result<PixelBuffer> {
        let frame = self.camera.frame()?;
        let decoded = frame.decode_image::<RgbFormat>()?;
        Ok(PixelBuffer::from_rgb(decoded.width(), decoded.height(), decoded.as_raw())?)
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Runs a [`NokhwaCapture`] on its own thread and feeds the delivery queue.
///
/// The camera is opened on the capture thread since some platform backends
/// cannot move a camera between threads.
pub struct AsyncCapture {
    config: CaptureConfig,
    tx: mpsc::Sender<CapturedFrame>,
    clock_start: Instant,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncCapture {
    pub fn new(config: CaptureConfig, tx: mpsc::Sender<CapturedFrame>) -> Self {
        Self {
            config,
            tx,
            clock_start: Instant::now(),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

fn capture_loop(
    mut camera: NokhwaCapture,
    mut clock: CaptureClock,
    tx: mpsc::Sender<CapturedFrame>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        match camera.capture_frame() {
            Ok(buffer) => {
                let captured_at = Instant::now();
                let frame = Frame::new(buffer, clock.stamp(captured_at));
                if tx.send(CapturedFrame { frame, captured_at }).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Frame capture failed: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!("Capture thread exiting");
}

impl FrameSource for AsyncCapture {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.is_running() {
            return Err(CaptureError::AlreadyRunning);
        }
        self.running.store(true, Ordering::Release);

        let (ready_tx, ready_rx) = mpsc::channel();
        let config = self.config.clone();
        let tx = self.tx.clone();
        let running = self.running.clone();
        // one clock origin for every run keeps timestamps increasing across restarts
        let clock = CaptureClock::starting_at(self.clock_start);
        let handle = thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || match NokhwaCapture::open(&config) {
                Ok(camera) => {
                    let _ = ready_tx.send(Ok(camera.frame_size()));
                    capture_loop(camera, clock, tx, running);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                }
            })
            .map_err(CaptureError::Thread)?;

        let failure = match ready_rx.recv() {
            Ok(Ok((width, height))) => {
                info!(width, height, "Capture started");
                self.handle = Some(handle);
                return Ok(());
            }
            Ok(Err(message)) => message,
            Err(_) => "capture thread exited before opening the camera".to_string(),
        };
        self.running.store(false, Ordering::Release);
        let _ = handle.join();
        Err(CaptureError::Open(failure))
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
            info!("Capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::Acquire)
    }
}

impl Drop for AsyncCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
