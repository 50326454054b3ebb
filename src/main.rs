//! Retrocam: webcam preview with retro effects and one-key recording.

use anyhow::Result;
use clap::Parser;
use retrocam::capture::{AsyncCapture, CaptureBackend, DeliveryQueue, NokhwaCapture};
use retrocam::compositor::Compositor;
use retrocam::config::{Config, ConfigWatcher};
use retrocam::coordinator::{PipelineCoordinator, RecordingToggle};
use retrocam::error::ConfigError;
use retrocam::gpu::{GpuContext, KernelLayout, WgpuBackend, WgpuCompiler, WindowDisplay};
use retrocam::recording::{RecordingBackend, RecordingSink};
use retrocam::shader::{ProgramBundle, ScaleKernel, ShaderRegistry};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

type AppCoordinator = PipelineCoordinator<WgpuBackend, WgpuCompiler, RecordingBackend, AsyncCapture>;

/// Real-time camera effects with synchronized recording.
#[derive(Parser, Debug)]
#[command(name = "retrocam")]
#[command(about = "Preview a webcam through GPU effects and record the result")]
struct Args {
    /// YAML config file, watched for effect changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera device index
    #[arg(short, long)]
    input: Option<u32>,

    /// Capture width
    #[arg(long)]
    width: Option<u32>,

    /// Capture height
    #[arg(long)]
    height: Option<u32>,

    /// Capture frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Initial scale kernel (scale, scale_to_fit, scale_to_fill, passthrough)
    #[arg(short, long)]
    kernel: Option<ScaleKernel>,

    /// Start with the VHS degradation effect on
    #[arg(long)]
    vhs: bool,

    /// Recording output path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(input) = self.input {
            config.capture.device_index = input;
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(kernel) = self.kernel {
            config.effects.scale_kernel = kernel;
        }
        if self.vhs {
            config.effects.degradation = true;
        }
        if let Some(output) = &self.output {
            config.recording.path = output.clone();
        }
    }
}

/// Application state for the event loop.
struct RetrocamApp {
    config: Config,
    config_path: Option<PathBuf>,
    window: Option<Arc<Window>>,
    gpu: Option<GpuContext>,
    coordinator: Option<AppCoordinator>,
    queue: Option<DeliveryQueue>,
    watcher: Option<ConfigWatcher>,
    shutdown: Arc<AtomicBool>,
    finalizers: Vec<JoinHandle<()>>,
    fatal: Option<anyhow::Error>,
}

impl RetrocamApp {
    fn new(config: Config, config_path: Option<PathBuf>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            config,
            config_path,
            window: None,
            gpu: None,
            coordinator: None,
            queue: None,
            watcher: None,
            shutdown,
            finalizers: Vec::new(),
            fatal: None,
        }
    }

    fn initialize(&mut self, window: Arc<Window>) -> Result<()> {
        let (gpu, surface) = GpuContext::for_window(window.clone())?;
        let display = WindowDisplay::new(&gpu, surface, &window)?;
        let layout = KernelLayout::new(&gpu.device);
        let limits = gpu.device_limits(self.config.effects.execution_width);
        let compiler = WgpuCompiler::new(gpu.device.clone(), layout.clone(), limits);
        let registry = ShaderRegistry::new(compiler, ProgramBundle::builtin()?);
        let backend = WgpuBackend::new(&gpu, display, layout);

        let recording = &self.config.recording;
        let sink = RecordingSink::new(recording.backend, recording.path.clone(), recording.target());
        let (tx, queue) = DeliveryQueue::channel(self.config.capture.frame_interval());
        let source = AsyncCapture::new(self.config.capture.clone(), tx);

        let mut coordinator =
            PipelineCoordinator::new(registry, Compositor::new(backend), sink, source)?;
        coordinator.select_scale_kernel(self.config.effects.scale_kernel)?;
        coordinator.set_degradation(self.config.effects.degradation)?;

        info!("Opening camera device {}...", self.config.capture.device_index);
        coordinator.start_capture()?;

        self.watcher = self
            .config_path
            .clone()
            .and_then(|path| ConfigWatcher::new(path, self.config.effects.clone()));
        self.coordinator = Some(coordinator);
        self.queue = Some(queue);
        self.gpu = Some(gpu);
        Ok(())
    }

    /// Effect changes that fail to compile are fatal: the bundle is broken.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: ConfigError) {
        error!("Unrecoverable shader configuration error: {}", e);
        self.fatal = Some(e.into());
        event_loop.exit();
    }

    fn update_title(&self) {
        let (Some(window), Some(coordinator)) = (&self.window, &self.coordinator) else {
            return;
        };
        let state = if coordinator.is_recording() {
            "[REC]"
        } else {
            "Preview"
        };
        window.set_title(&format!("{} - {}", self.config.window.title, state));
    }

    fn toggle_recording(&mut self) {
        let Some(coordinator) = &mut self.coordinator else {
            return;
        };
        match coordinator.toggle_recording() {
            Ok(RecordingToggle::Started) => info!("Recording to {:?}", self.config.recording.path),
            Ok(RecordingToggle::Stopped(finalizing)) => {
                let spawned = thread::Builder::new()
                    .name("recording-finalize".to_string())
                    .spawn(move || match pollster::block_on(finalizing) {
                        Ok(summary) => info!(
                            frames = summary.frames,
                            path = %summary.path.display(),
                            "Recording saved"
                        ),
                        Err(e) => error!("Recording finalization failed: {}", e),
                    });
                match spawned {
                    Ok(handle) => self.finalizers.push(handle),
                    Err(e) => error!("Failed to spawn finalization thread: {}", e),
                }
            }
            Err(e) => error!("Recording toggle failed: {}", e),
        }
        self.update_title();
    }

    fn toggle_capture(&mut self) {
        let Some(coordinator) = &mut self.coordinator else {
            return;
        };
        if coordinator.is_capturing() {
            coordinator.stop_capture();
        } else if let Err(e) = coordinator.start_capture() {
            error!("Failed to resume capture: {}", e);
        }
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, key: &Key) {
        let result = match key {
            Key::Named(NamedKey::Escape) => {
                event_loop.exit();
                Ok(())
            }
            Key::Named(NamedKey::Space) => {
                self.toggle_capture();
                Ok(())
            }
            Key::Character(c) => match c.as_str() {
                "1" | "2" | "3" => {
                    let index = c.as_str().parse::<usize>().unwrap_or(1) - 1;
                    match &mut self.coordinator {
                        Some(coordinator) => coordinator.select_scale_effect(index),
                        None => Ok(()),
                    }
                }
                "v" | "V" => match &mut self.coordinator {
                    Some(coordinator) => coordinator.toggle_degradation_effect().map(|_| ()),
                    None => Ok(()),
                },
                "r" | "R" => {
                    self.toggle_recording();
                    Ok(())
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    fn apply_config_changes(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(watcher), Some(coordinator)) = (&mut self.watcher, &mut self.coordinator) else {
            return;
        };
        let Some(change) = watcher.check_for_changes() else {
            return;
        };
        let mut result = Ok(());
        if let Some(kernel) = change.scale_kernel {
            info!(kernel = %kernel, "Applying scale kernel from config");
            result = coordinator.select_scale_kernel(kernel);
        }
        if let (Ok(()), Some(enabled)) = (&result, change.degradation) {
            info!(enabled, "Applying degradation setting from config");
            result = coordinator.set_degradation(enabled);
        }
        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    fn drain_frames(&mut self) {
        if let (Some(queue), Some(coordinator)) = (&self.queue, &mut self.coordinator) {
            queue.drain(Instant::now(), coordinator);
        }
    }

    /// Stops capture, finalizes an active recording and waits for every
    /// pending finalization.
    fn finish(&mut self) {
        if let Some(coordinator) = &mut self.coordinator {
            coordinator.stop_capture();
            if coordinator.is_recording() {
                self.toggle_recording();
            }
        }
        for handle in self.finalizers.drain(..) {
            if handle.join().is_err() {
                warn!("Finalization thread panicked");
            }
        }
    }
}

impl ApplicationHandler for RetrocamApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attrs = WindowAttributes::default()
            .with_title(self.config.window.title.clone())
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };
        self.window = Some(window.clone());

        match self.initialize(window) {
            Ok(()) => {
                info!("Pipeline ready. Keys: 1-3 scale, V vhs, R record, Space pause, Esc quit");
                self.update_title();
            }
            Err(e) => {
                error!("Initialization error: {:#}", e);
                self.fatal = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(coordinator) = &mut self.coordinator {
                    coordinator
                        .compositor_mut()
                        .backend_mut()
                        .display_mut()
                        .resize(size);
                }
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed && !event.repeat =>
            {
                self.handle_key(event_loop, &event.logical_key);
            }
            WindowEvent::RedrawRequested => {
                self.drain_frames();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.shutdown.load(Ordering::SeqCst) {
            info!("Received interrupt signal, shutting down...");
            event_loop.exit();
            return;
        }
        self.apply_config_changes(event_loop);
        self.drain_frames();
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.finish();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.list_devices {
        println!("Available cameras:");
        match NokhwaCapture::list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("  [{}] {}", device.index, device.name);
                }
            }
            Err(e) => {
                eprintln!("Failed to list devices: {}", e);
            }
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    info!("Starting Retrocam...");
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = RetrocamApp::new(config, args.config.clone(), shutdown);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
