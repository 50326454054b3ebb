//! In-memory stand-ins for the GPU and the container writer.

use crate::capture::FrameSource;
use crate::compositor::{ComputeBackend, Pass, PassOutput};
use crate::error::{BridgeError, CaptureError, ConfigError, FrameError, RecordingError};
use crate::frame::{Frame, MediaTime, PixelBuffer};
use crate::recording::{Muxer, MuxerFactory, TargetSize};
use crate::shader::{DeviceLimits, KernelEntry, PipelineCompiler, ThreadgroupGeometry};
use std::cell::RefCell;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A 4x4 opaque grey frame.
pub fn test_frame(pts: MediaTime) -> Frame {
    Frame::new(PixelBuffer::from_bgra(4, 4, vec![128; 64]).unwrap(), pts)
}

/// Compiles nothing; the "pipeline" is the kernel name.
#[derive(Default)]
pub struct FakeCompiler {
    compiled: RefCell<Vec<&'static str>>,
    fail_on: Option<&'static str>,
}

impl FakeCompiler {
    pub fn failing_on(kernel: &'static str) -> Self {
        Self {
            fail_on: Some(kernel),
            ..Default::default()
        }
    }

    pub fn compiled(&self) -> Vec<&'static str> {
        self.compiled.borrow().clone()
    }
}

impl PipelineCompiler for FakeCompiler {
    type Pipeline = &'static str;

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            execution_width: 32,
            max_threads_per_group: 256,
            max_group_width: 256,
            max_group_height: 256,
        }
    }

    fn compile(
        &self,
        kernel: &KernelEntry<'_>,
        _geometry: ThreadgroupGeometry,
    ) -> Result<&'static str, ConfigError> {
        if self.fail_on == Some(kernel.name) {
            return Err(ConfigError::PipelineCompile {
                kernel: kernel.name.to_string(),
                message: "rejected by test compiler".to_string(),
            });
        }
        self.compiled.borrow_mut().push(kernel.name);
        Ok(kernel.name)
    }
}

/// A dispatch as the trace backend saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPass {
    pub kernel: &'static str,
    pub input: String,
    pub output: String,
    pub time: f32,
    pub groups: (u32, u32, u32),
}

/// Records command sequences instead of running them. Textures are labels.
pub struct TraceBackend {
    pub size: (u32, u32),
    pub withhold_drawable: bool,
    pub fail_bridge: bool,
    pub fail_encoder: bool,
    pub bridged: usize,
    pub presented: Vec<Vec<RecordedPass>>,
    next_drawable: u32,
}

impl TraceBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            withhold_drawable: false,
            fail_bridge: false,
            fail_encoder: false,
            bridged: 0,
            presented: Vec::new(),
            next_drawable: 0,
        }
    }
}

impl ComputeBackend for TraceBackend {
    type Pipeline = &'static str;
    type Texture = String;
    type Drawable = String;
    type Commands = Vec<RecordedPass>;

    fn next_drawable(&mut self) -> Option<String> {
        if self.withhold_drawable {
            return None;
        }
        self.next_drawable += 1;
        Some(format!("drawable{}", self.next_drawable))
    }

    fn drawable_size(&self, _drawable: &String) -> (u32, u32) {
        self.size
    }

    fn bridge_texture(&mut self, frame: &Frame) -> Result<String, BridgeError> {
        if self.fail_bridge {
            return Err(BridgeError::EmptyFrame);
        }
        self.bridged += 1;
        Ok(format!("frame@{}", frame.pts.value))
    }

    fn intermediate_texture(&mut self, width: u32, height: u32) -> String {
        format!("intermediate{width}x{height}")
    }

    fn begin_commands(&mut self) -> Result<Vec<RecordedPass>, FrameError> {
        if self.fail_encoder {
            return Err(FrameError::Encoder("test encoder unavailable".to_string()));
        }
        Ok(Vec::new())
    }

    fn encode_pass(&mut self, commands: &mut Vec<RecordedPass>, pass: Pass<'_, Self>) {
        let output = match pass.output {
            PassOutput::Intermediate(texture) => texture.clone(),
            PassOutput::Display(drawable) => drawable.clone(),
        };
        commands.push(RecordedPass {
            kernel: *pass.stage.pipeline(),
            input: pass.input.clone(),
            output,
            time: pass.params.time,
            groups: pass.groups,
        });
    }

    fn present(&mut self, commands: Vec<RecordedPass>, _drawable: String) {
        self.presented.push(commands);
    }
}

/// Everything a [`MemoryMuxer`] was asked to do.
#[derive(Debug, Default)]
pub struct MuxLog {
    pub created: Vec<(std::path::PathBuf, TargetSize)>,
    /// Whether a file was already at the path when each container was created
    pub path_occupied: Vec<bool>,
    pub origin: Option<MediaTime>,
    pub appended: Vec<MediaTime>,
    pub finished: usize,
}

/// Factory for muxers that only log. Clones share one log.
#[derive(Clone, Default)]
pub struct MemoryMuxerFactory {
    pub log: Arc<Mutex<MuxLog>>,
    pub fail_create: bool,
    /// Makes the writer thread panic on `start_session`
    pub panic_on_start: bool,
    /// Held by a test to keep `finish` blocked
    pub finish_gate: Arc<Mutex<()>>,
    /// Held by a test to keep `append` blocked
    pub append_gate: Arc<Mutex<()>>,
}

pub struct MemoryMuxer {
    log: Arc<Mutex<MuxLog>>,
    panic_on_start: bool,
    finish_gate: Arc<Mutex<()>>,
    append_gate: Arc<Mutex<()>>,
}

impl MuxerFactory for MemoryMuxerFactory {
    fn create(&self, path: &Path, target: TargetSize) -> Result<Box<dyn Muxer>, RecordingError> {
        if self.fail_create {
            return Err(RecordingError::AddTrack("test factory refused".to_string()));
        }
        let mut log = self.log.lock().unwrap();
        log.path_occupied.push(path.exists());
        log.created.push((path.to_path_buf(), target));
        Ok(Box::new(MemoryMuxer {
            log: self.log.clone(),
            panic_on_start: self.panic_on_start,
            finish_gate: self.finish_gate.clone(),
            append_gate: self.append_gate.clone(),
        }))
    }
}

impl Muxer for MemoryMuxer {
    fn start_session(&mut self, origin: MediaTime) -> Result<(), RecordingError> {
        if self.panic_on_start {
            panic!("test muxer refused to start");
        }
        self.log.lock().unwrap().origin = Some(origin);
        Ok(())
    }

    fn append(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        let _gate = self.append_gate.lock().unwrap();
        self.log.lock().unwrap().appended.push(frame.pts);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecordingError> {
        let _gate = self.finish_gate.lock().unwrap();
        self.log.lock().unwrap().finished += 1;
        Ok(())
    }
}

/// Frame source that only tracks whether it was started.
#[derive(Default)]
pub struct FakeSource {
    pub running: bool,
    pub fail_start: bool,
}

impl FrameSource for FakeSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.running {
            return Err(CaptureError::AlreadyRunning);
        }
        if self.fail_start {
            return Err(CaptureError::Open("no camera in tests".to_string()));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
