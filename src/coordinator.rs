//! The façade the UI drives: session lifecycle plus per-frame dispatch.

use crate::capture::{FrameHandler, FrameSource};
use crate::compositor::{ComputeBackend, Compositor};
use crate::error::{CaptureError, ConfigError, RecordingError};
use crate::frame::Frame;
use crate::recording::{Finalizing, MuxerFactory, RecordingSink};
use crate::shader::{PipelineCompiler, ScaleKernel, ShaderRegistry};
use crate::stats::FrameStats;
use std::time::Instant;
use tracing::{info, trace};

/// Outcome of [`PipelineCoordinator::toggle_recording`].
#[must_use]
pub enum RecordingToggle {
    Started,
    /// Await to learn how finalization went. Frame delivery is not blocked.
    Stopped(Finalizing),
}

/// Owns the registry, compositor, sink and source, and serializes per-frame
/// work on whatever thread drains the delivery queue.
pub struct PipelineCoordinator<B, C, F, S>
where
    B: ComputeBackend,
    C: PipelineCompiler<Pipeline = B::Pipeline>,
    F: MuxerFactory,
    S: FrameSource,
{
    registry: ShaderRegistry<C>,
    compositor: Compositor<B>,
    sink: RecordingSink<F>,
    source: S,
    stats: FrameStats,
}

impl<B, C, F, S> PipelineCoordinator<B, C, F, S>
where
    B: ComputeBackend,
    C: PipelineCompiler<Pipeline = B::Pipeline>,
    F: MuxerFactory,
    S: FrameSource,
{
    /// Activates the default scale stage up front so a broken bundle is
    /// reported before any frame arrives.
    pub fn new(
        mut registry: ShaderRegistry<C>,
        compositor: Compositor<B>,
        sink: RecordingSink<F>,
        source: S,
    ) -> Result<Self, ConfigError> {
        registry.ensure_scale()?;
        Ok(Self {
            registry,
            compositor,
            sink,
            source,
            stats: FrameStats::new(),
        })
    }

    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        self.source.start()
    }

    /// Stops future deliveries. Frames already in flight complete normally.
    pub fn stop_capture(&mut self) {
        self.source.stop();
    }

    pub fn is_capturing(&self) -> bool {
        self.source.is_running()
    }

    pub fn toggle_recording(&mut self) -> Result<RecordingToggle, RecordingError> {
        if self.sink.is_recording() {
            self.sink.stop().map(RecordingToggle::Stopped)
        } else {
            self.sink.start()?;
            Ok(RecordingToggle::Started)
        }
    }

    pub fn is_recording(&self) -> bool {
        self.sink.is_recording()
    }

    /// Selects a scale kernel by its position in [`ScaleKernel::SELECTABLE`].
    pub fn select_scale_effect(&mut self, index: usize) -> Result<(), ConfigError> {
        self.select_scale_kernel(ScaleKernel::from_index(index)?)
    }

    pub fn select_scale_kernel(&mut self, kernel: ScaleKernel) -> Result<(), ConfigError> {
        self.registry.select_scale(kernel)
    }

    /// Returns whether the degradation stage is now active.
    pub fn toggle_degradation_effect(&mut self) -> Result<bool, ConfigError> {
        let active = self.registry.toggle_degradation()?;
        info!(active, "Degradation effect toggled");
        Ok(active)
    }

    pub fn set_degradation(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.registry.set_degradation(enabled)
    }

    pub fn registry(&self) -> &ShaderRegistry<C> {
        &self.registry
    }

    pub fn compositor(&self) -> &Compositor<B> {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut Compositor<B> {
        &mut self.compositor
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    fn record(&mut self, frame: &Frame) {
        if !self.sink.is_recording() {
            return;
        }
        if self.sink.accept(frame) {
            self.stats.recorded();
        }
        self.stats.record_backlog(self.sink.backlog());
    }
}

impl<B, C, F, S> FrameHandler for PipelineCoordinator<B, C, F, S>
where
    B: ComputeBackend,
    C: PipelineCompiler<Pipeline = B::Pipeline>,
    F: MuxerFactory,
    S: FrameSource,
{
    fn on_frame(&mut self, frame: &Frame) {
        // recording first: a failed present must not cost the recording a frame
        self.record(frame);
        match self.compositor.composite(frame, self.registry.active_stages()) {
            Ok(_) => self.stats.presented(),
            Err(e) => {
                trace!("Frame not presented: {}", e);
                self.stats.dropped();
            }
        }
        self.stats.tick(Instant::now());
    }

    fn on_frame_dropped(&mut self, frame: &Frame) {
        self.record(frame);
        self.stats.dropped();
        self.stats.tick(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MediaTime;
    use crate::recording::TargetSize;
    use crate::shader::{ProgramBundle, DEGRADATION_KERNEL};
    use crate::testing::{
        test_frame, FakeCompiler, FakeSource, MemoryMuxerFactory, TraceBackend,
    };

    type TestCoordinator =
        PipelineCoordinator<TraceBackend, FakeCompiler, MemoryMuxerFactory, FakeSource>;

    fn coordinator(dir: &tempfile::TempDir) -> (TestCoordinator, MemoryMuxerFactory) {
        coordinator_with(dir, MemoryMuxerFactory::default(), FakeSource::default())
    }

    fn coordinator_with(
        dir: &tempfile::TempDir,
        factory: MemoryMuxerFactory,
        source: FakeSource,
    ) -> (TestCoordinator, MemoryMuxerFactory) {
        let registry =
            ShaderRegistry::new(FakeCompiler::default(), ProgramBundle::builtin().unwrap());
        let sink = RecordingSink::new(
            factory.clone(),
            dir.path().join("recording.mov"),
            TargetSize::default(),
        );
        let coordinator = PipelineCoordinator::new(
            registry,
            Compositor::new(TraceBackend::new(720, 1280)),
            sink,
            source,
        )
        .unwrap();
        (coordinator, factory)
    }

    fn pts(i: i64) -> MediaTime {
        MediaTime::new(i * 3_000, 90_000)
    }

    fn presented_kernels(coordinator: &TestCoordinator) -> Vec<Vec<&'static str>> {
        coordinator
            .compositor()
            .backend()
            .presented
            .iter()
            .map(|passes| passes.iter().map(|p| p.kernel).collect())
            .collect()
    }

    #[test]
    fn default_scale_stage_is_active_after_construction() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(&dir);
        assert_eq!(coordinator.registry().active_scale(), Some(ScaleKernel::Scale));
        assert!(!coordinator.registry().degradation_active());
    }

    #[test]
    fn selected_kernel_renders_every_frame_without_degradation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, _) = coordinator(&dir);
        coordinator.start_capture().unwrap();
        coordinator.select_scale_effect(1).unwrap();

        for i in 0..3 {
            coordinator.on_frame(&test_frame(pts(i)));
        }

        assert_eq!(
            presented_kernels(&coordinator),
            vec![vec!["scale_to_fit_kernel"]; 3]
        );
        assert_eq!(coordinator.registry().clock().origin(), None);
    }

    #[test]
    fn degradation_time_starts_at_zero_and_follows_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, _) = coordinator(&dir);
        assert!(coordinator.toggle_degradation_effect().unwrap());

        coordinator.on_frame(&test_frame(pts(10)));
        coordinator.on_frame(&test_frame(pts(13)));

        let presented = &coordinator.compositor().backend().presented;
        assert_eq!(presented.len(), 2);
        let times: Vec<f32> = presented.iter().map(|passes| passes[1].time).collect();
        assert_eq!(times[0], 0.0);
        assert!((times[1] - 0.1).abs() < 1e-6);
        assert_eq!(presented[0][1].kernel, DEGRADATION_KERNEL);
    }

    #[test]
    fn reactivated_degradation_takes_a_new_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, _) = coordinator(&dir);
        coordinator.toggle_degradation_effect().unwrap();
        coordinator.on_frame(&test_frame(pts(1)));
        assert!(!coordinator.toggle_degradation_effect().unwrap());
        assert_eq!(coordinator.registry().clock().origin(), None);

        coordinator.toggle_degradation_effect().unwrap();
        coordinator.on_frame(&test_frame(pts(50)));
        assert_eq!(coordinator.registry().clock().origin(), Some(pts(50)));
        let last = coordinator.compositor().backend().presented.last().unwrap();
        assert_eq!(last[1].time, 0.0);
    }

    #[test]
    fn dropped_frames_are_recorded_but_not_presented() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, factory) = coordinator(&dir);
        assert!(matches!(
            coordinator.toggle_recording().unwrap(),
            RecordingToggle::Started
        ));

        coordinator.on_frame(&test_frame(pts(0)));
        coordinator.on_frame_dropped(&test_frame(pts(1)));
        coordinator.on_frame(&test_frame(pts(2)));

        let RecordingToggle::Stopped(finalizing) = coordinator.toggle_recording().unwrap() else {
            panic!("second toggle should stop the recording");
        };
        let summary = pollster::block_on(finalizing).unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(
            factory.log.lock().unwrap().appended,
            vec![pts(0), pts(1), pts(2)]
        );
        assert_eq!(coordinator.compositor().backend().presented.len(), 2);
        assert_eq!(coordinator.stats().totals(), (2, 1, 3));
    }

    #[test]
    fn presentation_failure_does_not_cost_recorded_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, factory) = coordinator(&dir);
        coordinator.compositor_mut().backend_mut().withhold_drawable = true;
        coordinator.toggle_recording().unwrap();

        for i in 0..4 {
            coordinator.on_frame(&test_frame(pts(i)));
        }
        let RecordingToggle::Stopped(finalizing) = coordinator.toggle_recording().unwrap() else {
            panic!("expected stop");
        };
        pollster::block_on(finalizing).unwrap();

        assert!(coordinator.compositor().backend().presented.is_empty());
        assert_eq!(factory.log.lock().unwrap().appended.len(), 4);
    }

    #[test]
    fn frames_the_writer_never_received_are_not_counted_as_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryMuxerFactory {
            panic_on_start: true,
            ..Default::default()
        };
        let (mut coordinator, _) = coordinator_with(&dir, factory, FakeSource::default());
        coordinator.toggle_recording().unwrap();

        // the writer thread dies on its first command; wait until sends fail
        let mut delivered = 0;
        let mut refused = false;
        for i in 0..400 {
            let before = coordinator.stats().totals().2;
            coordinator.on_frame(&test_frame(pts(i)));
            delivered += 1;
            if coordinator.stats().totals().2 == before {
                refused = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(refused);
        assert!(coordinator.stats().totals().2 < delivered);
        assert!(coordinator.is_recording());
        let RecordingToggle::Stopped(finalizing) = coordinator.toggle_recording().unwrap() else {
            panic!("expected stop");
        };
        assert!(matches!(
            pollster::block_on(finalizing),
            Err(RecordingError::WriterGone)
        ));
    }

    #[test]
    fn failed_recording_start_is_reported_and_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryMuxerFactory {
            fail_create: true,
            ..Default::default()
        };
        let sink = RecordingSink::new(
            factory,
            dir.path().join("recording.mov"),
            TargetSize::default(),
        );
        let registry =
            ShaderRegistry::new(FakeCompiler::default(), ProgramBundle::builtin().unwrap());
        let mut coordinator = PipelineCoordinator::new(
            registry,
            Compositor::new(TraceBackend::new(8, 8)),
            sink,
            FakeSource::default(),
        )
        .unwrap();

        assert!(matches!(
            coordinator.toggle_recording(),
            Err(RecordingError::AddTrack(_))
        ));
        assert!(!coordinator.is_recording());
        assert!(coordinator.toggle_recording().is_err());
    }

    #[test]
    fn capture_lifecycle_reaches_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, _) = coordinator(&dir);
        coordinator.start_capture().unwrap();
        assert!(coordinator.is_capturing());
        assert!(matches!(
            coordinator.start_capture(),
            Err(CaptureError::AlreadyRunning)
        ));
        coordinator.stop_capture();
        assert!(!coordinator.is_capturing());
        coordinator.start_capture().unwrap();
    }

    #[test]
    fn camera_open_failure_leaves_capture_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource {
            fail_start: true,
            ..Default::default()
        };
        let (mut coordinator, _) = coordinator_with(&dir, MemoryMuxerFactory::default(), source);
        assert!(matches!(
            coordinator.start_capture(),
            Err(CaptureError::Open(_))
        ));
        assert!(!coordinator.is_capturing());
    }

    #[test]
    fn out_of_range_effect_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut coordinator, _) = coordinator(&dir);
        assert!(matches!(
            coordinator.select_scale_effect(3),
            Err(ConfigError::KernelIndex(3))
        ));
        assert_eq!(coordinator.registry().active_scale(), Some(ScaleKernel::Scale));
    }

    #[test]
    fn broken_bundle_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ShaderRegistry::new(
            FakeCompiler::failing_on("scale_kernel"),
            ProgramBundle::builtin().unwrap(),
        );
        let sink = RecordingSink::new(
            MemoryMuxerFactory::default(),
            dir.path().join("recording.mov"),
            TargetSize::default(),
        );
        let result = PipelineCoordinator::new(
            registry,
            Compositor::new(TraceBackend::new(8, 8)),
            sink,
            FakeSource::default(),
        );
        assert!(matches!(result, Err(ConfigError::PipelineCompile { .. })));
    }
}
