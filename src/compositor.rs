//! Per-frame composition: bind one or two compute stages, dispatch, present.

use crate::error::{BridgeError, FrameError};
use crate::frame::Frame;
use crate::shader::{ActiveStages, Stage};
use bytemuck::{Pod, Zeroable};

/// Uniform block shared by every kernel. Layout matches `EffectParams` in WGSL.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct EffectParams {
    /// Seconds since the effect clock origin
    pub time: f32,
    /// Per-frame noise seed in [0, 1)
    pub seed: f32,
    pub width: f32,
    pub height: f32,
}

/// Where a pass writes.
pub enum PassOutput<'a, B: ComputeBackend + ?Sized> {
    /// An offscreen texture read by the next pass
    Intermediate(&'a B::Texture),
    /// The display target of this frame
    Display(&'a B::Drawable),
}

/// One compute dispatch.
pub struct Pass<'a, B: ComputeBackend + ?Sized> {
    pub stage: &'a Stage<B::Pipeline>,
    pub input: &'a B::Texture,
    pub output: PassOutput<'a, B>,
    pub params: EffectParams,
    /// Workgroup counts covering the output, one thread per pixel
    pub groups: (u32, u32, u32),
}

/// The GPU operations the compositor drives.
///
/// Commands are recorded into one buffer per frame and submitted by
/// [`ComputeBackend::present`]. Implementations must not wait for the GPU.
pub trait ComputeBackend {
    type Pipeline;
    type Texture;
    type Drawable;
    type Commands;

    /// Next display target, or `None` when the display cannot keep up.
    fn next_drawable(&mut self) -> Option<Self::Drawable>;

    fn drawable_size(&self, drawable: &Self::Drawable) -> (u32, u32);

    /// Exposes the frame's pixels as a sampleable texture.
    fn bridge_texture(&mut self, frame: &Frame) -> Result<Self::Texture, BridgeError>;

    /// Offscreen storage texture of the given size, reused across frames.
    fn intermediate_texture(&mut self, width: u32, height: u32) -> Self::Texture;

    fn begin_commands(&mut self) -> Result<Self::Commands, FrameError>;

    fn encode_pass(&mut self, commands: &mut Self::Commands, pass: Pass<'_, Self>);

    /// Submits the recorded commands and schedules the drawable for display.
    fn present(&mut self, commands: Self::Commands, drawable: Self::Drawable);
}

/// What a successful composite did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Composited {
    pub passes: usize,
    /// Elapsed time fed to the degradation stage, if it ran
    pub elapsed: Option<f64>,
}

/// Turns frames into presented images.
pub struct Compositor<B: ComputeBackend> {
    backend: B,
}

impl<B: ComputeBackend> Compositor<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Renders `frame` through the active stages and presents it.
    ///
    /// Any missing prerequisite aborts this frame only. The effect clock is
    /// touched only once every prerequisite is in place.
    pub fn composite(
        &mut self,
        frame: &Frame,
        stages: ActiveStages<'_, B::Pipeline>,
    ) -> Result<Composited, FrameError> {
        let drawable = self.backend.next_drawable().ok_or(FrameError::NoDrawable)?;
        let input = self.backend.bridge_texture(frame)?;
        let scale = stages.scale.ok_or(FrameError::NoScaleStage)?;
        let mut commands = self.backend.begin_commands()?;

        let (width, height) = self.backend.drawable_size(&drawable);
        let base = EffectParams {
            width: width as f32,
            height: height as f32,
            ..Default::default()
        };

        let composited = match stages.degradation {
            None => {
                self.backend.encode_pass(
                    &mut commands,
                    Pass {
                        stage: scale,
                        input: &input,
                        output: PassOutput::Display(&drawable),
                        params: base,
                        groups: scale.geometry().groups_for(width, height),
                    },
                );
                Composited {
                    passes: 1,
                    elapsed: None,
                }
            }
            Some(degradation) => {
                let intermediate = self.backend.intermediate_texture(width, height);
                self.backend.encode_pass(
                    &mut commands,
                    Pass {
                        stage: scale,
                        input: &input,
                        output: PassOutput::Intermediate(&intermediate),
                        params: base,
                        groups: scale.geometry().groups_for(width, height),
                    },
                );

                let elapsed = stages.clock.elapsed(frame.pts);
                self.backend.encode_pass(
                    &mut commands,
                    Pass {
                        stage: degradation,
                        input: &intermediate,
                        output: PassOutput::Display(&drawable),
                        params: EffectParams {
                            time: elapsed as f32,
                            seed: rand::random::<f32>(),
                            ..base
                        },
                        groups: degradation.geometry().groups_for(width, height),
                    },
                );
                Composited {
                    passes: 2,
                    elapsed: Some(elapsed),
                }
            }
        };

        self.backend.present(commands, drawable);
        Ok(composited)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MediaTime;
    use crate::shader::{ProgramBundle, ScaleKernel, ShaderRegistry};
    use crate::testing::{test_frame, FakeCompiler, TraceBackend};

    fn setup() -> (Compositor<TraceBackend>, ShaderRegistry<FakeCompiler>) {
        let mut registry =
            ShaderRegistry::new(FakeCompiler::default(), ProgramBundle::builtin().unwrap());
        registry.ensure_scale().unwrap();
        (Compositor::new(TraceBackend::new(720, 1280)), registry)
    }

    #[test]
    fn scale_only_writes_straight_to_display() {
        let (mut compositor, mut registry) = setup();
        registry.select_scale(ScaleKernel::ScaleToFill).unwrap();

        for i in 0..3 {
            let frame = test_frame(MediaTime::new(i, 30));
            let done = compositor.composite(&frame, registry.active_stages()).unwrap();
            assert_eq!(done, Composited { passes: 1, elapsed: None });
        }

        let presented = &compositor.backend().presented;
        assert_eq!(presented.len(), 3);
        for (i, passes) in presented.iter().enumerate() {
            assert_eq!(passes.len(), 1);
            assert_eq!(passes[0].kernel, "scale_to_fill_kernel");
            assert_eq!(passes[0].input, format!("frame@{i}"));
            assert!(passes[0].output.starts_with("drawable"));
            assert_eq!(passes[0].groups, (23, 160, 1));
        }
        assert!(registry.clock().origin().is_none());
    }

    #[test]
    fn degradation_reads_intermediate_and_gets_elapsed_time() {
        let (mut compositor, mut registry) = setup();
        registry.toggle_degradation().unwrap();

        let t0 = test_frame(MediaTime::new(3000, 600));
        let t1 = test_frame(MediaTime::new(3020, 600));
        let first = compositor.composite(&t0, registry.active_stages()).unwrap();
        let second = compositor.composite(&t1, registry.active_stages()).unwrap();
        assert_eq!(first.elapsed, Some(0.0));
        assert!((second.elapsed.unwrap() - 20.0 / 600.0).abs() < 1e-9);

        let passes = &compositor.backend().presented[1];
        assert_eq!(passes.len(), 2);
        assert_eq!(passes[0].kernel, "scale_kernel");
        assert_eq!(passes[0].output, "intermediate720x1280");
        assert_eq!(passes[1].kernel, "vhs_kernel");
        assert_eq!(passes[1].input, "intermediate720x1280");
        assert!(passes[1].output.starts_with("drawable"));
        assert!((passes[1].time - (20.0f32 / 600.0)).abs() < 1e-6);
    }

    #[test]
    fn missing_drawable_drops_frame_without_touching_clock() {
        let (mut compositor, mut registry) = setup();
        registry.toggle_degradation().unwrap();
        compositor.backend_mut().withhold_drawable = true;

        let err = compositor
            .composite(&test_frame(MediaTime::new(1, 30)), registry.active_stages())
            .unwrap_err();
        assert!(matches!(err, FrameError::NoDrawable));
        assert_eq!(compositor.backend().bridged, 0);
        assert!(registry.clock().origin().is_none());
    }

    #[test]
    fn bridge_and_encoder_failures_are_frame_errors() {
        let (mut compositor, mut registry) = setup();
        compositor.backend_mut().fail_bridge = true;
        let err = compositor
            .composite(&test_frame(MediaTime::new(1, 30)), registry.active_stages())
            .unwrap_err();
        assert!(matches!(err, FrameError::Bridge(_)));

        compositor.backend_mut().fail_bridge = false;
        compositor.backend_mut().fail_encoder = true;
        let err = compositor
            .composite(&test_frame(MediaTime::new(2, 30)), registry.active_stages())
            .unwrap_err();
        assert!(matches!(err, FrameError::Encoder(_)));
        assert!(compositor.backend().presented.is_empty());
    }

    #[test]
    fn no_scale_stage_is_a_frame_error() {
        let mut registry =
            ShaderRegistry::new(FakeCompiler::default(), ProgramBundle::builtin().unwrap());
        let mut compositor = Compositor::new(TraceBackend::new(64, 64));
        let err = compositor
            .composite(&test_frame(MediaTime::new(0, 30)), registry.active_stages())
            .unwrap_err();
        assert!(matches!(err, FrameError::NoScaleStage));
    }
}
