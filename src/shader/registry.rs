use super::{PipelineCompiler, ProgramBundle, ScaleKernel, Stage, ThreadgroupGeometry, DEGRADATION_KERNEL};
use crate::error::ConfigError;
use crate::frame::MediaTime;
use tracing::{debug, info};

/// Time origin for the degradation stage.
///
/// Unset until the first frame asks for elapsed time. Elapsed values never go
/// below zero and never decrease until [`EffectClock::reset`].
#[derive(Debug, Default, Clone)]
pub struct EffectClock {
    origin: Option<MediaTime>,
    last: f64,
}

impl EffectClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds since the origin, setting the origin to `pts` on first use.
    pub fn elapsed(&mut self, pts: MediaTime) -> f64 {
        let origin = *self.origin.get_or_insert(pts);
        let secs = (pts - origin).as_secs_f64().max(self.last);
        self.last = secs;
        secs
    }

    pub fn reset(&mut self) {
        self.origin = None;
        self.last = 0.0;
    }

    pub fn origin(&self) -> Option<MediaTime> {
        self.origin
    }
}

/// Borrowed view of what the compositor needs for one frame.
pub struct ActiveStages<'a, P> {
    pub scale: Option<&'a Stage<P>>,
    pub degradation: Option<&'a Stage<P>>,
    pub clock: &'a mut EffectClock,
}

/// Compiles and holds the active pipeline stages.
///
/// At most one scale stage and one degradation stage exist at a time.
/// Reselection compiles the replacement first and swaps it in, so a failed
/// compile leaves the previous stage untouched.
pub struct ShaderRegistry<C: PipelineCompiler> {
    compiler: C,
    bundle: ProgramBundle,
    scale: Option<(ScaleKernel, Stage<C::Pipeline>)>,
    degradation: Option<Stage<C::Pipeline>>,
    clock: EffectClock,
}

impl<C: PipelineCompiler> ShaderRegistry<C> {
    pub fn new(compiler: C, bundle: ProgramBundle) -> Self {
        Self {
            compiler,
            bundle,
            scale: None,
            degradation: None,
            clock: EffectClock::new(),
        }
    }

    /// Loads `name` from the bundle and compiles it for the current device.
    pub fn activate(&self, name: &'static str) -> Result<Stage<C::Pipeline>, ConfigError> {
        let kernel = self.bundle.kernel(name)?;
        let geometry = ThreadgroupGeometry::for_device(&self.compiler.limits());
        let pipeline = self.compiler.compile(&kernel, geometry)?;
        info!(
            kernel = name,
            group_width = geometry.width,
            group_height = geometry.height,
            "Activated pipeline stage"
        );
        Ok(Stage {
            name,
            geometry,
            pipeline,
        })
    }

    /// Replaces the scale stage. Selecting the active kernel again is a no-op.
    pub fn select_scale(&mut self, kernel: ScaleKernel) -> Result<(), ConfigError> {
        if self.active_scale() == Some(kernel) {
            debug!(kernel = %kernel, "Scale kernel already active");
            return Ok(());
        }
        let stage = self.activate(kernel.entry_point())?;
        self.scale = Some((kernel, stage));
        Ok(())
    }

    /// Activates the default scale kernel if none is active yet.
    pub fn ensure_scale(&mut self) -> Result<(), ConfigError> {
        if self.scale.is_none() {
            self.select_scale(ScaleKernel::default())?;
        }
        Ok(())
    }

    /// Turns the degradation stage on or off. Turning it off resets the clock.
    pub fn set_degradation(&mut self, enabled: bool) -> Result<(), ConfigError> {
        match (enabled, self.degradation.is_some()) {
            (true, false) => {
                let stage = self.activate(DEGRADATION_KERNEL)?;
                self.clock.reset();
                self.degradation = Some(stage);
            }
            (false, true) => self.deactivate_degradation(),
            _ => {}
        }
        Ok(())
    }

    /// Flips the degradation stage and returns whether it is now active.
    pub fn toggle_degradation(&mut self) -> Result<bool, ConfigError> {
        let enabled = self.degradation.is_none();
        self.set_degradation(enabled)?;
        Ok(enabled)
    }

    pub fn deactivate_degradation(&mut self) {
        if self.degradation.take().is_some() {
            info!(kernel = DEGRADATION_KERNEL, "Deactivated pipeline stage");
        }
        self.clock.reset();
    }

    pub fn active_scale(&self) -> Option<ScaleKernel> {
        self.scale.as_ref().map(|(kernel, _)| *kernel)
    }

    pub fn scale_stage(&self) -> Option<&Stage<C::Pipeline>> {
        self.scale.as_ref().map(|(_, stage)| stage)
    }

    pub fn degradation_stage(&self) -> Option<&Stage<C::Pipeline>> {
        self.degradation.as_ref()
    }

    pub fn degradation_active(&self) -> bool {
        self.degradation.is_some()
    }

    pub fn clock(&self) -> &EffectClock {
        &self.clock
    }

    pub fn active_stages(&mut self) -> ActiveStages<'_, C::Pipeline> {
        ActiveStages {
            scale: self.scale.as_ref().map(|(_, stage)| stage),
            degradation: self.degradation.as_ref(),
            clock: &mut self.clock,
        }
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCompiler;

    fn registry() -> ShaderRegistry<FakeCompiler> {
        ShaderRegistry::new(FakeCompiler::default(), ProgramBundle::builtin().unwrap())
    }

    #[test]
    fn clock_origin_is_first_timestamp() {
        let mut clock = EffectClock::new();
        assert!(clock.origin().is_none());
        assert_eq!(clock.elapsed(MediaTime::new(300, 600)), 0.0);
        assert_eq!(clock.origin(), Some(MediaTime::new(300, 600)));
        assert!((clock.elapsed(MediaTime::new(330, 600)) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn clock_never_goes_backwards() {
        let mut clock = EffectClock::new();
        clock.elapsed(MediaTime::new(10, 30));
        assert!((clock.elapsed(MediaTime::new(40, 30)) - 1.0).abs() < 1e-9);
        // out-of-order and pre-origin timestamps hold the last value
        assert!((clock.elapsed(MediaTime::new(20, 30)) - 1.0).abs() < 1e-9);
        assert!((clock.elapsed(MediaTime::new(0, 30)) - 1.0).abs() < 1e-9);
        clock.reset();
        assert!(clock.origin().is_none());
        assert_eq!(clock.elapsed(MediaTime::new(0, 30)), 0.0);
    }

    #[test]
    fn reselection_replaces_scale_stage() {
        let mut registry = registry();
        registry.ensure_scale().unwrap();
        assert_eq!(registry.scale_stage().unwrap().name(), "scale_kernel");

        registry.select_scale(ScaleKernel::ScaleToFit).unwrap();
        assert_eq!(registry.active_scale(), Some(ScaleKernel::ScaleToFit));
        assert_eq!(
            *registry.scale_stage().unwrap().pipeline(),
            "scale_to_fit_kernel"
        );

        // same kernel again does not recompile
        registry.select_scale(ScaleKernel::ScaleToFit).unwrap();
        assert_eq!(
            registry.compiler().compiled(),
            ["scale_kernel", "scale_to_fit_kernel"]
        );
    }

    #[test]
    fn failed_compile_keeps_previous_stage() {
        let mut registry = ShaderRegistry::new(
            FakeCompiler::failing_on("scale_to_fill_kernel"),
            ProgramBundle::builtin().unwrap(),
        );
        registry.select_scale(ScaleKernel::Scale).unwrap();
        let err = registry.select_scale(ScaleKernel::ScaleToFill).unwrap_err();
        assert!(matches!(err, ConfigError::PipelineCompile { .. }));
        assert_eq!(registry.active_scale(), Some(ScaleKernel::Scale));
    }

    #[test]
    fn missing_kernel_is_fatal() {
        let registry = registry();
        assert!(matches!(
            registry.activate("sepia_kernel"),
            Err(ConfigError::MissingKernel(_))
        ));
    }

    #[test]
    fn toggling_degradation_off_resets_clock() {
        let mut registry = registry();
        assert!(registry.toggle_degradation().unwrap());
        assert_eq!(registry.degradation_stage().unwrap().name(), DEGRADATION_KERNEL);

        registry.active_stages().clock.elapsed(MediaTime::new(90, 30));
        assert!(registry.clock().origin().is_some());

        assert!(!registry.toggle_degradation().unwrap());
        assert!(registry.degradation_stage().is_none());
        assert!(registry.clock().origin().is_none());
    }

    #[test]
    fn stage_geometry_comes_from_device_limits() {
        let registry = registry();
        let stage = registry.activate("scale_kernel").unwrap();
        assert_eq!(stage.geometry(), ThreadgroupGeometry { width: 32, height: 8 });
    }
}
