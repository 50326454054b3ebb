//! YAML configuration and live reload of effect selection.

use crate::capture::CaptureConfig;
use crate::recording::{RecordingBackend, TargetSize};
use crate::shader::ScaleKernel;
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{error, info, warn};

/// Top-level configuration file. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub effects: EffectsConfig,
    pub recording: RecordingConfig,
    pub window: WindowConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub scale_kernel: ScaleKernel,
    pub degradation: bool,
    /// Threads the GPU runs in lockstep; the width of every threadgroup
    pub execution_width: u32,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            scale_kernel: ScaleKernel::default(),
            degradation: false,
            execution_width: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub backend: RecordingBackend,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        let target = TargetSize::default();
        Self {
            path: default_recording_path(),
            width: target.width,
            height: target.height,
            backend: RecordingBackend::default(),
        }
    }
}

impl RecordingConfig {
    pub fn target(&self) -> TargetSize {
        TargetSize {
            width: self.width,
            height: self.height,
        }
    }
}

/// `<cache dir>/retrocam/recording.mov`, falling back to the temp dir.
pub fn default_recording_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("retrocam")
        .join("recording.mov")
}

/// Preview window settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Retrocam".to_string(),
            width: 720,
            height: 1280,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }
}

/// Effect settings that differ between two loads of the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectChange {
    pub scale_kernel: Option<ScaleKernel>,
    pub degradation: Option<bool>,
}

impl EffectChange {
    pub fn between(old: &EffectsConfig, new: &EffectsConfig) -> Self {
        Self {
            scale_kernel: (old.scale_kernel != new.scale_kernel).then_some(new.scale_kernel),
            degradation: (old.degradation != new.degradation).then_some(new.degradation),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scale_kernel.is_none() && self.degradation.is_none()
    }
}

/// Watches the config file and reports effect changes as it is edited.
///
/// Only effect selection is applied live; other sections need a restart.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<std::result::Result<Event, notify::Error>>,
    current: EffectsConfig,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, current: EffectsConfig) -> Option<Self> {
        let (tx, rx) = channel();
        let mut watcher = match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Failed to create config watcher: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!("Failed to watch config file {:?}: {}", path, e);
            return None;
        }
        info!("Watching config file {:?} for changes", path);
        Some(Self {
            path,
            _watcher: watcher,
            rx,
            current,
        })
    }

    /// Non-blocking. Returns the effect changes since the last call, if any.
    pub fn check_for_changes(&mut self) -> Option<EffectChange> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            if let Ok(event) = res {
                if matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                    needs_reload = true;
                }
            }
        }
        if !needs_reload {
            return None;
        }

        info!("Config file changed, checking for effect updates...");
        match Config::load(&self.path) {
            Ok(config) => self.apply(config.effects),
            Err(e) => {
                error!("{:#}", e);
                None
            }
        }
    }

    fn apply(&mut self, effects: EffectsConfig) -> Option<EffectChange> {
        let change = EffectChange::between(&self.current, &effects);
        self.current = effects;
        (!change.is_empty()).then_some(change)
    }
}
