//! Retrocam: real-time camera effects with synchronized recording
//!
//! Captures frames from a webcam, runs them through one or two GPU compute
//! passes, presents the result, and optionally records the same frames to a
//! movie file without stalling the display path.

pub mod capture;
pub mod compositor;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod recording;
pub mod shader;
pub mod stats;

#[cfg(test)]
mod testing;
