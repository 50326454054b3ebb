//! H.264 QuickTime writer on GStreamer.
//!
//! Pipeline: appsrc -> videoconvert -> aspectratiocrop -> videoscale ->
//! capsfilter -> x264enc -> h264parse -> qtmux -> filesink

use super::{Muxer, TargetSize};
use crate::error::RecordingError;
use crate::frame::{Frame, MediaTime, PixelFormat};
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct GstMuxer {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    origin: Option<MediaTime>,
    /// Input size and format the appsrc caps were last set for
    negotiated: Option<(u32, u32, PixelFormat)>,
}

fn element(factory: &str) -> Result<gst::Element, RecordingError> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| RecordingError::AddTrack(format!("failed to create {factory}: {e}")))
}

impl GstMuxer {
    pub fn create(path: &Path, target: TargetSize) -> Result<Self, RecordingError> {
        gst::init().map_err(|e| RecordingError::AddTrack(e.to_string()))?;

        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .format(gst::Format::Time)
            .is_live(true)
            .build();

        let convert = element("videoconvert")?;
        let crop = gst::ElementFactory::make("aspectratiocrop")
            .property(
                "aspect-ratio",
                gst::Fraction::new(target.width as i32, target.height as i32),
            )
            .build()
            .map_err(|e| RecordingError::AddTrack(format!("failed to create aspectratiocrop: {e}")))?;
        let scale = element("videoscale")?;
        let caps = gst_video::VideoCapsBuilder::new()
            .format(gst_video::VideoFormat::I420)
            .width(target.width as i32)
            .height(target.height as i32)
            .build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| RecordingError::AddTrack(format!("failed to create capsfilter: {e}")))?;
        let encoder = element("x264enc")?;
        encoder.set_property_from_str("tune", "zerolatency");
        encoder.set_property_from_str("speed-preset", "veryfast");
        let parser = element("h264parse")?;
        let muxer = element("qtmux")?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .build()
            .map_err(|e| RecordingError::CreateContainer(io::Error::other(e)))?;

        let chain = [
            appsrc.upcast_ref(),
            &convert,
            &crop,
            &scale,
            &capsfilter,
            &encoder,
            &parser,
            &muxer,
            &filesink,
        ];
        pipeline
            .add_many(chain)
            .map_err(|e| RecordingError::AddTrack(format!("failed to add elements: {e}")))?;
        gst::Element::link_many(chain)
            .map_err(|e| RecordingError::AddTrack(format!("failed to link elements: {e}")))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| RecordingError::CreateContainer(io::Error::other(e)))?;

        debug!(path = %path.display(), "GStreamer recording pipeline playing");
        Ok(Self {
            pipeline,
            appsrc,
            path: path.to_path_buf(),
            origin: None,
            negotiated: None,
        })
    }

    fn negotiate(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        let key = (frame.width(), frame.height(), frame.buffer.format());
        if self.negotiated == Some(key) {
            return Ok(());
        }
        let format = match key.2 {
            PixelFormat::Bgra8 => gst_video::VideoFormat::Bgra,
            PixelFormat::Rgba8 => gst_video::VideoFormat::Rgba,
        };
        let caps = gst_video::VideoInfo::builder(format, key.0, key.1)
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|e| RecordingError::AddTrack(e.to_string()))?;
        self.appsrc.set_caps(Some(&caps));
        self.negotiated = Some(key);
        Ok(())
    }
}

impl Muxer for GstMuxer {
    fn start_session(&mut self, origin: MediaTime) -> Result<(), RecordingError> {
        self.origin = Some(origin);
        Ok(())
    }

    fn append(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        let origin = *self.origin.get_or_insert(frame.pts);
        self.negotiate(frame)?;

        // qtmux expects running time, so timestamps are relative to the origin
        let nanos = (frame.pts - origin).rescale(1_000_000_000).max(0) as u64;
        let mut buffer = gst::Buffer::from_slice(frame.buffer.packed().into_owned());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(nanos));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| RecordingError::Write(io::Error::other(format!("push failed: {e:?}"))))?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecordingError> {
        let eos = self
            .appsrc
            .end_of_stream()
            .map_err(|e| RecordingError::Finalize(format!("failed to send EOS: {e:?}")));

        let outcome = eos.and_then(|_| match self.pipeline.bus() {
            Some(bus) => await_eos(
                bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS))
                    .map(|msg| BusEvent::from(&msg)),
            ),
            None => Err(RecordingError::Finalize("pipeline has no bus".to_string())),
        });

        // tear down even when finalization failed, but do not hide either error
        let teardown = self
            .pipeline
            .set_state(gst::State::Null)
            .map_err(|e| RecordingError::Finalize(format!("failed to stop pipeline: {e}")));
        outcome?;
        teardown?;
        debug!(path = %self.path.display(), "GStreamer recording finalized");
        Ok(())
    }
}

const EOS_TIMEOUT_SECS: u64 = 10;

/// The bus messages that decide how finalization went.
#[derive(Debug)]
enum BusEvent {
    Eos,
    Error(String),
    Other,
}

impl From<&gst::Message> for BusEvent {
    fn from(msg: &gst::Message) -> Self {
        match msg.view() {
            gst::MessageView::Eos(..) => BusEvent::Eos,
            gst::MessageView::Error(err) => {
                BusEvent::Error(format!("{} ({:?})", err.error(), err.debug()))
            }
            _ => BusEvent::Other,
        }
    }
}

/// Succeeds only if EOS reaches the bus before an error or the end of `events`.
///
/// The timed bus iterator ends when the timeout expires, so running out of
/// events means qtmux never wrote its index.
fn await_eos(events: impl IntoIterator<Item = BusEvent>) -> Result<(), RecordingError> {
    for event in events {
        match event {
            BusEvent::Eos => return Ok(()),
            BusEvent::Error(message) => return Err(RecordingError::Finalize(message)),
            BusEvent::Other => {}
        }
    }
    warn!("No EOS from the recording pipeline within {}s", EOS_TIMEOUT_SECS);
    Err(RecordingError::Finalize("timed out waiting for EOS".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_after_other_messages_finalizes() {
        let events = vec![BusEvent::Other, BusEvent::Other, BusEvent::Eos];
        assert!(await_eos(events).is_ok());
    }

    #[test]
    fn pipeline_error_fails_finalization() {
        let events = vec![
            BusEvent::Other,
            BusEvent::Error("qtmux: not negotiated".to_string()),
            BusEvent::Eos,
        ];
        assert!(matches!(
            await_eos(events),
            Err(RecordingError::Finalize(message)) if message.contains("not negotiated")
        ));
    }

    #[test]
    fn timeout_without_eos_fails_finalization() {
        assert!(matches!(
            await_eos(vec![BusEvent::Other]),
            Err(RecordingError::Finalize(message)) if message.contains("timed out")
        ));
    }
}
