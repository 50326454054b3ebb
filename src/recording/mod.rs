//! Recording sink: an encoder session fed from the frame delivery queue.
//!
//! The sink never blocks the caller. Frames are handed to a writer thread
//! over an unbounded channel whose depth is reported by
//! [`RecordingSink::backlog`]. Finalization happens on that thread and is
//! reported through a [`Finalizing`] future.

mod mov;
#[cfg(feature = "gstreamer")]
mod gst;

pub use mov::MovMuxer;
#[cfg(feature = "gstreamer")]
pub use gst::GstMuxer;

use crate::error::RecordingError;
use crate::frame::{Frame, MediaTime};
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Frame size every recording is normalized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const PORTRAIT_720: TargetSize = TargetSize {
        width: 720,
        height: 1280,
    };
}

impl Default for TargetSize {
    fn default() -> Self {
        Self::PORTRAIT_720
    }
}

/// A container with one video track, written on the writer thread.
pub trait Muxer: Send {
    /// Called once, before the first append, with that frame's timestamp.
    fn start_session(&mut self, origin: MediaTime) -> Result<(), RecordingError>;

    fn append(&mut self, frame: &Frame) -> Result<(), RecordingError>;

    /// Flushes and closes the container. The file is well-formed afterwards.
    fn finish(self: Box<Self>) -> Result<(), RecordingError>;
}

/// Creates the container and adds its single video track.
pub trait MuxerFactory {
    fn create(&self, path: &Path, target: TargetSize) -> Result<Box<dyn Muxer>, RecordingError>;
}

/// Container writers selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingBackend {
    /// Uncompressed QuickTime, no system libraries needed
    #[default]
    Mov,
    /// H.264 QuickTime through GStreamer
    Gstreamer,
}

impl MuxerFactory for RecordingBackend {
    fn create(&self, path: &Path, target: TargetSize) -> Result<Box<dyn Muxer>, RecordingError> {
        match self {
            RecordingBackend::Mov => Ok(Box::new(MovMuxer::create(path, target)?)),
            #[cfg(feature = "gstreamer")]
            RecordingBackend::Gstreamer => Ok(Box::new(GstMuxer::create(path, target)?)),
            #[cfg(not(feature = "gstreamer"))]
            RecordingBackend::Gstreamer => Err(RecordingError::AddTrack(
                "built without the `gstreamer` feature".to_string(),
            )),
        }
    }
}

/// What ended up in a finalized artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub first_pts: Option<MediaTime>,
    pub last_pts: Option<MediaTime>,
}

enum WriterCommand {
    Start(MediaTime),
    Append(Frame),
    Finish {
        summary: RecordingSummary,
        reply: oneshot::Sender<Result<RecordingSummary, RecordingError>>,
    },
}

/// Resolves once the writer thread has finalized the container.
#[must_use = "dropping Finalizing discards the finalization result"]
pub struct Finalizing {
    rx: oneshot::Receiver<Result<RecordingSummary, RecordingError>>,
}

impl Future for Finalizing {
    type Output = Result<RecordingSummary, RecordingError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(RecordingError::WriterGone)))
    }
}

struct Session {
    tx: mpsc::Sender<WriterCommand>,
    writer: JoinHandle<()>,
    done: Arc<AtomicBool>,
    /// Frames sent to the writer and not yet appended
    backlog: Arc<AtomicUsize>,
    /// Set by the first accepted frame; doubles as the "started" flag
    origin: Option<MediaTime>,
    frames: u64,
    last_pts: Option<MediaTime>,
}

enum SinkState {
    Idle,
    Writing(Session),
}

struct PendingWriter {
    writer: JoinHandle<()>,
    done: Arc<AtomicBool>,
}

/// Owns at most one recording session at a fixed output path.
pub struct RecordingSink<F: MuxerFactory> {
    factory: F,
    path: PathBuf,
    target: TargetSize,
    state: SinkState,
    finalizing: Option<PendingWriter>,
}

impl<F: MuxerFactory> RecordingSink<F> {
    pub fn new(factory: F, path: impl Into<PathBuf>, target: TargetSize) -> Self {
        Self {
            factory,
            path: path.into(),
            target,
            state: SinkState::Idle,
            finalizing: None,
        }
    }

    /// Removes any previous artifact and opens a new container.
    ///
    /// On failure the sink stays idle and the call may be retried.
    pub fn start(&mut self) -> Result<(), RecordingError> {
        if matches!(self.state, SinkState::Writing(_)) {
            return Err(RecordingError::AlreadyRecording);
        }
        if let Some(pending) = self.finalizing.take() {
            if !pending.done.load(Ordering::Acquire) {
                self.finalizing = Some(pending);
                return Err(RecordingError::StillFinalizing);
            }
            if pending.writer.join().is_err() {
                warn!("Previous recording writer panicked");
            }
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed previous recording"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RecordingError::RemoveExisting(e)),
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(RecordingError::CreateContainer)?;
        }

        let muxer = self.factory.create(&self.path, self.target)?;
        let (tx, rx) = mpsc::channel();
        let done = Arc::new(AtomicBool::new(false));
        let backlog = Arc::new(AtomicUsize::new(0));
        let writer_done = done.clone();
        let writer_backlog = backlog.clone();
        let writer = thread::Builder::new()
            .name("recording-writer".to_string())
            .spawn(move || run_writer(muxer, rx, writer_done, writer_backlog))
            .map_err(RecordingError::CreateContainer)?;

        info!(
            path = %self.path.display(),
            width = self.target.width,
            height = self.target.height,
            "Recording started"
        );
        self.state = SinkState::Writing(Session {
            tx,
            writer,
            done,
            backlog,
            origin: None,
            frames: 0,
            last_pts: None,
        });
        Ok(())
    }

    /// Queues `frame` for writing and returns whether it reached the writer.
    /// Outside a session this does nothing.
    pub fn accept(&mut self, frame: &Frame) -> bool {
        let SinkState::Writing(session) = &mut self.state else {
            return false;
        };
        if session.origin.is_none() {
            session.origin = Some(frame.pts);
            debug!(pts = frame.pts.as_secs_f64(), "Recording origin set");
            if session.tx.send(WriterCommand::Start(frame.pts)).is_err() {
                return false;
            }
        }
        session.backlog.fetch_add(1, Ordering::AcqRel);
        if session.tx.send(WriterCommand::Append(frame.clone())).is_err() {
            session.backlog.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        session.frames += 1;
        session.last_pts = Some(frame.pts);
        true
    }

    /// Frames of the active session still waiting for the writer.
    pub fn backlog(&self) -> usize {
        match &self.state {
            SinkState::Writing(session) => session.backlog.load(Ordering::Acquire),
            SinkState::Idle => 0,
        }
    }

    /// Ends the session. The returned future resolves once the file is final.
    pub fn stop(&mut self) -> Result<Finalizing, RecordingError> {
        let SinkState::Writing(session) = std::mem::replace(&mut self.state, SinkState::Idle) else {
            return Err(RecordingError::NotRecording);
        };

        let (reply, rx) = oneshot::channel();
        let summary = RecordingSummary {
            path: self.path.clone(),
            frames: session.frames,
            first_pts: session.origin,
            last_pts: session.last_pts,
        };
        info!(frames = session.frames, "Recording stopping");
        // a send failure drops `reply`, which resolves the future as WriterGone
        let _ = session.tx.send(WriterCommand::Finish { summary, reply });
        self.finalizing = Some(PendingWriter {
            writer: session.writer,
            done: session.done,
        });
        Ok(Finalizing { rx })
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, SinkState::Writing(_))
    }

    /// Origin of the active session, once its first frame arrived.
    pub fn origin(&self) -> Option<MediaTime> {
        match &self.state {
            SinkState::Writing(session) => session.origin,
            SinkState::Idle => None,
        }
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing
            .as_ref()
            .is_some_and(|pending| !pending.done.load(Ordering::Acquire))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target(&self) -> TargetSize {
        self.target
    }
}

fn run_writer(
    muxer: Box<dyn Muxer>,
    rx: mpsc::Receiver<WriterCommand>,
    done: Arc<AtomicBool>,
    backlog: Arc<AtomicUsize>,
) {
    let mut muxer = Some(muxer);
    let mut failure: Option<RecordingError> = None;

    for command in rx.iter() {
        match command {
            WriterCommand::Start(origin) => {
                let Some(m) = muxer.as_mut().filter(|_| failure.is_none()) else {
                    continue;
                };
                if let Err(e) = m.start_session(origin) {
                    error!("Failed to start recording session: {}", e);
                    failure = Some(e);
                }
            }
            WriterCommand::Append(frame) => {
                // after a write error the rest of the session is discarded
                if let Some(m) = muxer.as_mut().filter(|_| failure.is_none()) {
                    if let Err(e) = m.append(&frame) {
                        error!("Failed to append frame: {}", e);
                        failure = Some(e);
                    }
                }
                backlog.fetch_sub(1, Ordering::AcqRel);
            }
            WriterCommand::Finish { summary, reply } => {
                let finished = muxer.take().map(|m| m.finish());
                let result = match (failure.take(), finished) {
                    (Some(e), _) => Err(e),
                    (None, Some(Err(e))) => Err(e),
                    (None, _) => Ok(summary),
                };
                match &result {
                    Ok(summary) => info!(
                        path = %summary.path.display(),
                        frames = summary.frames,
                        "Recording finalized"
                    ),
                    Err(e) => error!("Recording finalization failed: {}", e),
                }
                done.store(true, Ordering::Release);
                let _ = reply.send(result);
                return;
            }
        }
    }

    // Sink dropped mid-session; close the file so it stays readable.
    if let Some(m) = muxer.take() {
        if let Err(e) = m.finish() {
            error!("Failed to finalize abandoned recording: {}", e);
        }
    }
    done.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_frame, MemoryMuxerFactory};

    fn sink(dir: &tempfile::TempDir) -> (RecordingSink<MemoryMuxerFactory>, MemoryMuxerFactory) {
        let factory = MemoryMuxerFactory::default();
        let sink = RecordingSink::new(
            factory.clone(),
            dir.path().join("recording.mov"),
            TargetSize::default(),
        );
        (sink, factory)
    }

    fn pts(i: i64) -> MediaTime {
        MediaTime::new(9_000 + i * 3_000, 90_000)
    }

    #[test]
    fn accept_outside_session_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, factory) = sink(&dir);
        assert!(!sink.accept(&test_frame(pts(0))));
        assert!(!sink.is_recording());
        assert!(factory.log.lock().unwrap().created.is_empty());
        assert!(matches!(sink.stop(), Err(RecordingError::NotRecording)));
    }

    #[test]
    fn start_replaces_existing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, factory) = sink(&dir);
        std::fs::write(sink.path(), b"stale recording").unwrap();

        sink.start().unwrap();
        assert!(sink.is_recording());
        let log = factory.log.lock().unwrap();
        assert_eq!(log.path_occupied, vec![false]);
        assert_eq!(log.created.len(), 1);
        assert_eq!(log.created[0].1, TargetSize { width: 720, height: 1280 });
    }

    #[test]
    fn five_frames_keep_their_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, factory) = sink(&dir);
        sink.start().unwrap();
        for i in 0..5 {
            sink.accept(&test_frame(pts(i)));
        }
        assert_eq!(sink.origin(), Some(pts(0)));

        let summary = pollster::block_on(sink.stop().unwrap()).unwrap();
        assert_eq!(summary.frames, 5);
        assert_eq!(summary.first_pts, Some(pts(0)));
        assert_eq!(summary.last_pts, Some(pts(4)));

        let log = factory.log.lock().unwrap();
        assert_eq!(log.origin, Some(pts(0)));
        assert_eq!(log.appended, (0..5).map(pts).collect::<Vec<_>>());
        assert_eq!(log.finished, 1);
    }

    #[test]
    fn backlog_counts_frames_the_writer_has_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, factory) = sink(&dir);
        assert_eq!(sink.backlog(), 0);
        sink.start().unwrap();

        let gate = factory.append_gate.lock().unwrap();
        for i in 0..5 {
            assert!(sink.accept(&test_frame(pts(i))));
        }
        // the first append is blocked, so nothing has been written yet
        assert_eq!(sink.backlog(), 5);
        drop(gate);

        let summary = pollster::block_on(sink.stop().unwrap()).unwrap();
        assert_eq!(summary.frames, 5);
        assert_eq!(sink.backlog(), 0);
    }

    #[test]
    fn origin_is_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, _factory) = sink(&dir);
        sink.start().unwrap();
        sink.accept(&test_frame(pts(2)));
        sink.accept(&test_frame(pts(3)));
        sink.accept(&test_frame(pts(4)));
        assert_eq!(sink.origin(), Some(pts(2)));
        let _ = pollster::block_on(sink.stop().unwrap());
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, factory) = sink(&dir);
        sink.start().unwrap();
        sink.accept(&test_frame(pts(0)));
        assert!(matches!(sink.start(), Err(RecordingError::AlreadyRecording)));
        assert!(sink.is_recording());
        assert_eq!(sink.origin(), Some(pts(0)));
        assert_eq!(factory.log.lock().unwrap().created.len(), 1);
        let _ = pollster::block_on(sink.stop().unwrap());
    }

    #[test]
    fn frames_after_stop_are_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, factory) = sink(&dir);
        sink.start().unwrap();
        sink.accept(&test_frame(pts(0)));
        let finalizing = sink.stop().unwrap();
        sink.accept(&test_frame(pts(1)));
        pollster::block_on(finalizing).unwrap();
        assert_eq!(factory.log.lock().unwrap().appended, vec![pts(0)]);
    }

    #[test]
    fn failed_create_leaves_sink_idle() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryMuxerFactory {
            fail_create: true,
            ..Default::default()
        };
        let mut sink = RecordingSink::new(factory, dir.path().join("out.mov"), TargetSize::default());
        assert!(matches!(sink.start(), Err(RecordingError::AddTrack(_))));
        assert!(!sink.is_recording());
        assert!(!sink.accept(&test_frame(pts(0))));
    }

    #[test]
    fn restart_waits_for_finalization() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, factory) = sink(&dir);
        sink.start().unwrap();
        sink.accept(&test_frame(pts(0)));

        let gate = factory.finish_gate.lock().unwrap();
        let finalizing = sink.stop().unwrap();
        assert!(!sink.is_recording());
        assert!(matches!(sink.start(), Err(RecordingError::StillFinalizing)));
        drop(gate);

        pollster::block_on(finalizing).unwrap();
        assert!(!sink.is_finalizing());
        sink.start().unwrap();
        assert!(sink.is_recording());
        let _ = pollster::block_on(sink.stop().unwrap());
    }
}
