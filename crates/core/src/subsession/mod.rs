//! Media subsessions: the glue between a [`FrameSource`] and the RTSP server.
//!
//! The server asks its video delegate for a subsession once per start. The
//! delegate wires the source's output into the returned [`Track`] and starts
//! or stops the source as the first viewer arrives and the last one leaves.

mod track;

pub use track::{MediaClock, Track, VIDEO_TRACK_CONTROL};

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::encoder::EncoderKind;
use crate::error::Result;
use crate::frame::{EncodedFrame, FrameSource};
use crate::media::h264::H264Packetizer;
use crate::server::ServerHandle;

/// Dynamic RTP payload type used for video.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

/// Whether a subsession currently has viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Live,
}

/// Handle to a subsession created for a running server.
#[derive(Clone)]
pub struct SubsessionHandle {
    pub track: Arc<Track>,
}

/// Binds a media source to the server's sessions.
///
/// `on_stream_create` and `on_stream_close` are called by the server on the
/// first PLAY and after the last viewer leaves. They always alternate.
pub trait MediaSubsessionDelegate: Send + Sync {
    /// Build the server-side track for `server` and route the source's
    /// output into it. Replaces any track from an earlier server start.
    fn create_media_subsession(&self, server: &ServerHandle) -> Result<SubsessionHandle>;

    fn on_stream_create(&self);

    fn on_stream_close(&self);

    /// Another viewer started playing while the stream is already live.
    fn on_viewer_joined(&self) {}

    /// Whether the subsession is live, so a freshly started capture knows
    /// to start the encoder too.
    fn is_stream_running(&self) -> bool;
}

/// H.264 video subsession.
pub struct H264Subsession {
    source: Arc<dyn FrameSource>,
    state: Mutex<SessionState>,
    track: RwLock<Option<Arc<Track>>>,
}

impl H264Subsession {
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self {
            source,
            state: Mutex::new(SessionState::Idle),
            track: RwLock::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn track(&self) -> Option<Arc<Track>> {
        self.track.read().clone()
    }
}

impl MediaSubsessionDelegate for H264Subsession {
    fn create_media_subsession(&self, server: &ServerHandle) -> Result<SubsessionHandle> {
        let track = Arc::new(Track::new(
            Box::new(H264Packetizer::with_random_ssrc(VIDEO_PAYLOAD_TYPE)),
            server.clone(),
        ));

        let sink = track.clone();
        self.source
            .set_output_listener(Some(Arc::new(move |frame: &EncodedFrame<'_>| {
                sink.deliver(frame);
            })));

        *self.track.write() = Some(track.clone());
        tracing::debug!(control = track.control(), "H.264 subsession created");
        Ok(SubsessionHandle { track })
    }

    fn on_stream_create(&self) {
        let mut state = self.state.lock();
        *state = SessionState::Live;
        tracing::info!("video subsession live");
        if let Err(e) = self.source.start() {
            tracing::warn!(error = %e, "frame source did not start");
        }
    }

    fn on_stream_close(&self) {
        let mut state = self.state.lock();
        *state = SessionState::Idle;
        self.source.stop();
        tracing::info!("video subsession idle");
    }

    fn on_viewer_joined(&self) {
        if self.is_stream_running() {
            self.source.request_key_frame();
        }
    }

    fn is_stream_running(&self) -> bool {
        *self.state.lock() == SessionState::Live
    }
}

/// The video delegate matching an encoder kind.
pub fn create_video_delegate(
    kind: EncoderKind,
    source: Arc<dyn FrameSource>,
) -> Arc<dyn MediaSubsessionDelegate> {
    match kind {
        EncoderKind::OpenH264 => Arc::new(H264Subsession::new(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::frame::OutputListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        starts: AtomicUsize,
        stops: AtomicUsize,
        key_frames: AtomicUsize,
        fail: bool,
        listener: RwLock<Option<Arc<dyn OutputListener>>>,
    }

    impl FrameSource for CountingSource {
        fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StreamError::EncoderConfig("not configured".into()));
            }
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn set_output_listener(&self, listener: Option<Arc<dyn OutputListener>>) {
            *self.listener.write() = listener;
        }

        fn request_key_frame(&self) {
            self.key_frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn open_and_close_drive_the_source() {
        let source = Arc::new(CountingSource::default());
        let subsession = H264Subsession::new(source.clone());
        assert!(!subsession.is_stream_running());

        subsession.on_stream_create();
        assert!(subsession.is_stream_running());
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);

        subsession.on_stream_close();
        assert_eq!(subsession.state(), SessionState::Idle);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_viewer_asks_for_a_key_frame() {
        let source = Arc::new(CountingSource::default());
        let subsession = H264Subsession::new(source.clone());

        subsession.on_viewer_joined();
        assert_eq!(source.key_frames.load(Ordering::SeqCst), 0);

        subsession.on_stream_create();
        subsession.on_viewer_joined();
        assert_eq!(source.key_frames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn source_failure_keeps_subsession_live() {
        let source = Arc::new(CountingSource {
            fail: true,
            ..CountingSource::default()
        });
        let subsession = H264Subsession::new(source);
        subsession.on_stream_create();
        // Capture starts the encoder later once the camera is configured.
        assert!(subsession.is_stream_running());
    }

    #[test]
    fn create_routes_source_output_to_track() {
        let source = Arc::new(CountingSource::default());
        let subsession = H264Subsession::new(source.clone());
        let server = ServerHandle::detached().unwrap();

        let handle = subsession.create_media_subsession(&server).unwrap();
        assert_eq!(handle.track.control(), "track1");
        assert!(subsession.track().is_some());

        let listener = source.listener.read().clone().unwrap();
        let idr = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
        listener.on_frame_output(&EncodedFrame {
            data: &idr,
            presentation_time_us: 0,
        });
        let attrs = handle.track.sdp_attributes();
        assert!(attrs.iter().any(|a| a.contains("sprop-parameter-sets=")));
    }
}
