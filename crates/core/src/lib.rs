//! Live camera streaming over RTSP.
//!
//! A [`CaptureWorker`] pulls NV21 frames from a camera, an encoder turns
//! them into H.264 access units, a media subsession packetizes them into RTP
//! and the [`RtspServer`] delivers them to every playing client.
//! [`StreamOrchestrator`] wires the pieces together.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rtsplive::{LifecycleEvent, StreamConfig, StreamOrchestrator, TestPatternCamera};
//!
//! let stream = StreamOrchestrator::new(Arc::new(TestPatternCamera::default()), StreamConfig::default())?;
//! stream.start_rtsp_server();
//! stream.handle_lifecycle(LifecycleEvent::Foreground);
//! if let Some(url) = stream.stream_url().wait_timeout(Duration::from_secs(5)) {
//!     println!("streaming at {url}");
//! }
//! # Ok::<(), rtsplive::StreamError>(())
//! ```

pub mod capture;
pub mod encoder;
pub mod error;
pub mod executor;
pub mod frame;
pub mod media;
pub mod protocol;
pub mod resolution;
pub mod server;
pub mod service;
pub mod session;
pub mod stream;
pub mod subsession;
pub mod transport;

pub use capture::synthetic::{TestPatternCamera, TestPatternSettings};
pub use capture::{CaptureConfig, CaptureStatus, CaptureWorker};
pub use encoder::{EncoderKind, QueueResult, Rotation, VideoEncoder};
pub use error::{Result, StreamError};
pub use executor::{Executor, SerialExecutor};
pub use frame::{EncodedFrame, FrameSource, OutputListener, PixelFormat, RawFrame, Size};
pub use resolution::VideoQuality;
pub use server::{RtspServer, RtspServerBuilder, ServerConfig, ServerListener, ServerResult};
pub use stream::{LifecycleEvent, StreamConfig, StreamOrchestrator, StreamUrl};
pub use subsession::MediaSubsessionDelegate;
