//! Video encoders.
//!
//! An encoder moves through three states:
//!
//! ```text
//! Uninitialized --init_resolution--> Configured --start--> Running
//!                                        ^                    |
//!                                        +-------stop---------+
//! ```
//!
//! Frames are offered with [`VideoEncoder::queue_input_frame`], which never
//! blocks. Outside `Running`, or when the encoder's input queue is full, the
//! frame is declined and handed straight back to the caller.

pub mod h264;
pub mod yuv;

use std::fmt;
use std::sync::Arc;

use crate::capture::pool::FrameRecycler;
use crate::error::{Result, StreamError};
use crate::frame::{FrameSource, RawFrame, Size};

pub use h264::H264Encoder;

/// MIME type of H.264 elementary streams.
pub const MIME_AVC: &str = "video/avc";

/// Clockwise rotation applied to frames before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether the encoded picture is the input picture turned on its side.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

impl TryFrom<u32> for Rotation {
    type Error = StreamError;

    fn try_from(degrees: u32) -> Result<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(StreamError::EncoderConfig(format!(
                "unsupported rotation {other}"
            ))),
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Outcome of offering a frame to an encoder.
#[derive(Debug)]
pub enum QueueResult {
    /// The encoder took the frame. Its buffer comes back through the
    /// recycler once the encoder is done with it.
    Accepted,
    /// Not running, or no room right now. The frame is returned untouched.
    Declined(RawFrame),
    /// The frame could not be encoded. The frame is returned untouched.
    Failed(RawFrame, StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Configured,
    Running,
}

/// Negotiated encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderFormat {
    /// Size of the incoming camera frames.
    pub size: Size,
    pub rotation: Rotation,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub frame_rate: u32,
}

impl EncoderFormat {
    /// Size of the encoded picture after rotation.
    pub fn output_size(&self) -> Size {
        if self.rotation.swaps_dimensions() {
            Size::new(self.size.height, self.size.width)
        } else {
            self.size
        }
    }
}

const MIN_BITRATE: u32 = 200_000;
const MAX_BITRATE: u32 = 8_000_000;

/// Target bitrate for a picture size: three bits per pixel per second,
/// clamped to a sane range.
///
/// ```
/// use rtsplive::encoder::bitrate_for;
/// use rtsplive::frame::Size;
///
/// assert_eq!(bitrate_for(Size::new(640, 480)), 921_600);
/// assert_eq!(bitrate_for(Size::new(176, 144)), 200_000);
/// ```
pub fn bitrate_for(size: Size) -> u32 {
    let pixels = u64::from(size.width) * u64::from(size.height);
    (pixels * 3).clamp(u64::from(MIN_BITRATE), u64::from(MAX_BITRATE)) as u32
}

/// Encoder tuning that does not depend on the camera.
#[derive(Debug, Clone, Copy)]
pub struct EncoderSettings {
    pub frame_rate: u32,
    /// Frames the encoder buffers before it starts declining input.
    pub input_queue: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            input_queue: 1,
        }
    }
}

/// A [`FrameSource`] that encodes raw camera frames.
pub trait VideoEncoder: FrameSource {
    fn mime(&self) -> &'static str;

    /// Current target bitrate in bits per second, 0 before
    /// [`init_resolution`](Self::init_resolution).
    fn bitrate(&self) -> u32;

    /// Configure for frames of `size` rotated by `rotation`.
    ///
    /// Width and height must be non-zero and even. Reconfiguring a running
    /// encoder with different parameters restarts it.
    fn init_resolution(&self, size: Size, rotation: Rotation) -> Result<()>;

    /// Offer one frame. Never blocks.
    ///
    /// When the frame is accepted its buffer is returned through `recycler`
    /// after encoding; otherwise it is handed back in the result.
    fn queue_input_frame(&self, frame: RawFrame, recycler: &FrameRecycler) -> QueueResult;

    fn state(&self) -> EncoderState;

    /// Parameters from the last successful `init_resolution`.
    fn format(&self) -> Option<EncoderFormat>;
}

/// Encoder implementations available to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderKind {
    /// Software H.264 via OpenH264.
    #[default]
    OpenH264,
}

impl EncoderKind {
    pub fn mime(self) -> &'static str {
        match self {
            Self::OpenH264 => MIME_AVC,
        }
    }
}

pub fn create_video_encoder(kind: EncoderKind, settings: EncoderSettings) -> Arc<dyn VideoEncoder> {
    match kind {
        EncoderKind::OpenH264 => Arc::new(H264Encoder::new(settings)),
    }
}

pub(crate) fn validate_dimensions(size: Size) -> Result<()> {
    if size.width == 0 || size.height == 0 {
        return Err(StreamError::EncoderConfig(format!("empty frame size {size}")));
    }
    if size.width % 2 != 0 || size.height % 2 != 0 {
        return Err(StreamError::EncoderConfig(format!(
            "frame size {size} must have even dimensions"
        )));
    }
    Ok(())
}
