//! Camera hardware abstraction.
//!
//! A [`CameraBackend`] opens [`CameraDevice`]s by id. A device is an
//! exclusively owned hardware handle: it is opened, configured and driven
//! from the capture worker's thread only, and must be released before
//! another `open` of the same id can succeed.

use std::fmt;
use std::sync::Arc;

use crate::capture::pool::FrameBufferPool;
use crate::error::Result;
use crate::frame::{PixelFormat, RawFrame, Size};
use crate::resolution::VideoQuality;

/// Camera identifier as understood by the backend.
pub type CameraId = u32;

/// Direction the camera faces relative to the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

/// Static information about a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraInfo {
    pub facing: CameraFacing,
    /// Clockwise rotation, in degrees, that makes the sensor image upright.
    /// Becomes the encoder rotation.
    pub orientation: u32,
}

/// Where preview frames are shown locally.
///
/// Rendering happens on the camera's own frame thread before the frame is
/// handed on for encoding.
pub trait PreviewDisplay: Send + Sync {
    fn name(&self) -> &str;
    fn render(&self, frame: &RawFrame);
}

/// Callback that receives every frame the camera produces.
#[derive(Clone)]
pub struct FrameSink(Arc<dyn Fn(RawFrame) + Send + Sync>);

impl FrameSink {
    pub fn new(f: impl Fn(RawFrame) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn deliver(&self, frame: RawFrame) {
        (self.0)(frame)
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameSink")
    }
}

/// An open camera.
pub trait CameraDevice: Send {
    fn info(&self) -> CameraInfo;

    /// Preview sizes the sensor can produce.
    fn supported_preview_sizes(&self) -> Vec<Size>;

    /// Whether the device advertises a recording profile for `quality`.
    fn has_profile(&self, quality: VideoQuality) -> bool;

    /// Apply pixel format and preview size. Fails with
    /// [`DeviceUnavailable`](crate::StreamError::DeviceUnavailable) when the
    /// device rejects the parameters.
    fn configure(&mut self, format: PixelFormat, size: Size) -> Result<()>;

    fn set_preview_display(&mut self, display: Option<Arc<dyn PreviewDisplay>>);

    /// Start producing frames into buffers taken from `pool`.
    ///
    /// The device keeps the pool until [`stop_streaming`](Self::stop_streaming);
    /// a frame is only produced when a free buffer is available.
    fn start_streaming(&mut self, pool: FrameBufferPool, sink: FrameSink) -> Result<()>;

    /// Stop producing frames and drop the registered buffers. Idempotent.
    fn stop_streaming(&mut self);

    /// Give the hardware back. The handle must not be used afterwards.
    fn release(&mut self);
}

/// Opens camera devices.
pub trait CameraBackend: Send + Sync {
    fn open(&self, id: CameraId) -> Result<Box<dyn CameraDevice>>;
}
