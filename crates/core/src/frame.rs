//! Frame types shared by capture, encoder and subsession.
//!
//! Ownership rules:
//!
//! - A [`RawFrame`] is moved, never shared. The capture worker owns it until
//!   it is handed to the encoder; the encoder either keeps it or hands it
//!   back through [`QueueResult`](crate::encoder::QueueResult).
//! - An [`EncodedFrame`] borrows the encoder's output buffer for the duration
//!   of one [`OutputListener::on_frame_output`] call.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Camera pixel formats understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0, full Y plane followed by interleaved V/U samples.
    Nv21,
}

impl PixelFormat {
    pub fn bits_per_pixel(self) -> usize {
        match self {
            Self::Nv21 => 12,
        }
    }

    /// Byte length of one frame of `size` in this format.
    pub fn frame_len(self, size: Size) -> usize {
        size.width as usize * size.height as usize * self.bits_per_pixel() / 8
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Size {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// An uncompressed camera frame backed by a pool buffer.
pub struct RawFrame {
    pub data: Vec<u8>,
    pub format: PixelFormat,
    pub size: Size,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, format: PixelFormat, size: Size) -> Self {
        Self { data, format, size }
    }

    /// Whether the buffer length matches the negotiated format and size.
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.format.frame_len(self.size)
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("format", &self.format)
            .field("size", &self.size)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One encoded access unit.
#[derive(Debug, Clone, Copy)]
pub struct EncodedFrame<'a> {
    pub data: &'a [u8],
    /// Presentation time in microseconds, non-decreasing within one
    /// encoder session.
    pub presentation_time_us: u64,
}

impl EncodedFrame<'_> {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Receives encoded frames from a [`FrameSource`].
///
/// Called on the source's delivery thread. Implementations must return
/// quickly and copy anything they need to keep.
pub trait OutputListener: Send + Sync {
    fn on_frame_output(&self, frame: &EncodedFrame<'_>);
}

impl<F> OutputListener for F
where
    F: Fn(&EncodedFrame<'_>) + Send + Sync,
{
    fn on_frame_output(&self, frame: &EncodedFrame<'_>) {
        self(frame)
    }
}

/// A producer of timestamped encoded frames.
pub trait FrameSource: Send + Sync {
    /// Begin producing frames.
    fn start(&self) -> Result<()>;

    /// Stop producing frames. Idempotent.
    fn stop(&self);

    /// Replace the listener that receives encoded frames.
    fn set_output_listener(&self, listener: Option<Arc<dyn OutputListener>>);

    /// Make the next produced frame decodable on its own.
    fn request_key_frame(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv21_frame_len() {
        assert_eq!(PixelFormat::Nv21.frame_len(Size::new(640, 480)), 460_800);
        assert_eq!(PixelFormat::Nv21.frame_len(Size::new(4, 2)), 12);
    }

    #[test]
    fn raw_frame_completeness() {
        let size = Size::new(4, 2);
        assert!(RawFrame::new(vec![0; 12], PixelFormat::Nv21, size).is_complete());
        assert!(!RawFrame::new(vec![0; 11], PixelFormat::Nv21, size).is_complete());
    }

    #[test]
    fn closures_are_listeners() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        let listener: Arc<dyn OutputListener> = Arc::new(move |f: &EncodedFrame<'_>| {
            sink.store(f.presentation_time_us, Ordering::SeqCst);
        });
        listener.on_frame_output(&EncodedFrame {
            data: &[0, 0, 1, 0x65],
            presentation_time_us: 33_333,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 33_333);
    }
}
