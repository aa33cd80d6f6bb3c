//! Reusable raw frame buffers.
//!
//! The pool is filled once when streaming starts. The camera takes a buffer
//! for every frame it produces; whoever ends up holding the frame hands the
//! buffer back through a [`FrameRecycler`]. When the pool is empty the camera
//! skips frames instead of allocating.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::frame::{PixelFormat, RawFrame, Size};

/// Fixed set of pre-allocated frame buffers for one streaming session.
pub struct FrameBufferPool {
    format: PixelFormat,
    size: Size,
    capacity: usize,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl FrameBufferPool {
    /// Allocate `capacity` buffers of `format.frame_len(size)` bytes each.
    pub fn new(format: PixelFormat, size: Size, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        let buffer_len = format.frame_len(size);
        for _ in 0..capacity {
            // The receiver is alive, send cannot fail here.
            let _ = tx.send(vec![0u8; buffer_len]);
        }

        tracing::debug!(%size, capacity, buffer_len, "frame buffer pool allocated");

        Self {
            format,
            size,
            capacity,
            tx,
            rx,
        }
    }

    /// A handle that returns buffers to this pool.
    pub fn recycler(&self) -> FrameRecycler {
        FrameRecycler {
            tx: self.tx.clone(),
            buffer_len: self.buffer_len(),
        }
    }

    /// Take a free buffer as an empty frame, or `None` if every buffer is in
    /// flight.
    pub fn acquire(&self) -> Option<RawFrame> {
        self.rx
            .try_recv()
            .ok()
            .map(|data| RawFrame::new(data, self.format, self.size))
    }

    pub fn buffer_len(&self) -> usize {
        self.format.frame_len(self.size)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> Size {
        self.size
    }
}

/// Returns frame buffers to the [`FrameBufferPool`] they came from.
///
/// Cheap to clone. Buffers of the wrong length are dropped, as are buffers
/// returned after the pool itself was dropped.
#[derive(Clone)]
pub struct FrameRecycler {
    tx: Sender<Vec<u8>>,
    buffer_len: usize,
}

impl FrameRecycler {
    /// Re-register `frame`'s buffer with the pool. Returns whether the pool
    /// took it back.
    pub fn recycle(&self, frame: RawFrame) -> bool {
        if frame.data.len() != self.buffer_len {
            tracing::warn!(
                len = frame.data.len(),
                expected = self.buffer_len,
                "dropping mis-sized frame buffer"
            );
            return false;
        }
        self.tx.send(frame.data).is_ok()
    }
}

impl std::fmt::Debug for FrameRecycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRecycler")
            .field("buffer_len", &self.buffer_len)
            .finish()
    }
}
