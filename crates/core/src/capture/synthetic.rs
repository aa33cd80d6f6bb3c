//! A camera that draws a moving test pattern.
//!
//! Lets the whole pipeline run on machines without camera hardware. The
//! backend exposes a single camera (id 0) and enforces exclusive use like a
//! real driver: a second `open` fails until the first handle is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;

use crate::capture::device::{
    CameraBackend, CameraDevice, CameraFacing, CameraId, CameraInfo, FrameSink, PreviewDisplay,
};
use crate::capture::pool::FrameBufferPool;
use crate::error::{Result, StreamError};
use crate::frame::{PixelFormat, Size};
use crate::resolution::VideoQuality;

/// What the synthetic camera claims to support.
#[derive(Debug, Clone)]
pub struct TestPatternSettings {
    pub supported_sizes: Vec<Size>,
    pub profiles: Vec<VideoQuality>,
    pub facing: CameraFacing,
    pub orientation: u32,
    pub fps: u32,
}

impl Default for TestPatternSettings {
    fn default() -> Self {
        Self {
            supported_sizes: vec![
                Size::new(176, 144),
                Size::new(320, 240),
                Size::new(640, 480),
                Size::new(1280, 720),
            ],
            profiles: vec![VideoQuality::Qvga, VideoQuality::P480, VideoQuality::P720],
            facing: CameraFacing::Back,
            orientation: 0,
            fps: 30,
        }
    }
}

/// [`CameraBackend`] producing NV21 test patterns.
#[derive(Clone)]
pub struct TestPatternCamera {
    settings: TestPatternSettings,
    in_use: Arc<AtomicBool>,
}

impl TestPatternCamera {
    pub fn new(settings: TestPatternSettings) -> Self {
        Self {
            settings,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a device handle is currently open.
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl Default for TestPatternCamera {
    fn default() -> Self {
        Self::new(TestPatternSettings::default())
    }
}

impl CameraBackend for TestPatternCamera {
    fn open(&self, id: CameraId) -> Result<Box<dyn CameraDevice>> {
        if id != 0 {
            return Err(StreamError::DeviceUnavailable(format!("no camera with id {id}")));
        }
        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(StreamError::DeviceUnavailable(format!("camera {id} is in use")));
        }

        tracing::debug!(id, "test pattern camera opened");

        Ok(Box::new(TestPatternDevice {
            settings: self.settings.clone(),
            in_use: self.in_use.clone(),
            configured: None,
            display: Arc::new(RwLock::new(None)),
            producer: None,
            released: false,
        }))
    }
}

struct Producer {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct TestPatternDevice {
    settings: TestPatternSettings,
    in_use: Arc<AtomicBool>,
    configured: Option<Size>,
    display: Arc<RwLock<Option<Arc<dyn PreviewDisplay>>>>,
    producer: Option<Producer>,
    released: bool,
}

impl CameraDevice for TestPatternDevice {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            facing: self.settings.facing,
            orientation: self.settings.orientation,
        }
    }

    fn supported_preview_sizes(&self) -> Vec<Size> {
        self.settings.supported_sizes.clone()
    }

    fn has_profile(&self, quality: VideoQuality) -> bool {
        self.settings.profiles.contains(&quality)
    }

    fn configure(&mut self, format: PixelFormat, size: Size) -> Result<()> {
        if self.released {
            return Err(StreamError::DeviceUnavailable("camera released".into()));
        }
        if format != PixelFormat::Nv21 || !self.settings.supported_sizes.contains(&size) {
            return Err(StreamError::DeviceUnavailable(format!(
                "unsupported preview parameters {format:?} {size}"
            )));
        }
        self.configured = Some(size);
        Ok(())
    }

    fn set_preview_display(&mut self, display: Option<Arc<dyn PreviewDisplay>>) {
        *self.display.write() = display;
    }

    fn start_streaming(&mut self, pool: FrameBufferPool, sink: FrameSink) -> Result<()> {
        let size = self
            .configured
            .ok_or_else(|| StreamError::DeviceUnavailable("camera not configured".into()))?;
        if pool.size() != size {
            return Err(StreamError::DeviceUnavailable(format!(
                "buffer size {} does not match preview size {size}",
                pool.size()
            )));
        }
        self.stop_streaming();

        let running = Arc::new(AtomicBool::new(true));
        let interval = Duration::from_secs(1) / self.settings.fps.max(1);
        let display = self.display.clone();
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name("camera-frames".into())
            .spawn(move || produce_frames(pool, sink, display, flag, interval))?;

        self.producer = Some(Producer { running, handle });
        tracing::debug!(%size, fps = self.settings.fps, "test pattern streaming started");
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.running.store(false, Ordering::SeqCst);
            if producer.handle.join().is_err() {
                tracing::warn!("camera frame thread panicked");
            }
            tracing::debug!("test pattern streaming stopped");
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop_streaming();
        self.configured = None;
        self.released = true;
        self.in_use.store(false, Ordering::SeqCst);
        tracing::debug!("test pattern camera released");
    }
}

impl Drop for TestPatternDevice {
    fn drop(&mut self) {
        self.release();
    }
}

fn produce_frames(
    pool: FrameBufferPool,
    sink: FrameSink,
    display: Arc<RwLock<Option<Arc<dyn PreviewDisplay>>>>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut tick: u32 = 0;
    let mut skipped: u64 = 0;

    while running.load(Ordering::SeqCst) {
        thread::sleep(interval);

        let Some(mut frame) = pool.acquire() else {
            skipped += 1;
            tracing::trace!(skipped, "no free frame buffer, skipping tick");
            continue;
        };

        draw_pattern(&mut frame.data, frame.size, tick);
        if let Some(display) = display.read().as_ref() {
            display.render(&frame);
        }
        sink.deliver(frame);
        tick = tick.wrapping_add(1);
    }

    tracing::debug!(frames = tick, skipped, "camera frame thread exiting");
}

/// Diagonal luma gradient scrolling with `tick`, over four chroma bands.
fn draw_pattern(data: &mut [u8], size: Size, tick: u32) {
    let (w, h) = (size.width as usize, size.height as usize);
    let shift = (tick as usize).wrapping_mul(4);
    let (luma, chroma) = data.split_at_mut(w * h);

    for (y, row) in luma.chunks_exact_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = ((x + y + shift) & 0xff) as u8;
        }
    }

    const BANDS: [(u8, u8); 4] = [(128, 128), (200, 60), (60, 200), (90, 90)];
    for (y, row) in chroma.chunks_exact_mut(w).enumerate() {
        let (v, u) = BANDS[(y * 8 / h.max(1)) % BANDS.len()];
        for pair in row.chunks_exact_mut(2) {
            pair[0] = v;
            pair[1] = u;
        }
    }
}
