//! Camera capture.
//!
//! [`CaptureWorker`] owns the camera device and performs every device
//! operation on one dedicated thread. Its public methods post a command and
//! return immediately; frames produced by the camera come back to the same
//! thread and are offered to the encoder there.
//!
//! Buffer flow for a single-buffer pool:
//!
//! ```text
//! pool --acquire--> camera fills --> worker --queue_input_frame--> encoder
//!  ^                                   |                               |
//!  +------------- declined ------------+                               |
//!  +--------------------------- after conversion ----------------------+
//! ```

pub mod device;
pub mod pool;
pub mod synthetic;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::encoder::{QueueResult, Rotation, VideoEncoder};
use crate::error::{Result, StreamError};
use crate::frame::{PixelFormat, RawFrame, Size};
use crate::resolution::{VideoQuality, resolve_quality, select_preview_size};
use crate::subsession::MediaSubsessionDelegate;

use device::{CameraBackend, CameraDevice, CameraId, FrameSink, PreviewDisplay};
use pool::{FrameBufferPool, FrameRecycler};

/// Capture settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub camera_id: CameraId,
    pub quality: VideoQuality,
    /// Number of frame buffers in flight at once.
    pub pool_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            quality: VideoQuality::P480,
            pool_size: 1,
        }
    }
}

/// Snapshot of the worker's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStatus {
    pub opened: bool,
    pub streaming: bool,
    /// Last negotiated preview size. Kept after the camera is closed.
    pub preview_size: Option<Size>,
    pub rotation: Option<Rotation>,
    pub frames_delivered: u64,
    pub frames_accepted: u64,
    pub frames_declined: u64,
    pub frames_failed: u64,
}

enum Command {
    Open,
    StartPreview,
    StopPreview,
    SetDisplay(Option<Arc<dyn PreviewDisplay>>),
    SetQuality(VideoQuality),
    Frame { frame: RawFrame, generation: u64 },
    Sync(Sender<()>),
    Shutdown,
}

/// Owns the camera and feeds its frames to a [`VideoEncoder`].
pub struct CaptureWorker {
    tx: Sender<Command>,
    status: Arc<RwLock<CaptureStatus>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureWorker {
    /// Spawn the capture thread. The camera is not touched until the first
    /// [`open`](Self::open) or [`start_preview`](Self::start_preview).
    pub fn spawn(
        backend: Arc<dyn CameraBackend>,
        encoder: Arc<dyn VideoEncoder>,
        delegate: Arc<dyn MediaSubsessionDelegate>,
        config: CaptureConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let status = Arc::new(RwLock::new(CaptureStatus::default()));

        let state = State {
            backend,
            encoder,
            delegate,
            config,
            tx: tx.clone(),
            status: status.clone(),
            device: None,
            display: None,
            recycler: None,
            preview: None,
            generation: 0,
        };

        let worker = thread::Builder::new()
            .name("camera".into())
            .spawn(move || run(state, rx))?;

        Ok(Self {
            tx,
            status,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Open the camera and negotiate format, size and rotation.
    pub fn open(&self) {
        self.post(Command::Open);
    }

    pub fn start_preview(&self) {
        self.post(Command::StartPreview);
    }

    pub fn stop_preview(&self) {
        self.post(Command::StopPreview);
    }

    /// Set or clear the local preview target. Remembered across restarts.
    pub fn set_preview_display(&self, display: Option<Arc<dyn PreviewDisplay>>) {
        self.post(Command::SetDisplay(display));
    }

    /// Change the quality profile. An open camera is renegotiated.
    pub fn set_video_quality(&self, quality: VideoQuality) {
        self.post(Command::SetQuality(quality));
    }

    pub fn status(&self) -> CaptureStatus {
        self.status.read().clone()
    }

    /// Block until every command posted so far has been handled.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        self.post(Command::Sync(tx));
        rx.recv_timeout(timeout).is_ok()
    }

    fn post(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("capture worker is gone, command dropped");
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.worker.lock().take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            tracing::warn!("capture thread panicked");
        }
    }
}

/// Everything the capture thread owns.
struct State {
    backend: Arc<dyn CameraBackend>,
    encoder: Arc<dyn VideoEncoder>,
    delegate: Arc<dyn MediaSubsessionDelegate>,
    config: CaptureConfig,
    tx: Sender<Command>,
    status: Arc<RwLock<CaptureStatus>>,
    device: Option<Box<dyn CameraDevice>>,
    display: Option<Arc<dyn PreviewDisplay>>,
    /// Present while the device is streaming.
    recycler: Option<FrameRecycler>,
    preview: Option<(Size, Rotation)>,
    /// Bumped on every stream start so frames from an earlier stream are
    /// recognised and dropped.
    generation: u64,
}

fn run(mut state: State, rx: Receiver<Command>) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Open => {
                if let Err(e) = state.open() {
                    tracing::warn!(error = %e, errno = e.errno(), "camera open failed");
                }
            }
            Command::StartPreview => {
                if let Err(e) = state.start_preview() {
                    tracing::warn!(error = %e, errno = e.errno(), "preview start failed");
                    state.stop_preview();
                }
            }
            Command::StopPreview => state.stop_preview(),
            Command::SetDisplay(display) => state.set_display(display),
            Command::SetQuality(quality) => state.set_quality(quality),
            Command::Frame { frame, generation } => state.on_frame(frame, generation),
            Command::Sync(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }

    state.stop_preview();
    tracing::debug!("capture thread exiting");
}

impl State {
    fn open(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let mut device = self.backend.open(self.config.camera_id)?;
        let (size, rotation) = match self.negotiate(device.as_mut()) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                device.release();
                return Err(e);
            }
        };

        self.device = Some(device);
        self.preview = Some((size, rotation));
        {
            let mut status = self.status.write();
            status.opened = true;
            status.preview_size = Some(size);
            status.rotation = Some(rotation);
        }

        tracing::info!(
            camera = self.config.camera_id,
            width = size.width,
            height = size.height,
            rotation = rotation.degrees(),
            "camera opened"
        );
        Ok(())
    }

    fn negotiate(&self, device: &mut dyn CameraDevice) -> Result<(Size, Rotation)> {
        let target = resolve_quality(self.config.quality, |q| device.has_profile(q));
        let supported = device.supported_preview_sizes();
        let size = select_preview_size(&supported, target).ok_or_else(|| {
            StreamError::DeviceUnavailable("camera reports no preview sizes".into())
        })?;
        let info = device.info();
        let rotation = Rotation::try_from(info.orientation)?;

        tracing::debug!(
            quality = ?self.config.quality,
            %target,
            %size,
            facing = ?info.facing,
            "preview size negotiated"
        );

        device.configure(PixelFormat::Nv21, size)?;
        self.encoder.init_resolution(size, rotation)?;
        Ok((size, rotation))
    }

    fn start_preview(&mut self) -> Result<()> {
        self.open()?;
        let (size, _) = self
            .preview
            .ok_or_else(|| StreamError::DeviceUnavailable("camera not negotiated".into()))?;
        let Some(device) = self.device.as_mut() else {
            return Err(StreamError::DeviceUnavailable("camera not open".into()));
        };

        device.set_preview_display(self.display.clone());
        if self.recycler.is_some() {
            tracing::debug!("preview already running, display target re-applied");
            return Ok(());
        }

        let pool = FrameBufferPool::new(PixelFormat::Nv21, size, self.config.pool_size.max(1));
        let recycler = pool.recycler();
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        device.start_streaming(
            pool,
            FrameSink::new(move |frame| {
                let _ = tx.send(Command::Frame { frame, generation });
            }),
        )?;

        self.recycler = Some(recycler);
        self.status.write().streaming = true;

        if self.delegate.is_stream_running()
            && let Err(e) = self.encoder.start()
        {
            tracing::warn!(error = %e, "encoder start failed");
        }

        tracing::info!(%size, generation, "preview started");
        Ok(())
    }

    fn stop_preview(&mut self) {
        let Some(mut device) = self.device.take() else {
            tracing::trace!("stop_preview: camera not open");
            return;
        };

        self.encoder.stop();
        device.stop_streaming();
        self.recycler = None;
        device.release();

        {
            let mut status = self.status.write();
            status.opened = false;
            status.streaming = false;
        }
        tracing::info!("preview stopped, camera released");
    }

    fn set_display(&mut self, display: Option<Arc<dyn PreviewDisplay>>) {
        let display_name = display.as_ref().map(|d| d.name().to_string());
        tracing::debug!(
            display = display_name,
            "preview display changed"
        );
        self.display = display;
        if let Some(device) = self.device.as_mut() {
            device.set_preview_display(self.display.clone());
        }
    }

    fn set_quality(&mut self, quality: VideoQuality) {
        if self.config.quality == quality {
            return;
        }
        self.config.quality = quality;

        let was_open = self.device.is_some();
        let was_streaming = self.recycler.is_some();
        if !was_open {
            return;
        }

        self.stop_preview();
        let restarted = if was_streaming {
            self.start_preview()
        } else {
            self.open()
        };
        if let Err(e) = restarted {
            tracing::warn!(error = %e, ?quality, "camera renegotiation failed");
            self.stop_preview();
        }
    }

    fn on_frame(&self, frame: RawFrame, generation: u64) {
        let Some(recycler) = self
            .recycler
            .as_ref()
            .filter(|_| generation == self.generation)
        else {
            tracing::trace!(generation, "dropping frame from a stopped stream");
            return;
        };

        let result = self.encoder.queue_input_frame(frame, recycler);
        let mut status = self.status.write();
        status.frames_delivered += 1;
        match result {
            QueueResult::Accepted => status.frames_accepted += 1,
            QueueResult::Declined(frame) => {
                status.frames_declined += 1;
                recycler.recycle(frame);
            }
            QueueResult::Failed(frame, e) => {
                status.frames_failed += 1;
                tracing::warn!(error = %e, "encoder rejected frame");
                recycler.recycle(frame);
            }
        }
    }
}
