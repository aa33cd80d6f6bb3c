//! Top-level wiring: camera → encoder → subsession → RTSP server.
//!
//! [`StreamOrchestrator`] owns one [`CaptureWorker`] and one [`RtspServer`]
//! and starts or stops them independently. The stream URL reported by the
//! server is published through [`StreamUrl`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, ReentrantMutex};

use crate::capture::device::{CameraBackend, PreviewDisplay};
use crate::capture::{CaptureConfig, CaptureStatus, CaptureWorker};
use crate::encoder::{EncoderKind, EncoderSettings, VideoEncoder, create_video_encoder};
use crate::error::{Result, StreamError};
use crate::resolution::VideoQuality;
use crate::server::{DEFAULT_PORT, RtspServer, ServerResult};
use crate::subsession::{MediaSubsessionDelegate, create_video_delegate};

/// Everything needed to assemble a pipeline.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderSettings,
    pub encoder_kind: EncoderKind,
    pub stream_name: String,
    pub bind_host: String,
    pub port: u16,
    pub public_host: Option<String>,
    pub user_name: Option<String>,
    pub password: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            encoder: EncoderSettings::default(),
            encoder_kind: EncoderKind::default(),
            stream_name: String::new(),
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            public_host: None,
            user_name: None,
            password: None,
        }
    }
}

/// Host application lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The application became visible: start the camera.
    Foreground,
    /// The application was hidden: release the camera.
    Background,
    /// The application is going away: stop everything.
    Destroyed,
}

type UrlObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct UrlState {
    url: String,
    observers: Vec<UrlObserver>,
}

#[derive(Default)]
struct UrlInner {
    state: Mutex<UrlState>,
    changed: Condvar,
    // Serializes observer calls without holding `state`, so observers may
    // read or update the URL themselves.
    delivery: ReentrantMutex<()>,
}

/// The current stream URL, empty until the server reports one.
#[derive(Clone, Default)]
pub struct StreamUrl {
    inner: Arc<UrlInner>,
}

impl StreamUrl {
    pub fn get(&self) -> String {
        self.inner.state.lock().url.clone()
    }

    /// Call `observer` with the current value and after every change.
    pub fn observe(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        let _delivery = self.inner.delivery.lock();
        let observer: UrlObserver = Arc::new(observer);
        let current = {
            let mut state = self.inner.state.lock();
            state.observers.push(observer.clone());
            state.url.clone()
        };
        observer(&current);
    }

    /// Wait until the URL is non-empty. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.url.is_empty() {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Some(state.url.clone()).filter(|url| !url.is_empty())
    }

    fn set(&self, url: String) {
        let _delivery = self.inner.delivery.lock();
        let observers = {
            let mut state = self.inner.state.lock();
            if state.url == url {
                return;
            }
            state.url.clone_from(&url);
            self.inner.changed.notify_all();
            state.observers.clone()
        };
        for observer in &observers {
            observer(&url);
        }
    }
}

/// Composes capture, encoding and serving for one camera.
pub struct StreamOrchestrator {
    capture: CaptureWorker,
    server: RtspServer,
    delegate: Arc<dyn MediaSubsessionDelegate>,
    url: StreamUrl,
}

impl StreamOrchestrator {
    /// Build the pipeline with the encoder and subsession selected by
    /// `config.encoder_kind`.
    pub fn new(backend: Arc<dyn CameraBackend>, config: StreamConfig) -> Result<Self> {
        let encoder = create_video_encoder(config.encoder_kind, config.encoder.clone());
        let delegate = create_video_delegate(config.encoder_kind, encoder.clone());
        Self::from_parts(backend, encoder, delegate, config)
    }

    /// Build the pipeline around an existing encoder and video delegate.
    pub fn from_parts(
        backend: Arc<dyn CameraBackend>,
        encoder: Arc<dyn VideoEncoder>,
        delegate: Arc<dyn MediaSubsessionDelegate>,
        config: StreamConfig,
    ) -> Result<Self> {
        let url = StreamUrl::default();
        let published = url.clone();

        let mut builder = RtspServer::builder()
            .stream_name(config.stream_name)
            .bind_host(config.bind_host)
            .port(config.port)
            .video_delegate(delegate.clone())
            .listener(move |result: &ServerResult| {
                if result.is_success() {
                    published.set(result.url.clone());
                } else if result.errno == StreamError::AlreadyRunning.errno() {
                    tracing::debug!("RTSP server already running, URL unchanged");
                } else {
                    tracing::warn!(errno = result.errno, message = %result.message, "RTSP server did not start");
                    published.set(String::new());
                }
            });
        if let Some(host) = config.public_host {
            builder = builder.public_host(host);
        }
        if let Some(user_name) = config.user_name {
            builder = builder.user_name(user_name);
        }
        if let Some(password) = config.password {
            builder = builder.password(password);
        }
        let server = builder.build()?;

        tracing::info!(mime = encoder.mime(), quality = ?config.capture.quality, "stream pipeline assembled");
        let capture = CaptureWorker::spawn(backend, encoder, delegate.clone(), config.capture)?;

        Ok(Self {
            capture,
            server,
            delegate,
            url,
        })
    }

    pub fn start_rtsp_server(&self) {
        self.server.start_service();
    }

    pub fn stop_rtsp_server(&self) {
        self.server.stop_service();
        self.url.set(String::new());
    }

    pub fn start_preview(&self) {
        self.capture.start_preview();
    }

    pub fn stop_preview(&self) {
        self.capture.stop_preview();
    }

    /// A preview target became available.
    pub fn surface_created(&self, display: Arc<dyn PreviewDisplay>) {
        self.capture.set_preview_display(Some(display));
    }

    pub fn surface_destroyed(&self) {
        self.capture.set_preview_display(None);
    }

    pub fn set_video_quality(&self, quality: VideoQuality) {
        self.capture.set_video_quality(quality);
    }

    /// Current stream URL, empty until the server has started.
    pub fn rtsp_url(&self) -> String {
        self.url.get()
    }

    pub fn stream_url(&self) -> &StreamUrl {
        &self.url
    }

    pub fn server(&self) -> &RtspServer {
        &self.server
    }

    pub fn capture_status(&self) -> CaptureStatus {
        self.capture.status()
    }

    /// Whether at least one viewer is playing the stream.
    pub fn is_streaming(&self) -> bool {
        self.delegate.is_stream_running()
    }

    /// Block until the capture worker has handled every call made so far.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.capture.wait_idle(timeout)
    }

    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle event");
        match event {
            LifecycleEvent::Foreground => self.start_preview(),
            LifecycleEvent::Background => self.stop_preview(),
            LifecycleEvent::Destroyed => {
                self.stop_rtsp_server();
                self.stop_preview();
            }
        }
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        self.server.stop_service();
        self.capture.stop_preview();
    }
}
