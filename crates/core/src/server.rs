use std::fmt;
use std::net::{IpAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StreamError};
use crate::executor::{Executor, SerialExecutor};
use crate::service::ServiceContext;
use crate::session::SessionManager;
use crate::subsession::MediaSubsessionDelegate;
use crate::transport::UdpTransport;
use crate::transport::tcp;

/// Default RTSP port.
pub const DEFAULT_PORT: u16 = 8554;

/// How long `stop_service` waits for the serve loop to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// User name and password required from clients.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// The `user:password` token expected after `Basic ` in the
    /// `Authorization` header (RFC 7617).
    pub fn basic_token(&self) -> String {
        BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password))
    }

    /// Whether an `Authorization` header value carries these credentials.
    pub fn authorizes(&self, header: Option<&str>) -> bool {
        let Some((scheme, token)) = header.and_then(|h| h.trim().split_once(' ')) else {
            return false;
        };
        scheme.eq_ignore_ascii_case("Basic") && token.trim() == self.basic_token()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path component of the stream URL. Empty serves the stream on any path.
    pub stream_name: String,
    /// Address the RTSP listener binds to.
    pub bind_host: String,
    pub port: u16,
    /// When set, every method except OPTIONS requires Basic authentication.
    pub credentials: Option<Credentials>,
    /// Public host advertised in the stream URL and the SDP `o=`/`c=` lines.
    /// When `None`, the URL uses the local address and SDP the request URI host.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            credentials: None,
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
        }
    }
}

/// Outcome of one `start_service` call.
///
/// `errno` is 0 on success, in which case `url` is the stream URL. On
/// failure `url` is empty and `message` describes the error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerResult {
    pub errno: i32,
    pub message: String,
    pub url: String,
}

impl ServerResult {
    pub fn success(url: String) -> Self {
        Self {
            errno: 0,
            message: "OK".to_string(),
            url,
        }
    }

    pub fn failure(error: &StreamError) -> Self {
        Self {
            errno: error.errno(),
            message: error.to_string(),
            url: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errno == 0
    }
}

/// Receives the outcome of each `start_service` call.
pub trait ServerListener: Send + Sync {
    fn on_result(&self, result: &ServerResult);
}

impl<F> ServerListener for F
where
    F: Fn(&ServerResult) + Send + Sync,
{
    fn on_result(&self, result: &ServerResult) {
        self(result)
    }
}

/// What a running server exposes to its media subsessions.
#[derive(Clone)]
pub struct ServerHandle {
    sessions: SessionManager,
    udp: Arc<UdpTransport>,
}

impl ServerHandle {
    pub(crate) fn new(sessions: SessionManager, udp: Arc<UdpTransport>) -> Self {
        Self { sessions, udp }
    }

    /// A handle with its own empty session table, not attached to any server.
    pub fn detached() -> Result<Self> {
        Ok(Self::new(SessionManager::new(), Arc::new(UdpTransport::bind()?)))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Send one RTP packet to every playing session. Returns how many
    /// sessions it reached.
    pub fn broadcast(&self, packet: &[u8]) -> usize {
        self.udp.broadcast(&self.sessions, packet)
    }

    pub fn playing_sessions(&self) -> usize {
        self.sessions.get_playing_sessions().len()
    }
}

/// Accumulates server settings. Nothing is validated until [`build`](Self::build).
#[derive(Default)]
pub struct RtspServerBuilder {
    config: ServerConfig,
    user_name: Option<String>,
    password: Option<String>,
    executor: Option<Arc<dyn Executor>>,
    listener: Option<Arc<dyn ServerListener>>,
    video_delegate: Option<Arc<dyn MediaSubsessionDelegate>>,
}

impl RtspServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appended to the stream URL as `/<name>`.
    pub fn stream_name(mut self, name: impl Into<String>) -> Self {
        self.config.stream_name = name.into().trim_matches('/').to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.config.bind_host = host.into();
        self
    }

    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.config.public_host = Some(host.into());
        self
    }

    pub fn user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Where bring-up and the serve loop run. Defaults to a dedicated
    /// serial executor.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn listener(mut self, listener: impl ServerListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn video_delegate(mut self, delegate: Arc<dyn MediaSubsessionDelegate>) -> Self {
        self.video_delegate = Some(delegate);
        self
    }

    pub fn build(self) -> Result<RtspServer> {
        let delegate = self
            .video_delegate
            .ok_or(StreamError::MissingVideoDelegate)?;

        let mut config = self.config;
        config.credentials = self
            .user_name
            .filter(|name| !name.is_empty())
            .map(|username| Credentials {
                username,
                password: self.password.unwrap_or_default(),
            });

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SerialExecutor::new("rtsp-server")));

        tracing::debug!(
            stream_name = %config.stream_name,
            port = config.port,
            auth = config.credentials.is_some(),
            "RTSP server built"
        );

        Ok(RtspServer {
            config: Arc::new(config),
            delegate,
            executor,
            listener: self.listener,
            result: Arc::new(RwLock::new(ServerResult::default())),
            service: Mutex::new(None),
        })
    }
}

/// Bookkeeping for one `start_service` call.
struct Service {
    running: Arc<AtomicBool>,
    context: Arc<Mutex<Option<Arc<ServiceContext>>>>,
    done: Receiver<()>,
}

impl Service {
    /// Bring-up failed or the serve loop returned.
    fn finished(&self) -> bool {
        !matches!(self.done.try_recv(), Err(TryRecvError::Empty))
    }
}

/// RTSP server serving one video stream.
///
/// `start_service` returns immediately; bring-up and the serve loop run on
/// the configured executor and the outcome is reported to the listener.
pub struct RtspServer {
    config: Arc<ServerConfig>,
    delegate: Arc<dyn MediaSubsessionDelegate>,
    executor: Arc<dyn Executor>,
    listener: Option<Arc<dyn ServerListener>>,
    result: Arc<RwLock<ServerResult>>,
    service: Mutex<Option<Service>>,
}

impl RtspServer {
    pub fn builder() -> RtspServerBuilder {
        RtspServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and start serving in the background.
    ///
    /// Produces exactly one [`ServerResult`] per call. Calling this while a
    /// previous start is still active reports
    /// [`AlreadyRunning`](StreamError::AlreadyRunning) to the listener and
    /// leaves the running service and its stored result untouched.
    pub fn start_service(&self) {
        let mut service = self.service.lock();
        if service.as_ref().is_some_and(|s| !s.finished()) {
            let error = StreamError::AlreadyRunning;
            tracing::warn!(error = %error, "start_service ignored");
            if let Some(listener) = self.listener.clone() {
                let result = ServerResult::failure(&error);
                thread::spawn(move || listener.on_result(&result));
            }
            return;
        }

        *self.result.write() = ServerResult::default();

        let running = Arc::new(AtomicBool::new(true));
        let context = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = mpsc::channel();

        let bring_up = BringUp {
            config: self.config.clone(),
            delegate: self.delegate.clone(),
            listener: self.listener.clone(),
            result: self.result.clone(),
            running: running.clone(),
            context: context.clone(),
            _done: done_tx,
        };

        *service = Some(Service {
            running,
            context,
            done: done_rx,
        });
        drop(service);

        tracing::debug!(port = self.config.port, "RTSP server start requested");
        self.executor.execute(Box::new(move || bring_up.run()));
    }

    /// Stop serving: close the listener, drop every session and connection.
    ///
    /// Safe to call at any time, including before `start_service` or after a
    /// failed start.
    pub fn stop_service(&self) {
        let Some(service) = self.service.lock().take() else {
            tracing::debug!("stop_service: server not started");
            return;
        };

        service.running.store(false, Ordering::SeqCst);
        if let Some(context) = service.context.lock().take() {
            context.shutdown();
        }

        if let Err(mpsc::RecvTimeoutError::Timeout) = service.done.recv_timeout(STOP_TIMEOUT) {
            tracing::warn!("serve loop did not exit in time");
        }
        tracing::info!(port = self.config.port, "RTSP server stopped");
    }

    /// Whether a start is in progress or the server is serving.
    pub fn is_running(&self) -> bool {
        self.service.lock().as_ref().is_some_and(|s| !s.finished())
    }

    /// Stream URL from the last successful start, empty otherwise.
    pub fn rtsp_url(&self) -> String {
        self.result.read().url.clone()
    }

    /// Error code of the last start, 0 on success or before any start.
    pub fn errno(&self) -> i32 {
        self.result.read().errno
    }

    pub fn result_msg(&self) -> String {
        self.result.read().message.clone()
    }

    pub fn result(&self) -> ServerResult {
        self.result.read().clone()
    }
}

impl Drop for RtspServer {
    fn drop(&mut self) {
        self.stop_service();
    }
}

/// The task posted to the executor by `start_service`.
struct BringUp {
    config: Arc<ServerConfig>,
    delegate: Arc<dyn MediaSubsessionDelegate>,
    listener: Option<Arc<dyn ServerListener>>,
    result: Arc<RwLock<ServerResult>>,
    running: Arc<AtomicBool>,
    context: Arc<Mutex<Option<Arc<ServiceContext>>>>,
    /// Dropped when this task finishes, which wakes `stop_service`.
    _done: Sender<()>,
}

impl BringUp {
    fn run(self) {
        if !self.running.load(Ordering::SeqCst) {
            self.publish(ServerResult::failure(&StreamError::Cancelled));
            return;
        }

        let (listener, context, url) = match self.bind() {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!(error = %e, errno = e.errno(), "RTSP server failed to start");
                self.publish(ServerResult::failure(&e));
                return;
            }
        };

        *self.context.lock() = Some(context.clone());
        if !self.running.load(Ordering::SeqCst) {
            context.shutdown();
            self.publish(ServerResult::failure(&StreamError::Cancelled));
            return;
        }

        tracing::info!(%url, "RTSP server listening");
        self.publish(ServerResult::success(url));

        tcp::accept_loop(listener, context.clone(), self.running.clone());
        context.shutdown();
    }

    fn bind(&self) -> Result<(TcpListener, Arc<ServiceContext>, String)> {
        let addr = format!("{}:{}", self.config.bind_host, self.config.port);
        let listener = TcpListener::bind(&addr).map_err(|source| StreamError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let udp = Arc::new(UdpTransport::bind()?);
        let handle = ServerHandle::new(SessionManager::new(), udp);
        let subsession = self.delegate.create_media_subsession(&handle)?;

        let host = self
            .config
            .public_host
            .clone()
            .unwrap_or_else(|| advertised_host(&self.config.bind_host));
        let url = format!("rtsp://{host}:{port}/{}", self.config.stream_name);

        let context = Arc::new(ServiceContext::new(
            self.config.clone(),
            handle,
            subsession.track,
            self.delegate.clone(),
        ));
        Ok((listener, context, url))
    }

    fn publish(&self, result: ServerResult) {
        *self.result.write() = result.clone();
        if let Some(listener) = &self.listener {
            listener.on_result(&result);
        }
    }
}

/// Host for the stream URL: the bind address when it is specific, otherwise
/// the address of the interface that routes outwards.
fn advertised_host(bind_host: &str) -> String {
    if let Ok(ip) = bind_host.parse::<IpAddr>()
        && !ip.is_unspecified()
    {
        return ip.to_string();
    }

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.ip().to_string())
}
