//! Integration tests: drive the real server over TCP and UDP on fixed
//! localhost ports.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rtsplive::subsession::H264Subsession;
use rtsplive::{
    EncodedFrame, FrameSource, LifecycleEvent, OutputListener, RtspServer, ServerResult,
    StreamConfig, StreamError, StreamOrchestrator, TestPatternCamera,
};

const TIMEOUT: Duration = Duration::from_secs(3);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn session_id(&self) -> String {
        let value = self.header("Session").unwrap();
        value.split(';').next().unwrap().to_string()
    }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    cseq: u32,
}

impl Client {
    fn connect(port: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let stream = TcpStream::connect_timeout(&addr, TIMEOUT).expect("connect to server");
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            cseq: 0,
        }
    }

    fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let mut text = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        text.push_str("\r\n");
        self.writer.write_all(text.as_bytes()).unwrap();

        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();
        let status = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut response = Response {
            status,
            headers,
            body: String::new(),
        };
        if let Some(len) = response
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body).unwrap();
            response.body = String::from_utf8_lossy(&body).into_owned();
        }

        let cseq = self.cseq.to_string();
        assert_eq!(response.header("CSeq"), Some(cseq.as_str()));
        response
    }

    fn connect_refused(port: u16) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err()
    }

    /// Whether the server closed the connection.
    fn closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.reader.read(&mut buf), Ok(0) | Err(_))
    }
}

fn rtp_receiver() -> (UdpSocket, String) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1))
}

/// A frame source the test pushes frames through by hand.
#[derive(Default)]
struct ManualSource {
    starts: AtomicUsize,
    stops: AtomicUsize,
    listener: RwLock<Option<Arc<dyn OutputListener>>>,
}

impl ManualSource {
    fn push(&self, data: &[u8], presentation_time_us: u64) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_frame_output(&EncodedFrame {
                data,
                presentation_time_us,
            });
        }
    }
}

impl FrameSource for ManualSource {
    fn start(&self) -> rtsplive::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn set_output_listener(&self, listener: Option<Arc<dyn OutputListener>>) {
        *self.listener.write() = listener;
    }
}

/// Build a server on `port` that reports its results on the returned channel.
fn server_on(
    port: u16,
    source: Arc<ManualSource>,
    configure: impl FnOnce(rtsplive::RtspServerBuilder) -> rtsplive::RtspServerBuilder,
) -> (RtspServer, mpsc::Receiver<ServerResult>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let builder = RtspServer::builder()
        .bind_host("127.0.0.1")
        .port(port)
        .video_delegate(Arc::new(H264Subsession::new(source)))
        .listener(move |result: &ServerResult| {
            let _ = tx.lock().send(result.clone());
        });
    (configure(builder).build().unwrap(), rx)
}

#[test]
fn full_handshake_delivers_rtp() {
    init_tracing();
    let source = Arc::new(ManualSource::default());
    let (server, results) = server_on(18_554, source.clone(), |b| b.stream_name("live"));

    server.start_service();
    let result = results.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result.errno, 0, "{}", result.message);
    assert_eq!(result.url, "rtsp://127.0.0.1:18554/live");
    assert_eq!(server.rtsp_url(), result.url);
    assert!(server.is_running());

    let mut client = Client::connect(18_554);
    let uri = "rtsp://127.0.0.1:18554/live";

    let resp = client.request("OPTIONS", uri, &[]);
    assert_eq!(resp.status, 200);
    assert!(resp.header("Public").unwrap().contains("DESCRIBE"));

    let resp = client.request("DESCRIBE", uri, &[("Accept", "application/sdp")]);
    assert_eq!(resp.status, 200);
    assert!(resp.body.contains("m=video 0 RTP/AVP 96\r\n"));
    assert!(resp.body.contains("a=control:track1\r\n"));

    let (rtp, transport) = rtp_receiver();
    let resp = client.request("SETUP", &format!("{uri}/track1"), &[("Transport", transport.as_str())]);
    assert_eq!(resp.status, 200);
    assert!(resp.header("Transport").unwrap().contains("server_port="));
    let session = resp.session_id();

    assert_eq!(source.starts.load(Ordering::SeqCst), 0);
    let resp = client.request("PLAY", uri, &[("Session", session.as_str())]);
    assert_eq!(resp.status, 200);
    assert!(resp.header("RTP-Info").is_some());
    assert_eq!(source.starts.load(Ordering::SeqCst), 1);

    source.push(&[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33], 0);
    let mut buf = [0u8; 1500];
    let (n, _) = rtp.recv_from(&mut buf).unwrap();
    assert!(n > 12);
    assert_eq!(buf[0] >> 6, 2, "RTP version");
    assert_eq!(buf[1] & 0x7f, 96, "payload type");
    assert_ne!(buf[1] & 0x80, 0, "marker on the last packet of the frame");

    let resp = client.request("TEARDOWN", uri, &[("Session", session.as_str())]);
    assert_eq!(resp.status, 200);
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);

    server.stop_service();
    assert!(client.closed());
    assert!(!server.is_running());
}

#[test]
fn disconnect_closes_the_stream() {
    init_tracing();
    let source = Arc::new(ManualSource::default());
    let (server, results) = server_on(18_555, source.clone(), |b| b);
    server.start_service();
    assert_eq!(results.recv_timeout(TIMEOUT).unwrap().errno, 0);

    let uri = "rtsp://127.0.0.1:18555/";
    let (_rtp, transport) = rtp_receiver();
    let mut client = Client::connect(18_555);
    let session = client
        .request("SETUP", &format!("{uri}track1"), &[("Transport", transport.as_str())])
        .session_id();
    client.request("PLAY", uri, &[("Session", session.as_str())]);
    assert_eq!(source.starts.load(Ordering::SeqCst), 1);

    drop(client);
    let deadline = Instant::now() + TIMEOUT;
    while source.stops.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    server.stop_service();
}

#[test]
fn bind_conflict_is_reported() {
    init_tracing();
    let _occupied = TcpListener::bind("127.0.0.1:18556").unwrap();
    let (server, results) = server_on(18_556, Arc::default(), |b| b);

    server.start_service();
    let result = results.recv_timeout(TIMEOUT).unwrap();
    assert_ne!(result.errno, 0);
    assert!(!result.message.is_empty());
    assert_eq!(result.url, "");
    assert!(results.recv_timeout(Duration::from_millis(200)).is_err());

    assert_eq!(server.errno(), result.errno);
    assert_eq!(server.result_msg(), result.message);
    assert_eq!(server.rtsp_url(), "");

    server.stop_service();
    server.stop_service();
}

#[test]
fn stop_before_start_and_restart() {
    init_tracing();
    let (server, results) = server_on(18_557, Arc::default(), |b| b);
    server.stop_service();
    assert_eq!(server.errno(), 0);

    server.start_service();
    assert_eq!(results.recv_timeout(TIMEOUT).unwrap().errno, 0);

    server.start_service();
    let second = results.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(second.errno, StreamError::AlreadyRunning.errno());
    assert!(server.is_running());
    assert_eq!(server.errno(), 0);

    server.stop_service();
    assert!(Client::connect_refused(18_557));

    server.start_service();
    let again = results.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(again.errno, 0, "{}", again.message);
    server.stop_service();
}

#[test]
fn credentials_are_enforced() {
    init_tracing();
    let (server, results) = server_on(18_558, Arc::default(), |b| {
        b.user_name("admin").password("123456")
    });
    server.start_service();
    assert_eq!(results.recv_timeout(TIMEOUT).unwrap().errno, 0);

    let mut client = Client::connect(18_558);
    let uri = "rtsp://127.0.0.1:18558/";
    assert_eq!(client.request("OPTIONS", uri, &[]).status, 200);

    let resp = client.request("DESCRIBE", uri, &[]);
    assert_eq!(resp.status, 401);
    assert!(resp.header("WWW-Authenticate").unwrap().starts_with("Basic"));

    let resp = client.request("DESCRIBE", uri, &[("Authorization", "Basic YWRtaW46MTIzNDU2")]);
    assert_eq!(resp.status, 200);
    server.stop_service();
}

#[test]
fn synthetic_camera_streams_h264_end_to_end() {
    init_tracing();
    let camera = TestPatternCamera::default();
    let stream = StreamOrchestrator::new(
        Arc::new(camera.clone()),
        StreamConfig {
            bind_host: "127.0.0.1".into(),
            port: 18_559,
            ..StreamConfig::default()
        },
    )
    .unwrap();

    stream.start_rtsp_server();
    stream.handle_lifecycle(LifecycleEvent::Foreground);
    let url = stream.stream_url().wait_timeout(TIMEOUT).unwrap();
    assert_eq!(url, "rtsp://127.0.0.1:18559/");
    assert!(stream.wait_idle(TIMEOUT));
    assert!(stream.capture_status().streaming);

    let mut client = Client::connect(18_559);
    let (rtp, transport) = rtp_receiver();
    let session = client
        .request("SETUP", &format!("{url}track1"), &[("Transport", transport.as_str())])
        .session_id();
    assert_eq!(client.request("PLAY", &url, &[("Session", session.as_str())]).status, 200);
    assert!(stream.is_streaming());

    let mut buf = [0u8; 1500];
    let mut nal_types = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while nal_types.len() < 10 && Instant::now() < deadline {
        if let Ok((n, _)) = rtp.recv_from(&mut buf) {
            assert_eq!(buf[1] & 0x7f, 96);
            assert!(n > 12);
            nal_types.push(buf[12] & 0x1f);
        }
    }
    assert!(nal_types.len() >= 10, "only {} RTP packets arrived", nal_types.len());
    // SPS arrives first because the encoder forces a keyframe on start.
    assert_eq!(nal_types[0], 7);

    let resp = client.request("DESCRIBE", &url, &[]);
    assert!(resp.body.contains("sprop-parameter-sets="));

    client.request("TEARDOWN", &url, &[("Session", session.as_str())]);
    assert!(!stream.is_streaming());

    stream.handle_lifecycle(LifecycleEvent::Destroyed);
    assert!(stream.wait_idle(TIMEOUT));
    assert!(!camera.is_in_use());
    assert_eq!(stream.rtsp_url(), "");
}
