//! State shared by every connection of one running server.

use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::server::{ServerConfig, ServerHandle};
use crate::subsession::{MediaSubsessionDelegate, Track, VIDEO_TRACK_CONTROL};

/// Everything a connection handler needs while the server is serving.
///
/// Created once per successful bring-up and shut down when the service
/// stops. Tracks which sessions are playing so the video delegate sees
/// `on_stream_create` for the first viewer and `on_stream_close` after the
/// last one, never twice in a row.
pub struct ServiceContext {
    config: Arc<ServerConfig>,
    server: ServerHandle,
    track: Arc<Track>,
    delegate: Arc<dyn MediaSubsessionDelegate>,
    live: Mutex<HashSet<String>>,
    connections: Mutex<HashMap<u64, TcpStream>>,
    next_connection: AtomicU64,
    closed: AtomicBool,
}

impl ServiceContext {
    pub fn new(
        config: Arc<ServerConfig>,
        server: ServerHandle,
        track: Arc<Track>,
        delegate: Arc<dyn MediaSubsessionDelegate>,
    ) -> Self {
        Self {
            config,
            server,
            track,
            delegate,
            live: Mutex::new(HashSet::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Whether `uri` addresses the served stream (or its track).
    pub fn matches_stream(&self, uri: &str) -> bool {
        let name = &self.config.stream_name;
        name.is_empty() || extract_stream_path(uri).trim_matches('/') == name
    }

    /// A session started playing.
    pub fn session_started(&self, session_id: &str) {
        let mut live = self.live.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let first = live.is_empty();
        if !live.insert(session_id.to_string()) {
            return;
        }
        if first {
            tracing::info!(session_id, "first viewer, opening video stream");
            self.delegate.on_stream_create();
        } else {
            tracing::debug!(session_id, viewers = live.len(), "viewer joined live stream");
            self.delegate.on_viewer_joined();
        }
    }

    /// A session was torn down or its connection dropped.
    pub fn session_ended(&self, session_id: &str) {
        let mut live = self.live.lock();
        if live.remove(session_id) && live.is_empty() {
            tracing::info!(session_id, "last viewer left, closing video stream");
            self.delegate.on_stream_close();
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.live.lock().len()
    }

    /// Track a client connection so `shutdown` can close it. Returns `None`
    /// once the service is shutting down.
    pub fn register_connection(&self, stream: &TcpStream) -> Option<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let clone = stream.try_clone().ok()?;
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().insert(id, clone);
        Some(id)
    }

    pub fn unregister_connection(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every connection, drop every session and close the video stream
    /// if it is live. Idempotent.
    pub fn shutdown(&self) {
        // `closed` flips under the live lock so a racing PLAY either lands
        // before shutdown and gets closed here, or sees `closed` and backs off.
        let mut live = self.live.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connections: Vec<_> = self.connections.lock().drain().collect();
        for (_, stream) in &connections {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let sessions = self.server.sessions().clear();

        if !live.is_empty() {
            live.clear();
            self.delegate.on_stream_close();
        }
        tracing::debug!(
            connections = connections.len(),
            sessions,
            "service context shut down"
        );
    }
}

/// Extract the stream path from an RTSP URI, without the track suffix.
///
/// `rtsp://host:8554/live/track1` → `/live`
/// `rtsp://host:8554/live`        → `/live`
/// `rtsp://host:8554`             → `/`
/// `*`                            → `/`
pub fn extract_stream_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        "/"
    };

    let path = path.split('?').next().unwrap_or(path);
    let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);
    match path.rsplit_once('/') {
        Some((head, last)) if last == VIDEO_TRACK_CONTROL => {
            if head.is_empty() { "/" } else { head }
        }
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::media::h264::H264Packetizer;
    use crate::subsession::SubsessionHandle;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Gate {
        opens: AtomicUsize,
        closes: AtomicUsize,
        joins: AtomicUsize,
    }

    impl MediaSubsessionDelegate for Gate {
        fn create_media_subsession(&self, _server: &ServerHandle) -> Result<SubsessionHandle> {
            unreachable!()
        }

        fn on_stream_create(&self) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stream_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_viewer_joined(&self) {
            self.joins.fetch_add(1, Ordering::SeqCst);
        }

        fn is_stream_running(&self) -> bool {
            false
        }
    }

    fn context(stream_name: &str, gate: Arc<Gate>) -> ServiceContext {
        let server = ServerHandle::detached().unwrap();
        let track = Arc::new(Track::new(
            Box::new(H264Packetizer::new(96, 0x1234)),
            server.clone(),
        ));
        let config = ServerConfig {
            stream_name: stream_name.to_string(),
            ..ServerConfig::default()
        };
        ServiceContext::new(Arc::new(config), server, track, gate)
    }

    #[test]
    fn extract_path_full_uri() {
        assert_eq!(extract_stream_path("rtsp://localhost:8554/live"), "/live");
    }

    #[test]
    fn extract_path_with_track() {
        assert_eq!(
            extract_stream_path("rtsp://localhost:8554/live/track1"),
            "/live"
        );
        assert_eq!(extract_stream_path("rtsp://localhost:8554/track1"), "/");
    }

    #[test]
    fn extract_path_no_path() {
        assert_eq!(extract_stream_path("rtsp://localhost:8554"), "/");
        assert_eq!(extract_stream_path("rtsp://localhost:8554/"), "/");
        assert_eq!(extract_stream_path("*"), "/");
    }

    #[test]
    fn extract_path_bare_and_trailing_slash() {
        assert_eq!(extract_stream_path("/camera1"), "/camera1");
        assert_eq!(extract_stream_path("rtsp://10.0.0.1:8554/camera1/"), "/camera1");
    }

    #[test]
    fn empty_stream_name_matches_any_path() {
        let ctx = context("", Arc::new(Gate::default()));
        assert!(ctx.matches_stream("rtsp://host:8554/"));
        assert!(ctx.matches_stream("rtsp://host:8554/anything/track1"));
    }

    #[test]
    fn named_stream_matches_only_its_path() {
        let ctx = context("live", Arc::new(Gate::default()));
        assert!(ctx.matches_stream("rtsp://host:8554/live"));
        assert!(ctx.matches_stream("rtsp://host:8554/live/track1"));
        assert!(!ctx.matches_stream("rtsp://host:8554/other"));
        assert!(!ctx.matches_stream("rtsp://host:8554/"));
    }

    #[test]
    fn delegate_sees_first_and_last_viewer_only() {
        let gate = Arc::new(Gate::default());
        let ctx = context("", gate.clone());

        ctx.session_started("a");
        ctx.session_started("b");
        ctx.session_started("a");
        assert_eq!(gate.opens.load(Ordering::SeqCst), 1);
        assert_eq!(gate.joins.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.live_sessions(), 2);

        ctx.session_ended("a");
        assert_eq!(gate.closes.load(Ordering::SeqCst), 0);
        ctx.session_ended("b");
        ctx.session_ended("b");
        assert_eq!(gate.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_closes_live_stream_once() {
        let gate = Arc::new(Gate::default());
        let ctx = context("", gate.clone());
        ctx.server().sessions().create_session("rtsp://host/");
        ctx.session_started("a");

        ctx.shutdown();
        ctx.shutdown();
        assert_eq!(gate.closes.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.server().sessions().len(), 0);

        ctx.session_started("b");
        ctx.session_ended("a");
        assert_eq!(gate.opens.load(Ordering::SeqCst), 1);
        assert_eq!(gate.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn play_racing_shutdown_never_leaves_stream_open() {
        for round in 0..50 {
            let gate = Arc::new(Gate::default());
            let ctx = Arc::new(context("", gate.clone()));

            let player = {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        ctx.session_started(&format!("s{i}"));
                    }
                })
            };
            ctx.shutdown();
            player.join().unwrap();

            assert_eq!(
                gate.opens.load(Ordering::SeqCst),
                gate.closes.load(Ordering::SeqCst),
                "round {round}"
            );
            assert_eq!(ctx.live_sessions(), 0);
        }
    }
}
