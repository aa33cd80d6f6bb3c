use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::service::ServiceContext;
use crate::session::transport::TransportHeader;
use crate::session::{PlaybackState, Session, Transport};

/// Realm advertised in `WWW-Authenticate` challenges.
pub const AUTH_REALM: &str = "rtsp-live";


/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    context: Arc<ServiceContext>,
    client_addr: SocketAddr,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(context: Arc<ServiceContext>, client_addr: SocketAddr) -> Self {
        MethodHandler {
            context,
            client_addr,
            session_ids: Vec::new(),
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        if request.method != Method::Options && !self.authorized(request) {
            tracing::warn!(peer = %self.client_addr, method = %request.method, "unauthorized request");
            return RtspResponse::unauthorized(AUTH_REALM).add_header("CSeq", cseq);
        }

        match request.method {
            Method::Options => self.handle_options(cseq),
            Method::Describe => self.handle_describe(cseq, &request.uri),
            Method::Setup => self.handle_setup(cseq, request),
            Method::Play => self.handle_play(cseq, request),
            Method::Pause => self.handle_pause(cseq, request),
            Method::Teardown => self.handle_teardown(cseq, request),
            Method::GetParameter => self.handle_get_parameter(cseq, request),
            Method::Other(_) => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented").add_header("CSeq", cseq)
            }
        }
    }

    fn authorized(&self, request: &RtspRequest) -> bool {
        match &self.context.config().credentials {
            Some(credentials) => credentials.authorizes(request.get_header("Authorization")),
            None => true,
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        let public = Method::SUPPORTED.map(|m| m.as_str().to_owned()).join(", ");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", &public)
    }

    /// Host for the SDP: the configured public host, else the host of the
    /// request URI, else the client IP.
    fn advertised_host(&self, uri: &str) -> String {
        if let Some(host) = &self.context.config().public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        if !self.context.matches_stream(uri) {
            tracing::warn!(uri, "DESCRIBE for unknown stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }

        let host = self.advertised_host(uri);
        let sdp = sdp::generate_sdp(self.context.track(), &host, self.context.config());

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(sdp)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if !self.context.matches_stream(&request.uri) {
            tracing::warn!(uri = %request.uri, "SETUP for unknown stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        // Only RTP/AVP over UDP. Interleaved TCP (RFC 2326 §10.12) is rejected.
        if transport_header.contains("RTP/AVP/TCP") || transport_header.contains("interleaved=") {
            tracing::warn!(%cseq, transport = %transport_header, "client requested TCP transport");
            return RtspResponse::new(461, "Unsupported Transport")
                .add_header("CSeq", cseq)
                .add_header("Unsupported", "RTP/AVP/TCP");
        }

        let Some(client_transport) = TransportHeader::parse(transport_header) else {
            tracing::warn!(%cseq, transport_header, "SETUP invalid Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let sessions = self.context.server().sessions();
        let (server_rtp_port, server_rtcp_port) = match sessions.allocate_server_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::error!(error = %e, "failed to allocate server ports");
                return RtspResponse::new(500, "Internal Server Error").add_header("CSeq", cseq);
            }
        };

        let session = sessions.create_session(&request.uri);
        let session_id = session.id.clone();
        let client_rtp_addr =
            SocketAddr::new(self.client_addr.ip(), client_transport.client_rtp_port);

        session.set_transport(Transport {
            client_rtp_port: client_transport.client_rtp_port,
            client_rtcp_port: client_transport.client_rtcp_port,
            server_rtp_port,
            server_rtcp_port,
            client_addr: client_rtp_addr,
        });
        self.session_ids.push(session_id.clone());

        tracing::info!(
            session_id,
            uri = %request.uri,
            client_rtp = %client_rtp_addr,
            server_rtp_port,
            "session created via SETUP"
        );

        let transport_response = format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
            client_transport.client_rtp_port,
            client_transport.client_rtcp_port,
            server_rtp_port,
            server_rtcp_port
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    /// Resolve the session named by the `Session` header.
    fn session(&self, method: &str, cseq: &str, request: &RtspRequest) -> Result<Arc<Session>, RtspResponse> {
        let Some(session_id) = extract_session_id(request) else {
            tracing::warn!(%cseq, method, "missing Session header");
            return Err(RtspResponse::session_not_found().add_header("CSeq", cseq));
        };
        self.context.server().sessions().require(&session_id).map_err(|e| {
            tracing::warn!(error = %e, method, "request for unknown session");
            RtspResponse::session_not_found().add_header("CSeq", cseq)
        })
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = match self.session("PLAY", cseq, request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        session.set_state(PlaybackState::Playing);
        self.context.session_started(&session.id);
        tracing::info!(session_id = %session.id, "session started playing");

        let track = self.context.track();
        let rtp_info = format!(
            "url={};seq={};rtptime={}",
            session.uri,
            track.next_sequence(),
            track.next_rtp_timestamp()
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = match self.session("PAUSE", cseq, request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        session.set_state(PlaybackState::Paused);
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = match self.session("TEARDOWN", cseq, request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        self.context.server().sessions().remove_session(&session.id);
        self.context.session_ended(&session.id);
        self.session_ids.retain(|id| id != &session.id);
        tracing::info!(session_id = %session.id, "session terminated via TEARDOWN");
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = extract_session_id(request)
            && self.context.server().sessions().get_session(&id).is_some()
        {
            resp = resp.add_header("Session", &id);
        }

        resp
    }
}

/// Session ID from the `Session` header, without the timeout suffix:
/// `"SESSIONID;timeout=60"` → `"SESSIONID"`.
fn extract_session_id(request: &RtspRequest) -> Option<String> {
    request
        .get_header("Session")
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
}
