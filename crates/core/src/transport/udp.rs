use std::net::{SocketAddr, UdpSocket};

use crate::error::{Result, StreamError};
use crate::session::{Session, SessionManager};

/// UDP transport for outbound RTP packet delivery.
///
/// Binds a single ephemeral socket (`0.0.0.0:0`) shared by every session of
/// one server. Sessions are addressed through the transport negotiated at
/// SETUP.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound RTP.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }

    /// Send one packet to a playing session.
    pub fn send_to_session(&self, session: &Session, payload: &[u8]) -> Result<usize> {
        if !session.is_playing() {
            return Err(StreamError::SessionNotPlaying(session.id.clone()));
        }
        let transport = session
            .get_transport()
            .ok_or_else(|| StreamError::TransportNotConfigured(session.id.clone()))?;
        self.send_to(payload, transport.client_addr)
    }

    /// Send one packet to every playing session. Returns how many sessions
    /// it reached; per-session failures are logged and skipped.
    pub fn broadcast(&self, sessions: &SessionManager, payload: &[u8]) -> usize {
        let mut sent = 0;
        for session in sessions.get_playing_sessions() {
            match self.send_to_session(&session, payload) {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::trace!(session_id = %session.id, error = %e, "RTP send skipped");
                }
            }
        }
        sent
    }
}
