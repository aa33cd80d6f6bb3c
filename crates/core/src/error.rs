//! Error types for the capture-to-RTSP pipeline.

use std::fmt;

/// Errors that can occur anywhere in the pipeline.
///
/// Capture failures are contained by the capture worker. Server bring-up
/// failures ([`Bind`](Self::Bind), [`MissingVideoDelegate`](Self::MissingVideoDelegate),
/// [`Cancelled`](Self::Cancelled)) surface through
/// [`ServerResult`](crate::server::ServerResult).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The camera could not be opened or its parameters could not be applied.
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Invalid resolution/rotation, or the encoder was started before
    /// [`init_resolution`](crate::encoder::VideoEncoder::init_resolution).
    #[error("encoder configuration error: {0}")]
    EncoderConfig(String),

    /// The codec rejected a frame or failed to initialise.
    #[error("codec error: {0}")]
    Codec(String),

    /// The RTSP listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// [`RtspServerBuilder::build`](crate::server::RtspServerBuilder::build)
    /// was called without a video delegate.
    #[error("no video delegate bound to the server")]
    MissingVideoDelegate,

    /// `stop_service` ran before the pending bring-up could complete.
    #[error("service stopped before start completed")]
    Cancelled,

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// SETUP has not been completed for this session (no UDP ports negotiated).
    #[error("transport not configured for session: {0}")]
    TransportNotConfigured(String),

    /// Attempted to send media to a session that is not in the Playing state.
    #[error("session not in playing state: {0}")]
    SessionNotPlaying(String),

    /// The server has not been started yet.
    #[error("server not started")]
    NotStarted,

    /// `start_service` was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Server-side UDP port allocation exhausted the 5000-65534 range.
    #[error("port range exhausted (tried to allocate beyond u16 range)")]
    PortRangeExhausted,
}

impl StreamError {
    /// Integer error code reported through
    /// [`ServerResult::errno`](crate::server::ServerResult::errno).
    ///
    /// Bind and I/O failures report the OS error code when one is available.
    /// Everything else maps to a fixed negative code. Never returns 0.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Bind { source, .. } | Self::Io(source) => {
                source.raw_os_error().filter(|code| *code != 0).unwrap_or(-1)
            }
            Self::MissingVideoDelegate => -2,
            Self::Cancelled => -3,
            Self::AlreadyRunning => -4,
            Self::NotStarted => -5,
            Self::DeviceUnavailable(_) => -10,
            Self::EncoderConfig(_) => -11,
            Self::Codec(_) => -12,
            Self::Parse { .. } => -20,
            Self::SessionNotFound(_)
            | Self::TransportNotConfigured(_)
            | Self::SessionNotPlaying(_) => -21,
            Self::PortRangeExhausted => -22,
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_never_zero() {
        let errors = [
            StreamError::MissingVideoDelegate,
            StreamError::Cancelled,
            StreamError::DeviceUnavailable("busy".into()),
            StreamError::Bind {
                addr: "0.0.0.0:8554".into(),
                source: std::io::Error::other("boom"),
            },
        ];
        for e in &errors {
            assert_ne!(e.errno(), 0, "{e}");
        }
    }

    #[test]
    fn bind_errno_uses_os_code() {
        let e = StreamError::Bind {
            addr: "0.0.0.0:8554".into(),
            source: std::io::Error::from_raw_os_error(98),
        };
        assert_eq!(e.errno(), 98);
        assert!(e.to_string().contains("0.0.0.0:8554"));
    }
}
