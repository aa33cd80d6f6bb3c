use std::fmt;

use crate::error::{ParseErrorKind, Result, StreamError};

/// RTSP request methods the server knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    Other(String),
}

impl Method {
    /// Methods listed in the `Public` header of an OPTIONS reply.
    pub const SUPPORTED: [Method; 7] = [
        Method::Options,
        Method::Describe,
        Method::Setup,
        Method::Play,
        Method::Pause,
        Method::Teardown,
        Method::GetParameter,
    ];

    fn parse(token: &str) -> Self {
        match token {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed RTSP request head (RFC 2326 §6). Bodies are ignored.
#[derive(Debug)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub version: String,
    /// Header pairs in arrival order, names as received.
    pub headers: Vec<(String, String)>,
}

fn parse_error(kind: ParseErrorKind) -> StreamError {
    StreamError::Parse { kind }
}

impl RtspRequest {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(parse_error(ParseErrorKind::EmptyRequest))?;

        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(parse_error(ParseErrorKind::InvalidRequestLine));
        };
        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let headers = lines
            .take_while(|line| !line.is_empty())
            .map(|line| {
                line.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                    .ok_or(parse_error(ParseErrorKind::InvalidHeader))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RtspRequest {
            method: Method::parse(method),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/live/track1 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::Setup);
        assert_eq!(req.uri, "rtsp://localhost:8554/live/track1");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(
            req.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=8000-8001")
        );
    }

    #[test]
    fn unknown_method_is_kept() {
        let req = RtspRequest::parse("ANNOUNCE rtsp://h/live RTSP/1.0\r\nCSeq: 9\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Other("ANNOUNCE".into()));
        assert_eq!(req.method.to_string(), "ANNOUNCE");
    }

    #[test]
    fn malformed_requests() {
        let kind = |raw: &str| match RtspRequest::parse(raw) {
            Err(StreamError::Parse { kind }) => kind,
            other => panic!("expected parse error, got {other:?}"),
        };
        assert_eq!(kind(""), ParseErrorKind::EmptyRequest);
        assert_eq!(kind("JUST_A_METHOD\r\n\r\n"), ParseErrorKind::InvalidRequestLine);
        assert_eq!(kind("PLAY a b c\r\n\r\n"), ParseErrorKind::InvalidRequestLine);
        assert_eq!(
            kind("OPTIONS * RTSP/1.0\r\nno colon here\r\n\r\n"),
            ParseErrorKind::InvalidHeader
        );
    }

    #[test]
    fn header_value_keeps_inner_colons() {
        let raw = "DESCRIBE rtsp://h/live RTSP/1.0\r\nCSeq: 2\r\nAuthorization: Basic YTpi\r\nX-Url: rtsp://h:1/x\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("authorization"), Some("Basic YTpi"));
        assert_eq!(req.get_header("X-Url"), Some("rtsp://h:1/x"));
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }
}
