use std::fmt::Write as _;

/// Value of the `Server` header on every response.
pub const SERVER_AGENT: &str = concat!("rtsp-live/", env!("CARGO_PKG_VERSION"));

/// An RTSP response under construction (RFC 2326 §7).
///
/// `Content-Length` is added by [`serialize`](Self::serialize) when a body
/// is set.
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status_code: u16, reason: &'static str) -> Self {
        RtspResponse {
            status_code,
            reason,
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 401 with a Basic challenge for `realm`.
    pub fn unauthorized(realm: &str) -> Self {
        Self::new(401, "Unauthorized")
            .add_header("WWW-Authenticate", &format!("Basic realm=\"{realm}\""))
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(128 + self.body.as_ref().map_or(0, String::len));
        let _ = write!(out, "RTSP/1.0 {} {}\r\n", self.status_code, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        if let Some(body) = &self.body {
            let _ = write!(out, "Content-Length: {}\r\n", body.len());
        }
        out.push_str("\r\n");
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_only_response() {
        let s = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS")
            .serialize();
        assert_eq!(
            s,
            format!("RTSP/1.0 200 OK\r\nServer: {SERVER_AGENT}\r\nCSeq: 1\r\nPublic: OPTIONS\r\n\r\n")
        );
    }

    #[test]
    fn body_gets_content_length() {
        let s = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string())
            .serialize();
        assert!(s.contains("CSeq: 2\r\nContent-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn unauthorized_carries_challenge() {
        let s = RtspResponse::unauthorized("rtsp-live")
            .add_header("CSeq", "3")
            .serialize();
        assert!(s.starts_with("RTSP/1.0 401 Unauthorized\r\n"));
        assert!(s.contains("WWW-Authenticate: Basic realm=\"rtsp-live\"\r\n"));
    }

    #[test]
    fn error_statuses() {
        assert_eq!(RtspResponse::not_found().status_code, 404);
        assert!(
            RtspResponse::session_not_found()
                .serialize()
                .starts_with("RTSP/1.0 454 Session Not Found\r\n")
        );
    }
}
