use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::protocol::{MethodHandler, RtspRequest};
use crate::service::ServiceContext;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval so
/// that [`stop_service`](crate::server::RtspServer::stop_service) can end it
/// promptly. Each client is served on its own `rtsp-conn` thread.
pub fn accept_loop(listener: TcpListener, context: Arc<ServiceContext>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) && !context.is_closed() {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let ctx = context.clone();
                let r = running.clone();
                let spawned = thread::Builder::new()
                    .name("rtsp-conn".to_string())
                    .spawn(move || Connection::handle(stream, ctx, r));
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "failed to spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: register the connection and run its request loop.
    fn handle(stream: TcpStream, context: Arc<ServiceContext>, running: Arc<AtomicBool>) {
        let Ok(peer_addr) = stream.peer_addr() else {
            return;
        };
        let Some(connection_id) = context.register_connection(&stream) else {
            return;
        };

        tracing::info!(%peer_addr, "client connected");

        let Ok(reader_stream) = stream.try_clone() else {
            context.unregister_connection(connection_id);
            return;
        };

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer: stream,
            handler: MethodHandler::new(context.clone(), peer_addr),
            peer_addr,
        };

        let reason = conn.run(&running);
        conn.cleanup(&context);
        context.unregister_connection(connection_id);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let mut request_text = String::new();
            loop {
                let mut line = String::new();
                match self.reader.read_line(&mut line) {
                    Ok(0) => return "connection closed",
                    Ok(_) => {
                        request_text.push_str(&line);
                        if line == "\r\n" || line == "\n" {
                            break;
                        }
                    }
                    Err(_) => return "read error",
                }
            }

            if request_text.trim().is_empty() {
                continue;
            }

            match RtspRequest::parse(&request_text) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );

                    if self
                        .writer
                        .write_all(response.serialize().as_bytes())
                        .is_err()
                    {
                        return "write error";
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                }
            }
        }

        "server shutting down"
    }

    /// Drop the sessions this connection created.
    fn cleanup(&self, context: &ServiceContext) {
        let orphaned = self.handler.session_ids();
        if orphaned.is_empty() {
            return;
        }
        let removed = context.server().sessions().remove_sessions(orphaned);
        for id in orphaned {
            context.session_ended(id);
        }
        tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
    }
}
