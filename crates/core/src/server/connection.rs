use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::http::{ReadError, Request, Response};
use super::service::EventService;

/// Idle keep-alive connections are dropped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve `stream` on its own thread until the peer or the server closes it.
pub fn spawn(stream: TcpStream, service: Arc<EventService>, running: Arc<AtomicBool>) {
    if let Err(e) = stream.set_nonblocking(false) {
        tracing::warn!(error = %e, "could not switch connection to blocking mode");
        return;
    }
    let spawned = thread::Builder::new()
        .name("onvif-conn".to_string())
        .spawn(move || Connection::handle(stream, service, running));
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "could not spawn connection thread");
    }
}

/// One HTTP client connection, serving requests until the peer closes it.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    service: Arc<EventService>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl Connection {
    fn handle(stream: TcpStream, service: Arc<EventService>, running: Arc<AtomicBool>) {
        let (Ok(peer_addr), Ok(local_addr)) = (stream.peer_addr(), stream.local_addr()) else {
            return;
        };
        if stream.set_read_timeout(Some(IDLE_TIMEOUT)).is_err() {
            return;
        }
        let Ok(reader_stream) = stream.try_clone() else {
            return;
        };

        tracing::debug!(%peer_addr, "client connected");

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer: stream,
            service,
            peer_addr,
            local_addr,
        };
        let reason = conn.run(&running);

        tracing::debug!(%peer_addr, reason, "client disconnected");
    }

    /// Request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let request = match Request::read_from(&mut self.reader) {
                Ok(request) => request,
                Err(ReadError::Closed) => return "connection closed by client",
                Err(ReadError::Io(e)) => {
                    tracing::trace!(peer = %self.peer_addr, error = %e, "read ended");
                    return "read error";
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = ?e, "bad request");
                    let status = match e {
                        ReadError::TooLarge(_) => 413,
                        ReadError::HeadTooLarge => 431,
                        ReadError::Unsupported => 501,
                        _ => 400,
                    };
                    let response = Response::new(status).add_header("Connection", "close");
                    let _ = self.writer.write_all(&response.serialize());
                    return "malformed request";
                }
            };

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                path = %request.path,
                bytes = request.body.len(),
                "request"
            );

            let close = request.wants_close();
            let mut response = self.service.handle(&request, self.local_addr);
            if close {
                response = response.add_header("Connection", "close");
            }

            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

            if self.writer.write_all(&response.serialize()).is_err() {
                return "write error";
            }
            if close {
                return "client requested close";
            }
        }
        "server shutting down"
    }
}
