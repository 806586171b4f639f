//! Per-connection lifecycle: the read/frame/parse/handle/write loop.
//!
//! One `Connection` owns one accepted socket for its entire life and is
//! driven by a single worker thread. Keep-alive means the loop runs once
//! per request on the same socket; pipelined bytes left over after one
//! message are picked up by the next framing pass without touching the
//! socket.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{HttpError, RequestError};
use crate::message::{Framing, MessageBuf};
use crate::request::{self, Request};
use crate::response::Response;
use crate::server::Handler;

/// The socket operations a connection needs.
///
/// `TcpStream` is the real implementation; tests drive the connection
/// with a scripted in-memory stream instead.
pub trait StreamSocket: Read + Write {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown_write(&mut self) -> io::Result<()>;
}

impl StreamSocket for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Reading,
    Processing,
    Writing,
    KeepAlive,
    Closing,
    Closed,
}

enum ReadOutcome {
    Message(crate::message::FramedMessage),
    Eof,
    TimedOut,
    Failed(RequestError),
    SocketError,
}

pub struct Connection<S: StreamSocket = TcpStream> {
    id: u64,
    sock: S,
    peer: SocketAddr,
    state: ConnectionState,
    created_at: Instant,
    last_activity: Instant,
    requests_served: u64,
    input: MessageBuf,
    buffer_size: usize,
    timeout: Duration,
    keep_alive_enabled: bool,
    keep_alive_timeout: Duration,
    server_name: String,
}

impl<S: StreamSocket> Connection<S> {
    pub fn new(id: u64, sock: S, peer: SocketAddr, config: &ServerConfig) -> Connection<S> {
        let now = Instant::now();
        Connection {
            id,
            sock,
            peer,
            state: ConnectionState::New,
            created_at: now,
            last_activity: now,
            requests_served: 0,
            input: MessageBuf::new(config.max_request_size),
            buffer_size: config.buffer_size,
            timeout: config.timeout,
            keep_alive_enabled: config.keep_alive,
            keep_alive_timeout: config.keep_alive_timeout,
            server_name: config.server_name.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Run the request/response loop until the connection is done, then
    /// close the socket. This is the worker thread's whole job for one
    /// accepted connection.
    pub fn serve(&mut self, handler: &dyn Handler) {
        loop {
            let msg = match self.read_request() {
                ReadOutcome::Message(msg) => msg,
                ReadOutcome::Eof => break,
                ReadOutcome::TimedOut => {
                    if self.requests_served == 0 && !self.input.has_header_section() {
                        // the client never finished its first header
                        // section, tell it before hanging up
                        self.send_error(&RequestError::HeadersTimeout);
                    } else {
                        debug!("[{}] idle timeout, closing", self.id);
                    }
                    break;
                }
                ReadOutcome::Failed(err) => {
                    self.send_error(&err);
                    break;
                }
                ReadOutcome::SocketError => break,
            };
            let mut req = match request::parse(msg, self.peer) {
                Ok(req) => req,
                Err(err) => {
                    self.send_error(&err);
                    break;
                }
            };
            self.state = ConnectionState::Processing;
            let keep_alive = self.keep_alive_enabled && req.is_keep_alive();
            let mut response = self.dispatch(handler, &mut req);
            // the connection decides reuse, so it owns these headers
            // even when a handler set its own
            if keep_alive {
                response.set_header("Connection", "keep-alive");
                let ka = format!("timeout={}", self.keep_alive_timeout.as_secs());
                response.set_header("Keep-Alive", &ka);
            } else {
                response.set_header("Connection", "close");
            }
            let bytes = response.to_bytes(&self.server_name, SystemTime::now());
            if !self.send(&bytes) {
                break;
            }
            self.requests_served += 1;
            if !keep_alive {
                break;
            }
            self.state = ConnectionState::KeepAlive;
        }
        self.close();
    }

    // A panicking handler must not take the worker thread down with it.
    fn dispatch(&self, handler: &dyn Handler, req: &mut Request) -> Response {
        let (method, path) = (req.method, req.path.clone());
        match catch_unwind(AssertUnwindSafe(|| handler.handle(req))) {
            Ok(response) => response,
            Err(_) => {
                warn!("[{}] handler panicked on {} {}", self.id, method, path);
                Response::with_error(500, "Internal Server Error")
            }
        }
    }

    /// Read until one complete message can be framed. Pipelined bytes
    /// already buffered satisfy this without a socket read.
    fn read_request(&mut self) -> ReadOutcome {
        self.state = ConnectionState::Reading;
        let timeout = if self.requests_served > 0 {
            self.keep_alive_timeout
        } else {
            self.timeout
        };
        if let Err(err) = self.sock.set_read_timeout(Some(timeout)) {
            debug!("[{}] set_read_timeout failed: {}", self.id, err);
            return ReadOutcome::SocketError;
        }
        let mut chunk = vec![0; self.buffer_size];
        loop {
            match self.input.try_frame() {
                Ok(Framing::Framed(msg)) => {
                    self.last_activity = Instant::now();
                    return ReadOutcome::Message(msg);
                }
                Ok(Framing::NeedMoreData) => {}
                Err(err) => return ReadOutcome::Failed(err),
            }
            match self.sock.read(&mut chunk) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => {
                    self.input.feed(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    return ReadOutcome::TimedOut;
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("[{}] read error: {}", self.id, err);
                    return ReadOutcome::SocketError;
                }
            }
        }
    }

    fn send_error(&mut self, err: &RequestError) {
        let (status, _) = err.http_status();
        let mut response = Response::with_error(status, &err.to_string());
        response.set_header("Connection", "close");
        let bytes = response.to_bytes(&self.server_name, SystemTime::now());
        self.send(&bytes);
    }

    fn send(&mut self, bytes: &[u8]) -> bool {
        self.state = ConnectionState::Writing;
        match self.sock.write_all(bytes).and_then(|()| self.sock.flush()) {
            Ok(()) => true,
            Err(err) => {
                debug!("[{}] write error: {}", self.id, err);
                false
            }
        }
    }

    /// Close the connection. Half-closes the write side first and
    /// drains a bounded amount of late input so the peer sees a clean
    /// FIN instead of a reset. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        let _ = self.sock.shutdown_write();
        if self.sock.set_read_timeout(Some(Duration::from_millis(500))).is_ok() {
            let mut scratch = [0u8; 1024];
            for _ in 0..32 {
                match self.sock.read(&mut scratch) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
        self.state = ConnectionState::Closed;
        debug!(
            "[{}] closed after {} request(s), lived {:?}",
            self.id,
            self.requests_served,
            self.age()
        );
    }
}
