//! An educational HTTP/1.1 server built directly on TCP sockets.
//!
//! The pipeline is deliberately explicit: a framer cuts the byte
//! stream into messages, a parser turns a message into a `Request`,
//! handlers produce a `Response`, and a serializer writes it back.
//! Connections are served by a bounded worker pool, one blocking
//! thread per live connection.
//!
//! ```no_run
//! use stoker_http::{HttpServer, Method, Request, Response, ServerConfig};
//!
//! let mut server = HttpServer::new(ServerConfig::default()).unwrap();
//! server.route(Method::Get, "/hello", |_req: &mut Request| {
//!     Response::ok().text("hello world")
//! });
//! server.run().unwrap();
//! ```

mod connection;
mod headers;
mod message;
mod pool;
mod request;
mod response;
mod version;

pub mod config;
pub mod error;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use connection::{Connection, ConnectionState, StreamSocket};
pub use error::{HttpError, RequestError};
pub use message::{FramedMessage, Framing, MessageBuf};
pub use pool::{PoolStats, WorkerPool};
pub use request::{Method, Request};
pub use response::Response;
pub use server::{Handler, HttpServer, Listener, Middleware, ServerError, ShutdownHandle};
pub use version::Version;
