//! The server proper: routing, middleware, and the accept loop.
//!
//! The listener thread only accepts sockets and hands them to the
//! worker pool; every byte of HTTP happens on a worker. When the pool
//! refuses a connection the listener answers 503 inline and hangs up,
//! which keeps overload visible to clients instead of silently queueing
//! them into a timeout.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use net2::TcpBuilder;
use quick_error::quick_error;

use crate::config::{ConfigError, ServerConfig};
use crate::connection::Connection;
use crate::pool::WorkerPool;
use crate::request::{Method, Request};
use crate::response::Response;

quick_error! {
    #[derive(Debug)]
    pub enum ServerError {
        Config(err: ConfigError) {
            from()
            display("configuration error: {}", err)
        }
        Bind(addr: String, err: io::Error) {
            display("failed to bind {}: {}", addr, err)
        }
        Io(err: io::Error) {
            from()
            display("io error: {}", err)
        }
    }
}

/// Turns a request into a response. The whole dispatch pipeline, router
/// included, is made of these.
pub trait Handler: Send + Sync {
    fn handle(&self, req: &mut Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&mut Request) -> Response + Send + Sync,
{
    fn handle(&self, req: &mut Request) -> Response {
        self(req)
    }
}

/// Cross-cutting request processing.
///
/// A middleware decides whether and when to call the rest of the chain
/// through `next`; not calling it short-circuits the request.
/// Middleware are folded into the handler chain once at startup;
/// dispatch itself does no list walking.
pub trait Middleware: Send + Sync {
    fn handle(&self, req: &mut Request, next: &dyn Handler) -> Response;
}

struct Chain {
    middleware: Arc<dyn Middleware>,
    inner: Arc<dyn Handler>,
}

impl Handler for Chain {
    fn handle(&self, req: &mut Request) -> Response {
        self.middleware.handle(req, self.inner.as_ref())
    }
}

#[derive(Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Clone)]
struct Route {
    method: Method,
    segments: Vec<Segment>,
    handler: Arc<dyn Handler>,
}

/// `<name>` segments capture into `path_params`, everything else must
/// match literally.
fn parse_pattern(pattern: &str) -> Vec<Segment> {
    split_path(pattern)
        .map(|seg| {
            if seg.starts_with('<') && seg.ends_with('>') && seg.len() > 2 {
                Segment::Param(seg[1..seg.len() - 1].to_string())
            } else {
                Segment::Literal(seg.to_string())
            }
        })
        .collect()
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|seg| !seg.is_empty())
}

fn match_path<'a>(segments: &'a [Segment], path: &'a str) -> Option<Vec<(&'a str, &'a str)>> {
    let mut params = Vec::new();
    let mut parts = split_path(path);
    for segment in segments {
        let part = parts.next()?;
        match segment {
            Segment::Literal(lit) if lit == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => params.push((&name[..], part)),
        }
    }
    if parts.next().is_some() {
        return None;
    }
    Some(params)
}

struct Router {
    routes: Vec<Route>,
}

impl Handler for Router {
    fn handle(&self, req: &mut Request) -> Response {
        let mut allowed: Vec<&'static str> = Vec::new();
        for route in &self.routes {
            // captures are owned so the borrow of the path ends before
            // the request is mutated below
            let params: Vec<(String, String)> = match match_path(&route.segments, &req.path) {
                Some(params) => params
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
                None => continue,
            };
            if route.method != req.method {
                if !allowed.contains(&route.method.as_str()) {
                    allowed.push(route.method.as_str());
                }
                continue;
            }
            for (name, value) in params {
                req.set_path_param(&name, &value);
            }
            return route.handler.handle(req);
        }
        if allowed.is_empty() {
            Response::not_found()
        } else {
            Response::with_error(405, "Method Not Allowed").header("Allow", &allowed.join(", "))
        }
    }
}

fn build_handler(routes: Vec<Route>, middleware: &[Arc<dyn Middleware>]) -> Arc<dyn Handler> {
    let mut handler: Arc<dyn Handler> = Arc::new(Router { routes });
    // reverse fold so the first middleware added runs outermost
    for mw in middleware.iter().rev() {
        handler = Arc::new(Chain {
            middleware: mw.clone(),
            inner: handler,
        });
    }
    handler
}

/// Owns the listening socket and the accept loop. What happens to an
/// accepted socket is the caller's business, passed in as a callback;
/// the server submits it to the worker pool there.
pub struct Listener {
    listener: TcpListener,
    running: Arc<AtomicBool>,
    addr: String,
}

impl Listener {
    pub fn bind(config: &ServerConfig, running: Arc<AtomicBool>) -> Result<Listener, ServerError> {
        let addr = config.addr();
        let sockaddr = resolve(&addr)?;
        let builder = if sockaddr.is_ipv4() {
            TcpBuilder::new_v4()?
        } else {
            TcpBuilder::new_v6()?
        };
        builder.reuse_address(true)?;
        let listener = builder
            .bind(sockaddr)
            .and_then(|b| b.listen(config.backlog))
            .map_err(|err| ServerError::Bind(addr.clone(), err))?;
        // nonblocking accept with a sleep tick, so the loop notices the
        // shutdown flag without a pending connection
        listener.set_nonblocking(true)?;
        Ok(Listener {
            listener,
            running,
            addr,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the running flag clears. A tick with
    /// nothing to accept is normal polling, not an error.
    pub fn run<F>(&self, mut on_accept: F)
    where
        F: FnMut(TcpStream, SocketAddr),
    {
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((sock, peer)) => {
                    let _ = sock.set_nonblocking(false);
                    let _ = sock.set_nodelay(true);
                    on_accept(sock, peer);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("accept failed: {}", err);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        debug!("listener on {} exiting", self.addr);
    }
}

/// Flips the listener's running flag from another thread, typically a
/// signal handler.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct HttpServer {
    config: Arc<ServerConfig>,
    routes: Vec<Route>,
    middleware: Vec<Arc<dyn Middleware>>,
    running: Arc<AtomicBool>,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Result<HttpServer, ServerError> {
        config.validate()?;
        Ok(HttpServer {
            config: Arc::new(config),
            routes: Vec::new(),
            middleware: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn route<H>(&mut self, method: Method, pattern: &str, handler: H) -> &mut HttpServer
    where
        H: Handler + 'static,
    {
        self.routes.push(Route {
            method,
            segments: parse_pattern(pattern),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn wrap<M>(&mut self, middleware: M) -> &mut HttpServer
    where
        M: Middleware + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.running.clone())
    }

    /// Bind and serve until the shutdown handle fires, then drain the
    /// worker pool and return.
    pub fn run(self) -> Result<(), ServerError> {
        let listener = Listener::bind(&self.config, self.running.clone())?;
        let handler = build_handler(self.routes, &self.middleware);
        let pool = WorkerPool::new(&self.config);
        let conn_ids = AtomicU64::new(1);
        info!(
            "listening on {} ({}..{} workers, queue {})",
            self.config.addr(),
            self.config.min_workers,
            self.config.max_workers,
            self.config.queue_size
        );

        listener.run(|sock, peer| {
            let id = conn_ids.fetch_add(1, Ordering::SeqCst);
            debug!("[{}] accepted connection from {}", id, peer);
            // a dup of the socket survives the closure being dropped on
            // rejection, so the 503 still has somewhere to go
            let reject_sock = sock.try_clone();
            let handler = handler.clone();
            let config = self.config.clone();
            let accepted = pool.submit(move || {
                let mut conn = Connection::new(id, sock, peer, config.as_ref());
                conn.serve(handler.as_ref());
            });
            if !accepted {
                warn!("[{}] rejecting {}: worker queue full", id, peer);
                if let Ok(mut sock) = reject_sock {
                    reject_overloaded(&mut sock, &self.config.server_name);
                }
            }
        });

        info!("listener stopped, draining workers");
        pool.shutdown(true, Duration::from_secs(30));
        Ok(())
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, ServerError> {
    addr.to_socket_addrs()
        .map_err(|err| ServerError::Bind(addr.to_string(), err))?
        .next()
        .ok_or_else(|| {
            ServerError::Bind(
                addr.to_string(),
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address"),
            )
        })
}

fn reject_overloaded(sock: &mut std::net::TcpStream, server_name: &str) {
    let mut resp = Response::with_error(503, "server overloaded");
    resp.set_header("Connection", "close");
    resp.set_header("Retry-After", "1");
    let bytes = resp.to_bytes(server_name, SystemTime::now());
    let _ = sock.write_all(&bytes);
    let _ = sock.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{build_handler, match_path, parse_pattern, Handler, HttpServer, Middleware, Route};
    use crate::config::ServerConfig;
    use crate::message::FramedMessage;
    use crate::request::{self, Method, Request};
    use crate::response::Response;

    fn make_request(method: &str, target: &str) -> Request {
        let head = format!("{} {} HTTP/1.1\r\nHost: test", method, target);
        let msg = FramedMessage {
            head: head.into_bytes(),
            body: Vec::new(),
        };
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        request::parse(msg, peer).unwrap()
    }

    fn route(method: Method, pattern: &str, handler: impl Handler + 'static) -> Route {
        Route {
            method,
            segments: parse_pattern(pattern),
            handler: Arc::new(handler),
        }
    }

    #[test]
    fn test_pattern_matching() {
        let segments = parse_pattern("/users/<id>/posts");
        assert!(match_path(&segments, "/users/42/posts").is_some());
        assert_eq!(
            match_path(&segments, "/users/42/posts").unwrap(),
            vec![("id", "42")]
        );
        assert!(match_path(&segments, "/users/42").is_none());
        assert!(match_path(&segments, "/users/42/posts/7").is_none());
        assert!(match_path(&segments, "/users/42/other").is_none());
        // trailing slash is not significant
        assert!(match_path(&segments, "/users/42/posts/").is_some());
    }

    #[test]
    fn test_router_dispatch_and_params() {
        let handler = build_handler(
            vec![
                route(Method::Get, "/hello", |_req: &mut Request| {
                    Response::ok().text("hi")
                }),
                route(Method::Get, "/users/<id>", |req: &mut Request| {
                    Response::ok().text(&req.path_params["id"])
                }),
            ],
            &[],
        );
        let mut req = make_request("GET", "/users/42");
        let resp = handler.handle(&mut req);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_bytes(), b"42");

        let mut req = make_request("GET", "/nope");
        assert_eq!(handler.handle(&mut req).status, 404);

        let mut req = make_request("POST", "/hello");
        let resp = handler.handle(&mut req);
        assert_eq!(resp.status, 405);
        assert_eq!(resp.header_value("Allow"), Some("GET"));
    }

    struct Gatekeeper;

    impl Middleware for Gatekeeper {
        fn handle(&self, req: &mut Request, next: &dyn Handler) -> Response {
            if req.path == "/blocked" {
                Response::with_error(403, "Forbidden")
            } else {
                next.handle(req)
            }
        }
    }

    struct Tagger;

    impl Middleware for Tagger {
        fn handle(&self, req: &mut Request, next: &dyn Handler) -> Response {
            next.handle(req).header("X-Tag", "seen")
        }
    }

    #[test]
    fn test_middleware_short_circuit_and_after() {
        let routes = vec![route(Method::Get, "/hello", |_req: &mut Request| {
            Response::ok().text("hi")
        })];
        let handler = build_handler(
            routes,
            &[Arc::new(Tagger) as Arc<dyn Middleware>, Arc::new(Gatekeeper)],
        );

        let mut req = make_request("GET", "/hello");
        let resp = handler.handle(&mut req);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header_value("X-Tag"), Some("seen"));

        // Gatekeeper is inner and short-circuits before the route
        // handler; Tagger wraps it and still tags the response
        let mut req = make_request("GET", "/blocked");
        let resp = handler.handle(&mut req);
        assert_eq!(resp.status, 403);
        assert_eq!(resp.header_value("X-Tag"), Some("seen"));
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn talk(addr: &str, request: &str) -> String {
        let mut sock = TcpStream::connect(addr).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.write_all(request.as_bytes()).unwrap();
        let mut reply = String::new();
        let _ = sock.read_to_string(&mut reply);
        reply
    }

    #[test]
    fn test_end_to_end_over_loopback() {
        let mut config = ServerConfig::default();
        config.port = free_port();
        config.min_workers = 2;
        config.max_workers = 2;
        let addr = config.addr();

        let mut server = HttpServer::new(config).unwrap();
        server.route(Method::Get, "/hello", |_req: &mut Request| {
            Response::ok().text("hi")
        });
        let handle = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.run());
        std::thread::sleep(Duration::from_millis(300));

        let reply = talk(
            &addr,
            "GET /hello HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        );
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", reply);
        assert!(reply.ends_with("hi"));

        let reply = talk(
            &addr,
            "GET /missing HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        );
        assert!(
            reply.starts_with("HTTP/1.1 404 Not Found\r\n"),
            "got: {}",
            reply
        );

        handle.shutdown();
        thread.join().unwrap().unwrap();
    }
}
