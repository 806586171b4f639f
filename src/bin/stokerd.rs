//! Demo server binary.
//!
//! Wires a few routes onto the library, reads config from `HTTP_*`
//! environment variables with command-line overrides, and shuts down
//! cleanly on SIGINT/SIGTERM.

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use argparse::{ArgumentParser, StoreOption};
use log::{error, info};

use stoker_http::server::{Handler, Middleware};
use stoker_http::{HttpServer, Method, Request, Response, ServerConfig, ShutdownHandle};

// Signal handlers may only touch async-signal-safe state, so the
// handler sets a flag and a watcher thread does the actual work.
static SIGNALED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn watch_signals(handle: ShutdownHandle) {
    thread::spawn(move || loop {
        if SIGNALED.load(Ordering::SeqCst) {
            info!("signal received, shutting down");
            handle.shutdown();
            return;
        }
        thread::sleep(Duration::from_millis(100));
    });
}

/// Access-log middleware: one info line per request.
struct RequestLog;

impl Middleware for RequestLog {
    fn handle(&self, req: &mut Request, next: &dyn Handler) -> Response {
        let start = std::time::Instant::now();
        let (method, path, peer) = (req.method, req.path.clone(), req.peer);
        let resp = next.handle(req);
        info!(
            "{} \"{} {}\" {} {:?}",
            peer,
            method,
            path,
            resp.status,
            start.elapsed()
        );
        resp
    }
}

fn hello(_req: &mut Request) -> Response {
    Response::ok().text("hello world\n")
}

fn echo(req: &mut Request) -> Response {
    let body = match req.json() {
        Ok(value) => value,
        Err(_) => serde_json::Value::Null,
    };
    Response::ok().json(&serde_json::json!({
        "method": req.method.as_str(),
        "path": req.path,
        "query": req.query,
        "body": body,
    }))
}

fn greet(req: &mut Request) -> Response {
    let name = req.path_params["name"].clone();
    Response::ok().json(&serde_json::json!({ "greeting": format!("hello, {}", name) }))
}

fn main() {
    match std::env::var("HTTP_LOG_LEVEL") {
        Ok(level) => env_logger::Builder::new().parse_filters(&level).init(),
        Err(_) => env_logger::init(),
    }

    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut workers: Option<usize> = None;
    {
        let mut ap = ArgumentParser::new();
        ap.set_description("An educational HTTP/1.1 server on raw TCP sockets.");
        ap.refer(&mut host)
            .add_option(&["-H", "--host"], StoreOption, "Address to bind");
        ap.refer(&mut port)
            .add_option(&["-p", "--port"], StoreOption, "Port to bind");
        ap.refer(&mut workers)
            .add_option(&["-w", "--workers"], StoreOption, "Maximum worker threads");
        ap.parse_args_or_exit();
    }

    let mut config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            exit(2);
        }
    };
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(workers) = workers {
        config.max_workers = workers;
        config.min_workers = config.min_workers.min(workers);
    }

    let mut server = match HttpServer::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!("{}", err);
            exit(2);
        }
    };
    server.wrap(RequestLog);
    server.route(Method::Get, "/", hello);
    server.route(Method::Get, "/hello", hello);
    server.route(Method::Get, "/greet/<name>", greet);
    server.route(Method::Post, "/echo", echo);

    let hits = Mutex::new(0u64);
    server.route(Method::Get, "/stats", move |_req: &mut Request| {
        let mut hits = hits.lock().unwrap_or_else(|e| e.into_inner());
        *hits += 1;
        Response::ok().json(&serde_json::json!({ "stats_hits": *hits }))
    });

    install_signal_handlers();
    watch_signals(server.shutdown_handle());

    if let Err(err) = server.run() {
        error!("server failed: {}", err);
        exit(1);
    }
    info!("bye");
}
