//! Server configuration.
//!
//! One flat value covering the socket, HTTP, and worker-pool knobs,
//! with environment-variable loading for container deployments.

use std::env;
use std::time::Duration;

use quick_error::quick_error;

quick_error! {
    #[derive(Debug)]
    pub enum ConfigError {
        BadEnvValue(var: &'static str, value: String) {
            display("invalid value for {}: {:?}", var, value)
        }
        InvalidPort {
            display("port must be non-zero")
        }
        WorkerBounds(min: usize, max: usize) {
            display("worker bounds are nonsense: min {} max {}", min, max)
        }
        ZeroQueue {
            display("task queue capacity must be at least one")
        }
        ZeroBuffer {
            display("read buffer size must be at least one byte")
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, `127.0.0.1` for development, `0.0.0.0` to
    /// accept from anywhere.
    pub host: String,
    pub port: u16,
    /// Accept-queue depth handed to `listen(2)`.
    pub backlog: i32,
    /// How much to read from a socket at once.
    pub buffer_size: usize,
    /// Read timeout for the first request on a connection. The client
    /// may be slow to produce it.
    pub timeout: Duration,
    pub keep_alive: bool,
    /// Read timeout between requests on a kept-alive connection. A
    /// client that already got a response should ask quickly or be
    /// dropped.
    pub keep_alive_timeout: Duration,
    /// Upper bound on a single request's total size in bytes.
    pub max_request_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Pending-task queue capacity; the admission-control bound.
    pub queue_size: usize,
    /// Value of the `Server` response header.
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            backlog: 128,
            buffer_size: 8192,
            timeout: Duration::from_secs(30),
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(5),
            max_request_size: 10 * 1024 * 1024,
            min_workers: 4,
            max_workers: 16,
            queue_size: 100,
            server_name: concat!("stoker-http/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::BadEnvValue(var, value)),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Build a config from `HTTP_*` environment variables on top of
    /// the defaults.
    pub fn from_env() -> Result<ServerConfig, ConfigError> {
        let mut config = ServerConfig::default();
        if let Ok(host) = env::var("HTTP_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("HTTP_PORT")? {
            config.port = port;
        }
        if let Some(workers) = env_parse("HTTP_WORKERS")? {
            config.max_workers = workers;
            config.min_workers = config.min_workers.min(workers);
        }
        if let Some(secs) = env_parse::<u64>("HTTP_TIMEOUT")? {
            config.timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return Err(ConfigError::WorkerBounds(self.min_workers, self.max_workers));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::ZeroQueue);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer);
        }
        Ok(())
    }
}
