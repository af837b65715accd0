//! HTTP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::RequestHandler;
use crate::metrics::Metrics;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use robotrpc_core::Host;
use robotrpc_protocol::{
    ProtocolError, DEFAULT_PORT, FINISH_PATH, INCOMING_PATH, JSON_PATH, MAX_BODY_SIZE,
};
use serde_json::Value;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const METRICS_PATH: &str = "/metrics";
const HEALTH_PATH: &str = "/health";

/// Shortest sweep period accepted.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// How often expired locks and memories are swept.
    pub sweep_interval: Duration,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("sweep_interval", &self.sweep_interval)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_body_bytes: MAX_BODY_SIZE,
            sweep_interval: Duration::from_secs(30),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_max_body(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// HTTP server exposing a host to robot plugins.
pub struct Server {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, host: Arc<Host>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handler = RequestHandler::new(host).with_max_body(config.max_body_bytes);
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }
        Self {
            config,
            handler: Arc::new(handler),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Builds the host and server described by a loaded configuration,
    /// registering its static callers.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        config.validate()?;
        let host = Arc::new(Host::new(config.host_config())?);
        for spec in &config.callers {
            let caller = host.register_caller(spec.clone())?;
            tracing::info!("Registered caller {} for {}", caller.caller_id, caller.task);
        }

        let mut server_config = ServerConfig::new(config.network.bind_addr)
            .with_max_body(config.network.max_body_bytes)
            .with_sweep_interval(config.network.sweep_interval());
        if config.metrics.enabled {
            server_config = server_config.with_metrics(Arc::new(Metrics::new()?));
        }
        Ok(Self::new(server_config, host))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<Host> {
        self.handler.host()
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let addr = listener.local_addr()?;
        self.spawn_sweeper();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on http://{}{} (metrics {})",
            addr,
            JSON_PATH,
            if self.config.metrics_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let handler = handler.clone();
                                    async move { Ok::<_, Infallible>(route(req, handler).await) }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    tracing::debug!("Connection {} error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.handler.host().shutdown();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_sweeper(&self) {
        let handler = self.handler.clone();
        let period = self.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        handler.host().sweep();
                        handler.update_gauge_metrics();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Routing
// ============================================================================

async fn route(req: Request<Incoming>, handler: Arc<RequestHandler>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (method, path.as_str()) {
        (Method::POST, JSON_PATH) => match read_body(req, handler.max_body()).await {
            Ok(body) => match handler.handle_call(&body).await {
                Ok(value) => json_response(StatusCode::OK, &value),
                Err(e) => error_response(&e),
            },
            Err(e) => error_response(&e),
        },
        (Method::POST, INCOMING_PATH) => {
            let result = match read_body(req, handler.max_body()).await {
                Ok(body) => handler
                    .handle_incoming(&body)
                    .and_then(|r| Ok(serde_json::to_value(r)?)),
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => json_response(StatusCode::OK, &value),
                Err(e) => error_response(&e),
            }
        }
        (Method::POST, FINISH_PATH) => {
            let result = match read_body(req, handler.max_body()).await {
                Ok(body) => handler
                    .handle_finish(&body)
                    .and_then(|r| Ok(serde_json::to_value(r)?)),
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => json_response(StatusCode::OK, &value),
                Err(e) => error_response(&e),
            }
        }
        (Method::GET, METRICS_PATH) => match handler.metrics() {
            Some(metrics) => {
                handler.update_gauge_metrics();
                match metrics.encode() {
                    Ok(body) => response(
                        StatusCode::OK,
                        "text/plain; version=0.0.4; charset=utf-8",
                        body,
                    ),
                    Err(e) => error_response(&ServerError::from(e)),
                }
            }
            None => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        },
        (Method::GET, HEALTH_PATH) => response(StatusCode::OK, "text/plain", "OK"),
        (_, JSON_PATH | INCOMING_PATH | FINISH_PATH | METRICS_PATH | HEALTH_PATH) => response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "Method Not Allowed",
        ),
        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

/// Reads a request body, refusing anything over `max` bytes.
async fn read_body(req: Request<Incoming>, max: usize) -> Result<Bytes, ServerError> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(size) = declared.filter(|size| *size > max) {
        return Err(ProtocolError::BodyTooLarge { size, max }.into());
    }

    match Limited::new(req.into_body(), max).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(ProtocolError::BodyTooLarge {
            size: declared.unwrap_or(max + 1),
            max,
        }
        .into()),
        Err(e) => match e.downcast::<hyper::Error>() {
            Ok(e) => Err(ServerError::Http(*e)),
            Err(e) => Err(ServerError::Io(std::io::Error::other(e))),
        },
    }
}

fn response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    response(status, "application/json", value.to_string())
}

fn error_response(err: &ServerError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::warn!("Request failed: {}", err);
    }
    json_response(status, &err.to_body())
}
