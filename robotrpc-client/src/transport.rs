//! Request transport.
//!
//! A [`Transport`] carries one encoded envelope to the host and brings back
//! the response body. [`HttpTransport`] is the real one; [`ScriptedTransport`]
//! replays canned bodies.

use crate::error::TransportError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use robotrpc_protocol::{CALLER_ID_HEADER, JSON_PATH};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default time allowed for one call, including any prompt wait on the host.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One encoded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub caller_id: String,
    pub body: Vec<u8>,
}

/// Delivers a request and returns the raw response body.
///
/// Implementations make exactly one attempt; retrying is the caller's call.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    /// Fail on non-2xx answers instead of handing the body to the decoder.
    pub throw_on_http_error: bool,
}

impl TransportConfig {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            throw_on_http_error: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_throw_on_http_error(mut self, throw: bool) -> Self {
        self.throw_on_http_error = throw;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Posts envelopes to `<base>/json` over HTTP/1.1, one connection per call.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    host: String,
    port: u16,
    authority: String,
    path: String,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(base_url: &str, config: TransportConfig) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidUrl {
            url: base_url.to_string(),
            reason: reason.to_string(),
        };
        let uri: Uri = base_url.parse().map_err(|e: hyper::http::uri::InvalidUri| {
            invalid(&e.to_string())
        })?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme {}", other))),
            None => return Err(invalid("missing scheme")),
        }
        let authority = uri
            .authority()
            .ok_or_else(|| invalid("missing host"))?
            .clone();
        let host = authority.host().trim_matches(|c| c == '[' || c == ']').to_string();
        let port = authority.port_u16().unwrap_or(80);
        let path = format!("{}{}", uri.path().trim_end_matches('/'), JSON_PATH);

        Ok(Self {
            host,
            port,
            authority: authority.to_string(),
            path,
            config,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Address calls are posted to, e.g. `127.0.0.1:8880/json`.
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.authority, self.path)
    }

    async fn post(&self, request: TransportRequest) -> Result<Vec<u8>, TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::Refused {
                    addr: self.authority.clone(),
                    source: e,
                },
                _ => TransportError::Io(e),
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Host connection error: {}", e);
            }
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(HOST, self.authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(CALLER_ID_HEADER, request.caller_id.as_str())
            .body(Full::new(Bytes::from(request.body)))
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let response = sender.send_request(req).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            tracing::debug!("Host answered HTTP {}", status.as_u16());
            if self.config.throw_on_http_error {
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
        }
        Ok(body.to_vec())
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<Vec<u8>, TransportError> {
        match tokio::time::timeout(self.config.timeout, self.post(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Call to {} timed out after {:?}", self.endpoint(), self.config.timeout);
                Err(TransportError::Timeout(self.config.timeout))
            }
        }
    }
}

/// Transport that answers from a queue of canned bodies and records what was
/// sent. Useful for exercising plugins without a host.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    sent: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response body.
    pub fn push(&self, body: impl Into<Vec<u8>>) {
        self.responses.lock().push_back(Ok(body.into()));
    }

    /// Queues a response serialized as JSON.
    pub fn push_json(&self, value: serde_json::Value) {
        self.push(value.to_string());
    }

    /// Queues a transport failure.
    pub fn push_error(&self, err: TransportError) {
        self.responses.lock().push_back(Err(err));
    }

    /// Requests sent so far, oldest first.
    pub fn sent(&self) -> Vec<TransportRequest> {
        self.sent.lock().clone()
    }

    /// Sent bodies parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<Vec<u8>, TransportError> {
        self.sent.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Err(TransportError::Exhausted))
    }
}
