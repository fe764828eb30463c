//! Transport abstraction consumed by the engine
//!
//! The engine never speaks HTTP directly. It builds [`Request`] values and
//! hands them to a [`Transport`], which performs the authenticated network
//! call. Transport-level failures come back as [`TransportError`];
//! application-level failures come back as non-2xx [`Response`]s and are
//! classified by [`wire::classify_failure`].
//!
//! Credentials never live in the engine. A [`RequestSigner`] is injected into
//! a [`SigningTransport`] at construction and signs each outgoing request.

pub mod memory;
pub mod wire;

use crate::error::{MpuError, MpuResult};
use crate::types::{Session, SessionState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Streaming request body
pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Request body
pub enum Body {
    Empty,
    Json(Bytes),
    /// Byte stream with an optional known length
    Stream(BodyStream, Option<u64>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Json(bytes) => write!(f, "Json({} bytes)", bytes.len()),
            Body::Stream(_, len) => write!(f, "Stream({:?})", len),
        }
    }
}

/// Outgoing request
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: Body::Empty,
        }
    }

    /// Set a header (names are lowercased)
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Attach a JSON body
    pub fn json<T: Serialize>(mut self, payload: &T) -> MpuResult<Self> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| MpuError::Validation(format!("Failed to encode request: {}", e)))?;
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.body = Body::Json(Bytes::from(bytes));
        Ok(self)
    }

    /// Attach a streaming body
    pub fn stream(mut self, stream: BodyStream, length: Option<u64>) -> Self {
        if let Some(len) = length {
            self.headers
                .insert("content-length".to_string(), len.to_string());
        }
        self.body = Body::Stream(stream, length);
        self
    }
}

/// Response from the service
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Response with a JSON-encoded body
    pub fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        let body = serde_json::to_vec(payload).unwrap_or_default();
        let mut response = Self::new(status, body);
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> MpuResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Failure below the application protocol
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream error: {0}")]
    Io(String),

    #[error("connection closed before response")]
    Closed,
}

impl From<TransportError> for MpuError {
    fn from(err: TransportError) -> Self {
        MpuError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Performs one authenticated network call
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        (**self).send(request).await
    }
}

/// Send a request and classify any non-2xx response.
///
/// `session` fills in state-conflict errors; it is `None` only for open.
pub(crate) async fn exchange(
    transport: &dyn Transport,
    request: Request,
    operation: wire::Operation,
    session: Option<&Session>,
) -> MpuResult<Response> {
    let response = transport.send(request).await?;
    if response.is_success() {
        return Ok(response);
    }
    let (session_id, state) = session.map_or(("", SessionState::Open), |s| (s.id(), s.state()));
    Err(wire::classify_failure(&response, operation, session_id, state))
}

/// Signs outgoing requests; the scheme is up to the implementor
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &mut Request);
}

/// Signer that attaches a pre-issued token as the `authorization` header
pub struct StaticTokenSigner {
    token: SecretString,
}

impl StaticTokenSigner {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

impl RequestSigner for StaticTokenSigner {
    fn sign(&self, request: &mut Request) {
        request.headers.insert(
            "authorization".to_string(),
            format!("Bearer {}", self.token.expose_secret()),
        );
    }
}

impl fmt::Debug for StaticTokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenSigner")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Transport wrapper that signs every request before delegating
pub struct SigningTransport<T> {
    inner: T,
    signer: Arc<dyn RequestSigner>,
}

impl<T: Transport> SigningTransport<T> {
    pub fn new(inner: T, signer: Arc<dyn RequestSigner>) -> Self {
        Self { inner, signer }
    }
}

#[async_trait]
impl<T: Transport> Transport for SigningTransport<T> {
    async fn send(&self, mut request: Request) -> Result<Response, TransportError> {
        self.signer.sign(&mut request);
        self.inner.send(request).await
    }
}
