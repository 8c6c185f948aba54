use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body::Frame;
use serde::{Deserialize, Serialize};
use std::{pin::Pin, sync::Arc};
use tokio::sync::mpsc;

use crate::value::Value;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type BoxedStream<T> = Pin<Box<dyn futures::Stream<Item = T> + Send + Sync>>;

pub type HttpBodyStream = BoxedStream<core::result::Result<Frame<Bytes>, BoxError>>;
pub type HttpResponse = http::Response<HttpBodyStream>;

/// Target for script console output that no [`ConsoleSink`] claimed.
pub const TRACE_TARGET_SCRIPT: &str = "isobridge::script";

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketMessage {
    Text(String),
    Binary(Bytes),
    Close { code: Option<u16>, reason: String },
}

/// An established outbound websocket.
///
/// Dropping `outgoing` closes the connection.
pub struct WebSocketConnection {
    pub outgoing: mpsc::Sender<WebSocketMessage>,
    pub incoming: BoxedStream<core::result::Result<WebSocketMessage, BoxError>>,
}

#[async_trait::async_trait]
pub trait Host: Send + Sync + 'static {
    /// Perform an HTTP request on behalf of a sandboxed script.
    ///
    /// Implementations own redirect behavior and header hygiene. In particular,
    /// remove any caller-supplied `Host` header before dispatching.
    async fn http_request(&self, req: HttpRequest) -> core::result::Result<HttpResponse, BoxError>;

    /// Open a websocket on behalf of a sandboxed script.
    async fn connect_websocket(
        &self,
        url: &str,
        protocols: &[String],
    ) -> core::result::Result<WebSocketConnection, BoxError> {
        let _ = protocols;
        Err(format!("websocket connections are not supported (requested {url})").into())
    }
}

#[async_trait::async_trait]
impl<T: Host + ?Sized> Host for Arc<T> {
    async fn http_request(&self, req: HttpRequest) -> core::result::Result<HttpResponse, BoxError> {
        (**self).http_request(req).await
    }

    async fn connect_websocket(
        &self,
        url: &str,
        protocols: &[String],
    ) -> core::result::Result<WebSocketConnection, BoxError> {
        (**self).connect_websocket(url, protocols).await
    }
}

/// A host without network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineHost;

#[async_trait::async_trait]
impl Host for OfflineHost {
    async fn http_request(&self, req: HttpRequest) -> core::result::Result<HttpResponse, BoxError> {
        Err(format!("network access is disabled (requested {})", req.uri).into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsoleLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

/// Receives console output of one evaluation.
///
/// Called in the order the sandbox emitted the messages.
pub trait ConsoleSink: Send + Sync + 'static {
    fn on_console(&self, level: ConsoleLevel, args: &[Value]);
}

impl<F> ConsoleSink for F
where
    F: Fn(ConsoleLevel, &[Value]) + Send + Sync + 'static,
{
    fn on_console(&self, level: ConsoleLevel, args: &[Value]) {
        self(level, args);
    }
}

/// Emit console output on [`TRACE_TARGET_SCRIPT`].
pub(crate) fn trace_console(level: ConsoleLevel, args: &[Value]) {
    let message = args
        .iter()
        .map(Value::describe)
        .collect::<Vec<_>>()
        .join(" ");
    match level {
        ConsoleLevel::Debug => {
            tracing::event!(target: TRACE_TARGET_SCRIPT, tracing::Level::DEBUG, message = %message);
        }
        ConsoleLevel::Log | ConsoleLevel::Info => {
            tracing::event!(target: TRACE_TARGET_SCRIPT, tracing::Level::INFO, message = %message);
        }
        ConsoleLevel::Warn => {
            tracing::event!(target: TRACE_TARGET_SCRIPT, tracing::Level::WARN, message = %message);
        }
        ConsoleLevel::Error => {
            tracing::event!(target: TRACE_TARGET_SCRIPT, tracing::Level::ERROR, message = %message);
        }
    }
}
