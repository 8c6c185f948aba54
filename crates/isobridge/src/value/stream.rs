use std::{fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream::BoxStream};
use parking_lot::Mutex;

use super::{AnyRef, Completion, Value};

pub type ValueIter = Box<dyn Iterator<Item = Completion> + Send>;
pub type ValueStream = BoxStream<'static, Completion>;
pub type ByteChunks = BoxStream<'static, Result<Bytes, Value>>;

/// A synchronous sequence that can be consumed once.
#[derive(Clone)]
pub struct Iterable(Arc<IterableInner>);

struct IterableInner(Mutex<Option<ValueIter>>);

impl Iterable {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::fallible(items.into_iter().map(Ok))
    }

    /// An iterator whose items may throw; iteration ends after the first
    /// error.
    pub fn fallible<I>(iter: I) -> Self
    where
        I: Iterator<Item = Completion> + Send + 'static,
    {
        Self(Arc::new(IterableInner(Mutex::new(Some(Box::new(iter))))))
    }

    /// Take the underlying iterator; `None` once consumed.
    pub fn take(&self) -> Option<ValueIter> {
        self.0.0.lock().take()
    }

    pub fn is_consumed(&self) -> bool {
        self.0.0.lock().is_none()
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<IterableInner>().map(Self)
    }
}

/// An asynchronous sequence that can be consumed once.
#[derive(Clone)]
pub struct AsyncIterable(Arc<AsyncIterableInner>);

struct AsyncIterableInner(Mutex<Option<ValueStream>>);

impl AsyncIterable {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Completion> + Send + 'static,
    {
        Self(Arc::new(AsyncIterableInner(Mutex::new(Some(stream.boxed())))))
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        Self::from_stream(futures::stream::iter(items.into_iter().map(Ok)))
    }

    pub fn take(&self) -> Option<ValueStream> {
        self.0.0.lock().take()
    }

    pub fn is_consumed(&self) -> bool {
        self.0.0.lock().is_none()
    }

    /// Drain every item.
    ///
    /// # Errors
    /// Returns the first thrown value, or a `TypeError` if already consumed.
    pub async fn collect(&self) -> Result<Vec<Value>, Value> {
        let mut stream = self
            .take()
            .ok_or_else(|| Value::type_error("iterable has already been consumed"))?;
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<AsyncIterableInner>().map(Self)
    }
}

/// A readable byte stream that can be consumed once.
#[derive(Clone)]
pub struct ByteStream(Arc<ByteStreamInner>);

struct ByteStreamInner(Mutex<Option<ByteChunks>>);

impl ByteStream {
    pub fn new<S>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Value>> + Send + 'static,
    {
        Self(Arc::new(ByteStreamInner(Mutex::new(Some(chunks.boxed())))))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(futures::stream::once(futures::future::ready(Ok(bytes.into()))))
    }

    pub fn empty() -> Self {
        Self::new(futures::stream::empty())
    }

    pub fn take(&self) -> Option<ByteChunks> {
        self.0.0.lock().take()
    }

    pub fn is_consumed(&self) -> bool {
        self.0.0.lock().is_none()
    }

    /// Concatenate every chunk.
    ///
    /// # Errors
    /// Fails with a `RangeError` once more than `limit` bytes arrive, with the
    /// stream's own error, or with a `TypeError` if already consumed.
    pub async fn read_all(&self, limit: usize) -> Result<Bytes, Value> {
        let mut chunks = self
            .take()
            .ok_or_else(|| Value::type_error("stream has already been consumed"))?;
        let mut out = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if out.len() + chunk.len() > limit {
                return Err(Value::error(
                    "RangeError",
                    format!("stream exceeds {limit} bytes"),
                ));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<ByteStreamInner>().map(Self)
    }
}

impl fmt::Debug for Iterable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[iterable]")
    }
}

impl fmt::Debug for AsyncIterable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[async iterable]")
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[readable stream]")
    }
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<ByteStream>,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: ByteStream) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<ByteStream>,
}

impl Response {
    pub const fn ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Read the whole body as UTF-8 text.
    ///
    /// # Errors
    /// Fails like [`ByteStream::read_all`], or with a `TypeError` for invalid
    /// UTF-8.
    pub async fn text(&self, limit: usize) -> Result<String, Value> {
        let bytes = match &self.body {
            Some(body) => body.read_all(limit).await?,
            None => Bytes::new(),
        };
        String::from_utf8(bytes.to_vec()).map_err(|e| Value::type_error(e.to_string()))
    }
}
