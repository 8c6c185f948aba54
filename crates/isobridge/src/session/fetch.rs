use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use tokio::time::timeout;
use tracing::{Instrument, debug, info_span, warn};

use super::Session;
use crate::{
    host::{HttpRequest, HttpResponse},
    message::{FetchReply, FetchRequest, Message},
    value::{ByteStream, Request, Response, Value},
    wire::WireValue,
};

async fn collect_request_body(
    body: ByteStream,
    max_bytes: usize,
    read_timeout: Duration,
) -> Result<Option<Bytes>, Value> {
    let bytes = timeout(read_timeout, async {
        let mut chunks = body
            .take()
            .ok_or_else(|| Value::type_error("request body has already been consumed"))?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if buf.len().saturating_add(chunk.len()) > max_bytes {
                return Err(Value::type_error(format!(
                    "request body exceeds {max_bytes} bytes"
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok::<_, Value>(buf.freeze())
    })
    .await
    .map_err(|_e| Value::type_error("timed out reading request body"))??;

    Ok(if bytes.is_empty() { None } else { Some(bytes) })
}

fn to_http_request(request: &Request, body: Option<Bytes>) -> Result<HttpRequest, Value> {
    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|e| Value::type_error(format!("invalid method {}: {e}", request.method)))?;
    let uri: Uri = request
        .url
        .parse()
        .map_err(|e| Value::type_error(format!("invalid url {}: {e}", request.url)))?;
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "dropping invalid request header"),
        }
    }
    Ok(HttpRequest {
        method,
        uri,
        headers,
        body,
    })
}

fn from_http_response(url: String, response: HttpResponse) -> Response {
    let (parts, body) = response.into_parts();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
    let chunks = body.filter_map(|frame| async move {
        match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(e) => Some(Err(Value::type_error(format!("response body error: {e}")))),
        }
    });
    Response {
        status: parts.status.as_u16(),
        status_text: parts
            .status
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
        url,
        headers,
        body: Some(ByteStream::new(chunks)),
    }
}

impl Session {
    /// Perform a fetch on behalf of the sandbox and send the reply.
    pub(super) fn forward_fetch(self: &std::sync::Arc<Self>, request: FetchRequest) {
        let session = self.clone();
        let span = info_span!("fetch", key = request.key);
        tokio::spawn(
            async move {
                let context = session.channel.context();
                let outcome = match context.deserialize(&request.request) {
                    Value::Request(r) => session.perform_fetch(r).await,
                    other => Err(Value::type_error(format!(
                        "fetch expects a request, got {}",
                        other.kind()
                    ))),
                };
                let reply = match outcome {
                    Ok(response) => FetchReply {
                        key: request.key,
                        success: true,
                        result: context.serialize(&Value::Response(response)),
                        error: None,
                    },
                    Err(error) => {
                        debug!(error = %error.describe(), "fetch failed");
                        FetchReply {
                            key: request.key,
                            success: false,
                            result: WireValue::undefined(),
                            error: Some(context.serialize(&error)),
                        }
                    }
                };
                session.frames.send(&Message::FetchReply(reply));
            }
            .instrument(span),
        );
    }

    async fn perform_fetch(&self, request: Request) -> Result<Response, Value> {
        let body = match &request.body {
            Some(body) => {
                collect_request_body(
                    body.clone(),
                    self.config.max_request_body_bytes,
                    self.config.request_body_timeout,
                )
                .await?
            }
            None => None,
        };
        let http_request = to_http_request(&request, body)?;
        debug!(method = %http_request.method, uri = %http_request.uri, "forwarding fetch");
        let response = self
            .host
            .http_request(http_request)
            .await
            .map_err(|e| Value::type_error(format!("fetch failed: {e}")))?;
        Ok(from_http_response(request.url, response))
    }
}
