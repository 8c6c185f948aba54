use http::{Method, Uri};
use opentelemetry_semantic_conventions::attribute as trace;
use tracing::{Span, field::Empty};

fn server_port(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("http" | "ws") => 80,
        Some("https" | "wss") => 443,
        _ => 0,
    })
}

/// Client span for an outbound request made on behalf of a script.
pub fn request_span(name: &'static str, method: &Method, uri: &Uri) -> Span {
    tracing::info_span!(
        target: "isobridge_request",
        "request",
        otel.name = name,
        otel.kind = "client",
        { trace::HTTP_REQUEST_METHOD } = method.as_str(),
        { trace::SERVER_ADDRESS } = uri.host().unwrap_or_default(),
        { trace::SERVER_PORT } = server_port(uri),
        { trace::URL_FULL } = uri.to_string(),
        { trace::HTTP_RESPONSE_STATUS_CODE } = Empty,
        { trace::HTTP_RESPONSE_BODY_SIZE } = Empty,
        { trace::OTEL_STATUS_CODE } = Empty,
    )
}
