use futures::{SinkExt, StreamExt};
use isobridge::{BoxError, WebSocketConnection, WebSocketMessage};
use opentelemetry_semantic_conventions::attribute as trace;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self, Message,
    client::IntoClientRequest,
    http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{Instrument, Span, debug};

use crate::Error;

const OUTGOING_BUFFER: usize = 32;

pub async fn websocket_impl(
    span: Span,
    url: &str,
    protocols: &[String],
) -> Result<WebSocketConnection, Error> {
    let mut request = url.into_client_request()?;
    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| Error::Internal(Box::new(e)))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let (conn, response) = match tokio_tungstenite::connect_async(request)
        .instrument(span.clone())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            span.record(trace::OTEL_STATUS_CODE, "ERROR");
            return Err(e.into());
        }
    };
    span.record(trace::HTTP_RESPONSE_STATUS_CODE, response.status().as_u16());

    let (mut tx, rx) = conn.split();
    let (outgoing, mut queue) = mpsc::channel::<WebSocketMessage>(OUTGOING_BUFFER);
    tokio::spawn(
        async move {
            while let Some(message) = queue.recv().await {
                let close = matches!(message, WebSocketMessage::Close { .. });
                if let Err(e) = tx.send(to_tungstenite(message)).await {
                    debug!(error = %e, "websocket send failed");
                    break;
                }
                if close {
                    break;
                }
            }
            let _ = tx.close().await;
            Span::current().record(trace::OTEL_STATUS_CODE, "OK");
        }
        .instrument(span),
    );

    let incoming = rx.filter_map(|m| async move {
        match m {
            Ok(m) => from_tungstenite(m).map(Ok),
            Err(e) => Some(Err(BoxError::from(e))),
        }
    });
    Ok(WebSocketConnection {
        outgoing,
        incoming: Box::pin(incoming),
    })
}

fn to_tungstenite(message: WebSocketMessage) -> Message {
    match message {
        WebSocketMessage::Text(text) => Message::Text(text.into()),
        WebSocketMessage::Binary(data) => Message::Binary(data),
        WebSocketMessage::Close { code, reason } => Message::Close(code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_tungstenite(message: Message) -> Option<WebSocketMessage> {
    match message {
        Message::Text(text) => Some(WebSocketMessage::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(WebSocketMessage::Binary(data)),
        Message::Close(frame) => Some(match frame {
            Some(frame) => WebSocketMessage::Close {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.as_str().to_owned(),
            },
            None => WebSocketMessage::Close {
                code: None,
                reason: String::new(),
            },
        }),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}
