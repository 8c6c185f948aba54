use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_body::Frame;
use isobridge::{
    BoxError, ConsoleLevel, Host, HttpRequest, HttpResponse, LocalLauncher, RemoteObjectChannel,
    RpcEnvelope, SandboxConfig, Scope, Script, SerializationContext, SocketEvent, Value,
    WebSocketConnection, WebSocketMessage,
    value::{Object, Request},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

/// Evaluates a handful of commands standing in for a script language.
///
/// - `return a+b+...`: sum of numeric terms
/// - `throw <message>`: throws a `TypeError`
/// - `log <text>`: logs `<text>` then returns undefined
/// - `call <global> <n>...`: invokes a function found in globals
/// - `globals`: returns the globals record
/// - `fetch <url>`: fetches through the host and returns the body text
/// - `echo <url> <text>`: sends `<text>` over a websocket and returns the reply
/// - `hang`: never settles
pub async fn evaluate(script: Script, scope: Scope) -> Result<Value, Value> {
    let text = script.text.trim();
    let (command, rest) = text.split_once(' ').unwrap_or((text, ""));
    match command {
        "return" => {
            let mut sum = 0.0;
            for term in rest.split('+') {
                sum += term
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| Value::error("SyntaxError", e.to_string()))?;
            }
            Ok(Value::Number(sum))
        }
        "throw" => Err(Value::type_error(rest)),
        "log" => {
            scope.log(&[Value::from(rest)]);
            scope.console(ConsoleLevel::Warn, &[Value::from("done")]);
            Ok(Value::Undefined)
        }
        "call" => {
            let mut words = rest.split_whitespace();
            let name = words.next().unwrap_or_default();
            let globals = script
                .globals
                .as_object()
                .cloned()
                .ok_or_else(|| Value::type_error("globals is not an object"))?;
            let target = globals.get(name);
            let function = target
                .as_function()
                .ok_or_else(|| Value::type_error(format!("{name} is not a function")))?;
            let args = words
                .filter_map(|w| w.parse::<f64>().ok())
                .map(Value::Number)
                .collect();
            function.call(Value::Object(globals.clone()), args).await
        }
        "globals" => Ok(script.globals),
        "fetch" => {
            let response = scope.fetch(Request::get(rest)).await?;
            let body = response.text(1024 * 1024).await?;
            Ok(Value::Object(Object::from_entries([
                ("status", Value::from(u32::from(response.status))),
                ("body", Value::from(body)),
            ])))
        }
        "echo" => {
            let (url, message) = rest.split_once(' ').unwrap_or((rest, ""));
            let mut socket = scope.websocket(url, &[]);
            match socket.next_event().await {
                Some(SocketEvent::Open) => {}
                other => return Err(Value::type_error(format!("unexpected {other:?}"))),
            }
            socket.send(WebSocketMessage::Text(message.to_string()));
            let reply = match socket.next_event().await {
                Some(SocketEvent::Message(WebSocketMessage::Text(text))) => text,
                other => return Err(Value::type_error(format!("unexpected {other:?}"))),
            };
            socket.close(Some(1000), "bye");
            Ok(Value::from(reply))
        }
        "hang" => futures::future::pending().await,
        _ => Err(Value::error("SyntaxError", format!("unknown command {command}"))),
    }
}

pub fn launcher() -> LocalLauncher {
    LocalLauncher::new(evaluate, SandboxConfig::default())
}

/// A host that answers fetches from a fixed table and echoes websockets.
#[derive(Clone, Default)]
pub struct FakeHost {
    pub routes: Arc<Mutex<HashMap<String, (u16, &'static str)>>>,
    pub requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl FakeHost {
    pub fn route(self, uri: &str, status: u16, body: &'static str) -> Self {
        self.routes.lock().insert(uri.to_string(), (status, body));
        self
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn http_request(&self, req: HttpRequest) -> Result<HttpResponse, BoxError> {
        let route = self.routes.lock().get(&req.uri.to_string()).copied();
        self.requests.lock().push(req);
        let (status, body) = route.ok_or("no route")?;
        let frames = futures::stream::iter([Ok::<_, BoxError>(Frame::data(Bytes::from_static(
            body.as_bytes(),
        )))]);
        Ok(http::Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .body(Box::pin(frames) as isobridge::HttpBodyStream)?)
    }

    async fn connect_websocket(
        &self,
        _url: &str,
        _protocols: &[String],
    ) -> Result<WebSocketConnection, BoxError> {
        let (outgoing, mut from_sandbox) = mpsc::channel::<WebSocketMessage>(8);
        let (to_sandbox, incoming) = mpsc::channel::<Result<WebSocketMessage, BoxError>>(8);
        tokio::spawn(async move {
            while let Some(message) = from_sandbox.recv().await {
                let close = matches!(message, WebSocketMessage::Close { .. });
                let reply = match message {
                    WebSocketMessage::Text(text) => WebSocketMessage::Text(format!("echo: {text}")),
                    other => other,
                };
                if to_sandbox.send(Ok(reply)).await.is_err() || close {
                    break;
                }
            }
        });
        Ok(WebSocketConnection {
            outgoing,
            incoming: Box::pin(ReceiverStream::new(incoming)),
        })
    }
}

/// Two channels wired back to back; counts every envelope sent.
pub fn linked(
    a: SerializationContext,
    b: SerializationContext,
) -> (RemoteObjectChannel, RemoteObjectChannel, Arc<AtomicUsize>) {
    let sent = Arc::new(AtomicUsize::new(0));
    let (to_a, to_a_rx) = mpsc::unbounded_channel::<Bytes>();
    let (to_b, to_b_rx) = mpsc::unbounded_channel::<Bytes>();
    let hook = |tx: mpsc::UnboundedSender<Bytes>, sent: Arc<AtomicUsize>| {
        move |envelope: RpcEnvelope| {
            sent.fetch_add(1, Ordering::SeqCst);
            if let Ok(frame) = isobridge_cbor::encode_frame(&envelope) {
                let _ = tx.send(frame);
            }
        }
    };
    let a = RemoteObjectChannel::new(a, hook(to_b, sent.clone()));
    let b = RemoteObjectChannel::new(b, hook(to_a, sent.clone()));
    for (channel, rx) in [(b.clone(), to_b_rx), (a.clone(), to_a_rx)] {
        let mut rx = UnboundedReceiverStream::new(rx);
        tokio::spawn(async move {
            while let Some(frame) = rx.next().await {
                if let Ok(envelope) = isobridge_cbor::decode_frame(&frame) {
                    channel.on_receive_message(envelope);
                }
            }
        });
    }
    (a, b, sent)
}

/// Let spawned tasks on the current runtime run to quiescence.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
