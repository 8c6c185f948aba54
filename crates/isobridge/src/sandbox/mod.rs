//! Sandbox side of a session.
//!
//! [`SandboxRuntime`] answers the init handshake, evaluates scripts through a
//! [`ScriptEngine`] and proxies network access back to the host. It talks to
//! the host only through a [`Transport`].

mod socket;

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info_span, warn};

pub use socket::{SandboxWebSocket, SocketEvent};

use crate::{
    channel::RemoteObjectChannel,
    config::SandboxConfig,
    dom::ContextGroup,
    host::{BoxError, ConsoleLevel},
    marshal::SerializationContext,
    message::{
        ConsoleMessage, EvalReply, EvalRequest, FetchReply, FetchRequest, INIT_ACK, Message,
        PresentVisual, PresentVisualReply, WebSocketCommand, WebSocketEvent, WebSocketEventKind,
        WebSocketMethod,
    },
    transport::{FrameSender, Launcher, Transport, decode_message},
    value::{Completion, Request, Response, Value},
    websocket::message_from_wire,
    wire::WireValue,
};

/// A script handed to a [`ScriptEngine`].
#[derive(Clone, Debug)]
pub struct Script {
    pub text: String,
    pub globals: Value,
    pub global_index: Option<u32>,
}

/// Evaluates scripts inside the sandbox.
#[async_trait::async_trait]
pub trait ScriptEngine: Send + Sync + 'static {
    async fn eval(&self, script: Script, scope: Scope) -> Completion;
}

#[async_trait::async_trait]
impl<F, Fut> ScriptEngine for F
where
    F: Fn(Script, Scope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Completion> + Send + 'static,
{
    async fn eval(&self, script: Script, scope: Scope) -> Completion {
        self(script, scope).await
    }
}

/// Capabilities of one evaluation.
#[derive(Clone)]
pub struct Scope {
    key: u64,
    runtime: Arc<RuntimeInner>,
}

impl Scope {
    pub fn context(&self) -> &SerializationContext {
        self.runtime.channel.context()
    }

    pub fn channel(&self) -> &RemoteObjectChannel {
        &self.runtime.channel
    }

    pub fn group(&self) -> &ContextGroup {
        &self.runtime.group
    }

    /// Relay console output to the host, attributed to this evaluation.
    pub fn console(&self, level: ConsoleLevel, args: &[Value]) {
        let args = self.runtime.channel.context().serialize_all(args);
        self.runtime.frames.send(&Message::Console(ConsoleMessage {
            key: self.key,
            level,
            args,
        }));
    }

    pub fn log(&self, args: &[Value]) {
        self.console(ConsoleLevel::Log, args);
    }

    /// Perform a request through the host's network stack.
    ///
    /// # Errors
    /// Rejects with the value the host reported, or with an `Error` if the
    /// session closed first.
    pub async fn fetch(&self, request: Request) -> Result<Response, Value> {
        let runtime = &self.runtime;
        let key = runtime.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        runtime.fetches.lock().insert(key, tx);
        let request = runtime.channel.serialize(&Value::Request(request));
        if !runtime
            .frames
            .send(&Message::Fetch(FetchRequest { key, request }))
        {
            runtime.fetches.lock().remove(&key);
            return Err(Value::type_error("fetch failed: sandbox transport closed"));
        }
        match rx.await {
            Ok(Ok(Value::Response(response))) => Ok(response),
            Ok(Ok(other)) => Err(Value::type_error(format!(
                "fetch resolved to {}",
                other.kind()
            ))),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Value::type_error("fetch failed: session closed")),
        }
    }

    /// Open a websocket through the host.
    pub fn websocket(&self, url: &str, protocols: &[&str]) -> SandboxWebSocket {
        let runtime = &self.runtime;
        let key = format!(
            "{}:ws#{}",
            runtime.channel.context().id(),
            runtime.next_key.fetch_add(1, Ordering::Relaxed) + 1
        );
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.sockets.lock().insert(key.clone(), tx);
        let mut args = vec![WireValue::from(url)];
        args.extend(protocols.iter().map(|p| WireValue::from(*p)));
        runtime
            .frames
            .send(&Message::WebSocketForwarder(WebSocketCommand {
                key: key.clone(),
                method: WebSocketMethod::New,
                args,
            }));
        SandboxWebSocket::new(key, runtime, rx)
    }
}

pub(crate) struct RuntimeInner {
    channel: RemoteObjectChannel,
    frames: FrameSender,
    group: ContextGroup,
    next_key: AtomicU64,
    fetches: Mutex<HashMap<u64, oneshot::Sender<Completion>>>,
    sockets: Mutex<HashMap<String, mpsc::UnboundedSender<SocketEvent>>>,
}

impl RuntimeInner {
    fn on_fetch_reply(&self, reply: FetchReply) {
        let Some(pending) = self.fetches.lock().remove(&reply.key) else {
            warn!(key = reply.key, "dropping fetch reply for unknown key");
            return;
        };
        let outcome = if reply.success {
            Ok(self.channel.deserialize(&reply.result))
        } else {
            Err(self.channel.deserialize(&reply.error.unwrap_or_default()))
        };
        let _ = pending.send(outcome);
    }

    fn on_socket_event(&self, event: WebSocketEvent) {
        let WebSocketEvent { key, event, data } = event;
        let event = match event {
            WebSocketEventKind::Open => SocketEvent::Open,
            WebSocketEventKind::Message => match data.first().and_then(message_from_wire) {
                Some(message) => SocketEvent::Message(message),
                None => {
                    warn!(socket = %key, "dropping websocket message without payload");
                    return;
                }
            },
            WebSocketEventKind::Error => SocketEvent::Error(
                data.first()
                    .and_then(WireValue::as_str)
                    .unwrap_or("websocket error")
                    .to_string(),
            ),
            WebSocketEventKind::Close => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let code = data.first().and_then(WireValue::as_f64).map(|c| c as u16);
                let reason = data
                    .get(1)
                    .and_then(WireValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(tx) = self.sockets.lock().remove(&key) {
                    let _ = tx.send(SocketEvent::Close { code, reason });
                }
                return;
            }
        };
        let Some(tx) = self.sockets.lock().get(&key).cloned() else {
            debug!(socket = %key, "event for unknown socket");
            return;
        };
        let _ = tx.send(event);
    }

    fn close(&self) {
        self.channel.close();
        self.fetches.lock().clear();
        self.sockets.lock().clear();
        self.channel.context().teardown();
    }
}

/// Sandbox-side message loop.
pub struct SandboxRuntime {
    engine: Arc<dyn ScriptEngine>,
    config: SandboxConfig,
    group: ContextGroup,
}

impl SandboxRuntime {
    pub fn new<E: ScriptEngine>(engine: E, config: SandboxConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            config,
            group: ContextGroup::new(),
        }
    }

    /// Share node access keys with the other contexts of `group`.
    #[must_use]
    pub fn with_group(mut self, group: ContextGroup) -> Self {
        self.group = group;
        self
    }

    /// Serve `transport` until the host goes away.
    pub async fn run(self, transport: Transport) {
        let (tx, mut rx) = transport.into_parts();
        let frames = FrameSender::new(tx);
        let context = SerializationContext::new(self.config.context.clone());
        self.group.join(context.nodes());
        let rpc_frames = frames.clone();
        let channel = RemoteObjectChannel::new(context, move |envelope| {
            rpc_frames.send(&Message::Rpc(envelope));
        });
        let runtime = Arc::new(RuntimeInner {
            channel,
            frames,
            group: self.group,
            next_key: AtomicU64::new(0),
            fetches: Mutex::new(HashMap::new()),
            sockets: Mutex::new(HashMap::new()),
        });

        while let Some(frame) = rx.recv().await {
            let message = match decode_message(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, len = frame.len(), "dropping undecodable frame");
                    continue;
                }
            };
            match message {
                Message::Init(_) => {
                    runtime.frames.send(&Message::Init(INIT_ACK.to_string()));
                }
                Message::Eval(request) => spawn_eval(&self.engine, &runtime, request),
                Message::Rpc(envelope) => runtime.channel.on_receive_message(envelope),
                Message::FetchReply(reply) => runtime.on_fetch_reply(reply),
                Message::WebSocketEvent(event) => runtime.on_socket_event(event),
                Message::PresentVisual(PresentVisual {
                    dom_access_key,
                    context_marker,
                    call_key,
                }) => {
                    let bounds = runtime.group.present(&dom_access_key, &context_marker);
                    if bounds.is_none() {
                        debug!(key = %dom_access_key, "presentation key did not resolve");
                    }
                    runtime
                        .frames
                        .send(&Message::PresentVisualReply(PresentVisualReply {
                            call_key,
                            bounds,
                        }));
                }
                other => warn!(kind = other.kind(), "unexpected message from host"),
            }
        }
        debug!("host transport closed");
        runtime.close();
    }
}

fn spawn_eval(engine: &Arc<dyn ScriptEngine>, runtime: &Arc<RuntimeInner>, request: EvalRequest) {
    let EvalRequest {
        key,
        script,
        globals,
        global_index,
    } = request;
    let engine = engine.clone();
    let scope = Scope {
        key,
        runtime: runtime.clone(),
    };
    let script = Script {
        text: script,
        globals: runtime.channel.deserialize(&globals),
        global_index,
    };
    let span = info_span!("sandbox_eval", key);
    tokio::spawn(
        async move {
            let runtime = scope.runtime.clone();
            let outcome = AssertUnwindSafe(engine.eval(script, scope))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Value::error("Error", "script engine panicked")));
            let reply = match outcome {
                Ok(value) => EvalReply {
                    key,
                    success: true,
                    result: runtime.channel.serialize(&value),
                    error: None,
                },
                Err(error) => {
                    debug!(error = %error.describe(), "script threw");
                    EvalReply {
                        key,
                        success: false,
                        result: WireValue::undefined(),
                        error: Some(runtime.channel.serialize(&error)),
                    }
                }
            };
            runtime.frames.send(&Message::EvalReply(reply));
        }
        .instrument(span),
    );
}

/// Starts a [`SandboxRuntime`] on its own task for every launch.
#[derive(Clone)]
pub struct LocalLauncher {
    engine: Arc<dyn ScriptEngine>,
    config: SandboxConfig,
    group: ContextGroup,
    launches: Arc<AtomicUsize>,
}

impl LocalLauncher {
    pub fn new<E: ScriptEngine>(engine: E, config: SandboxConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            config,
            group: ContextGroup::new(),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: ContextGroup) -> Self {
        self.group = group;
        self
    }

    /// Number of sandboxes started so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, origin: &str) -> Result<Transport, BoxError> {
        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let (host_end, sandbox_end) = Transport::pair();
        let runtime = SandboxRuntime {
            engine: self.engine.clone(),
            config: self.config.clone(),
            group: self.group.clone(),
        };
        tokio::spawn(
            runtime
                .run(sandbox_end)
                .instrument(info_span!("sandbox", %origin, launch)),
        );
        Ok(host_end)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{dom::Node, message::INIT_PROBE};

    fn frame(message: &Message) -> bytes::Bytes {
        isobridge_cbor::encode_frame(message).unwrap()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<bytes::Bytes>) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        isobridge_cbor::decode_frame(&frame).unwrap()
    }

    #[tokio::test]
    async fn answers_probe_and_evaluates() -> anyhow::Result<()> {
        let engine = |script: Script, _scope: Scope| async move {
            match script.text.as_str() {
                "throw" => Err(Value::type_error("boom")),
                _ => Ok(Value::from(script.text.len() as f64)),
            }
        };
        let (host_end, sandbox_end) = Transport::pair();
        tokio::spawn(SandboxRuntime::new(engine, SandboxConfig::default()).run(sandbox_end));
        let (tx, mut rx) = host_end.into_parts();

        tx.send(frame(&Message::Init(INIT_PROBE.to_string())))?;
        assert_eq!(recv(&mut rx).await, Message::Init(INIT_ACK.to_string()));

        tx.send(frame(&Message::Eval(EvalRequest {
            key: 1,
            script: "abc".to_string(),
            globals: WireValue::Null,
            global_index: None,
        })))?;
        let Message::EvalReply(reply) = recv(&mut rx).await else {
            anyhow::bail!("expected eval reply");
        };
        assert!(reply.success);
        assert_eq!(reply.result, WireValue::Number(3.0));

        tx.send(frame(&Message::Eval(EvalRequest {
            key: 2,
            script: "throw".to_string(),
            globals: WireValue::Null,
            global_index: None,
        })))?;
        let Message::EvalReply(reply) = recv(&mut rx).await else {
            anyhow::bail!("expected eval reply");
        };
        assert!(!reply.success);
        assert!(reply.error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn panicking_engine_replies_with_error() -> anyhow::Result<()> {
        let engine = |_: Script, _: Scope| async move {
            if true {
                panic!("engine bug");
            }
            Ok::<_, Value>(Value::Undefined)
        };
        let (host_end, sandbox_end) = Transport::pair();
        tokio::spawn(SandboxRuntime::new(engine, SandboxConfig::default()).run(sandbox_end));
        let (tx, mut rx) = host_end.into_parts();
        tx.send(frame(&Message::Eval(EvalRequest {
            key: 7,
            script: String::new(),
            globals: WireValue::Null,
            global_index: None,
        })))?;
        let Message::EvalReply(reply) = recv(&mut rx).await else {
            anyhow::bail!("expected eval reply");
        };
        assert_eq!(reply.key, 7);
        assert!(!reply.success);
        Ok(())
    }

    #[tokio::test]
    async fn presents_nodes_from_group() -> anyhow::Result<()> {
        let group = ContextGroup::new();
        let sibling = SerializationContext::default();
        group.join(sibling.nodes());
        let node = Node::element("canvas");
        node.set_bounds(crate::dom::Rect::new(0.0, 0.0, 30.0, 20.0));
        let wire = sibling.serialize(&Value::from(node.clone()));
        let key = match wire.as_tagged() {
            Some(crate::wire::Tagged::DomNode(dom)) => dom.handle.clone(),
            _ => anyhow::bail!("expected a dom node"),
        };

        let engine = |_: Script, _: Scope| async move { Ok::<_, Value>(Value::Undefined) };
        let (host_end, sandbox_end) = Transport::pair();
        tokio::spawn(
            SandboxRuntime::new(engine, SandboxConfig::default())
                .with_group(group.clone())
                .run(sandbox_end),
        );
        let (tx, mut rx) = host_end.into_parts();
        tx.send(frame(&Message::PresentVisual(PresentVisual {
            dom_access_key: key,
            context_marker: "cell-1".to_string(),
            call_key: 1,
        })))?;
        let Message::PresentVisualReply(reply) = recv(&mut rx).await else {
            anyhow::bail!("expected presentation reply");
        };
        assert_eq!(reply.bounds.map(|b| b.width), Some(30.0));
        assert!(group.surface("cell-1").children()[0].ptr_eq(&node));
        Ok(())
    }
}
