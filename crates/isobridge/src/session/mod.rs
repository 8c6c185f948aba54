//! Host side of a sandbox session.
//!
//! [`SandboxedExecutionHost`] lazily launches a sandbox, performs the init
//! handshake and then multiplexes evaluations, RPC traffic, console relay,
//! fetch and websocket forwarding over the one transport.

mod fetch;

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{Instrument, Level, debug, enabled, info, info_span, trace, warn};

use crate::{
    channel::RemoteObjectChannel,
    config::{HostConfig, Marshalling},
    dom::Rect,
    error::{Error, Result, SessionError},
    host::{ConsoleSink, Host, trace_console},
    marshal::SerializationContext,
    message::{
        ConsoleMessage, EvalReply, EvalRequest, INIT_ACK, INIT_PROBE, Message, PresentVisual,
        PresentVisualReply,
    },
    transport::{FrameSender, Launcher, decode_message},
    value::Value,
    websocket::WebSocketForwardingService,
};

/// Lifecycle of the current session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Loading,
    Handshaking,
    Ready,
    /// The last session failed or was shut down; the next request starts a
    /// fresh one.
    TornDown,
}

type Establishing = Shared<BoxFuture<'static, core::result::Result<Arc<Session>, SessionError>>>;

enum Slot {
    Empty,
    Establishing { generation: u64, setup: Establishing },
    Ready(Arc<Session>),
}

/// State shared with establishment tasks; updates from a superseded
/// generation are ignored.
struct StateCell(Mutex<(u64, SessionState)>);

impl StateCell {
    fn set(&self, generation: u64, state: SessionState) {
        let mut current = self.0.lock();
        if current.0 == generation {
            current.1 = state;
        }
    }

    fn begin(&self) -> u64 {
        let mut current = self.0.lock();
        current.0 += 1;
        current.1 = SessionState::Loading;
        current.0
    }

    fn get(&self) -> SessionState {
        self.0.lock().1
    }
}

/// Runs scripts in a sandbox reached only through a frame transport.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct SandboxedExecutionHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    host: Arc<dyn Host>,
    launcher: Arc<dyn Launcher>,
    config: HostConfig,
    slot: Mutex<Slot>,
    state: Arc<StateCell>,
}

impl SandboxedExecutionHost {
    pub fn new<H, L>(host: H, launcher: L, config: HostConfig) -> Self
    where
        H: Host,
        L: Launcher,
    {
        Self {
            inner: Arc::new(HostInner {
                host: Arc::new(host),
                launcher: Arc::new(launcher),
                config,
                slot: Mutex::new(Slot::Empty),
                state: Arc::new(StateCell(Mutex::new((0, SessionState::Uninitialized)))),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        if let Slot::Ready(session) = &*self.inner.slot.lock()
            && session.is_closed()
        {
            return SessionState::TornDown;
        }
        self.inner.state.get()
    }

    /// Evaluate `script` in the sandbox.
    ///
    /// `globals` is made available to the script; `global_index` is passed
    /// through untouched. Console output of this evaluation goes to `console`
    /// when given, otherwise to the `isobridge::script` tracing target.
    ///
    /// # Errors
    /// Fails when the session cannot be established, when raw marshalling
    /// meets a value that needs a handle, when the session closes first, or
    /// with [`Error::Eval`] when the script throws.
    pub async fn exec_script_isolated(
        &self,
        script: &str,
        globals: &Value,
        global_index: Option<u32>,
        console: Option<Arc<dyn ConsoleSink>>,
    ) -> Result<Value> {
        let session = self.session().await?;
        let globals = match self.inner.config.marshalling {
            Marshalling::Structural => session.channel.serialize(globals),
            Marshalling::Raw => session.channel.context().serialize_raw(globals)?,
        };
        let key = session.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        session.evals.lock().insert(
            key,
            PendingEval {
                reply: tx,
                console,
            },
        );
        let span = info_span!("eval", key, context = %session.channel.context().id());
        async {
            debug!("sending eval");
            let sent = session.frames.try_send(&Message::Eval(EvalRequest {
                key,
                script: script.to_string(),
                globals,
                global_index,
            }));
            if let Err(e) = sent {
                session.evals.lock().remove(&key);
                return Err(e);
            }
            rx.await.unwrap_or(Err(Error::ChannelClosed))
        }
        .instrument(span)
        .await
    }

    /// Ask the sandbox to move the node behind `dom_access_key` onto the
    /// surface for `context_marker`.
    ///
    /// Returns `None` when the key does not resolve in the sandbox.
    ///
    /// # Errors
    /// Fails when the session cannot be established or closes first.
    pub async fn present_visual(
        &self,
        dom_access_key: &str,
        context_marker: &str,
    ) -> Result<Option<Rect>> {
        let session = self.session().await?;
        let call_key = session.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        session.visuals.lock().insert(call_key, tx);
        let sent = session.frames.try_send(&Message::PresentVisual(PresentVisual {
            dom_access_key: dom_access_key.to_string(),
            context_marker: context_marker.to_string(),
            call_key,
        }));
        if let Err(e) = sent {
            session.visuals.lock().remove(&call_key);
            return Err(e);
        }
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Close the current session, rejecting everything outstanding.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.inner.slot.lock(), Slot::Empty);
        let generation = self.inner.state.begin();
        self.inner.state.set(generation, SessionState::TornDown);
        if let Slot::Ready(session) = previous {
            session.close();
        }
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let (generation, setup) = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Ready(session) if !session.is_closed() => return Ok(session.clone()),
                Slot::Establishing { generation, setup } => (*generation, setup.clone()),
                Slot::Ready(_) | Slot::Empty => {
                    let generation = self.inner.state.begin();
                    let setup = self.spawn_establish(generation);
                    *slot = Slot::Establishing {
                        generation,
                        setup: setup.clone(),
                    };
                    (generation, setup)
                }
            }
        };

        let outcome = setup.await;
        let mut slot = self.inner.slot.lock();
        let current = matches!(&*slot, Slot::Establishing { generation: g, .. } if *g == generation);
        match outcome {
            Ok(session) => {
                if current {
                    *slot = Slot::Ready(session.clone());
                }
                Ok(session)
            }
            Err(e) => {
                if current {
                    *slot = Slot::Empty;
                }
                Err(e.into())
            }
        }
    }

    fn spawn_establish(&self, generation: u64) -> Establishing {
        let host = self.inner.host.clone();
        let launcher = self.inner.launcher.clone();
        let config = self.inner.config.clone();
        let state = self.inner.state.clone();
        let span = info_span!("establish", generation);
        let task = tokio::spawn(
            async move {
                let deadline = config.session.handshake_deadline;
                let outcome = timeout(
                    deadline,
                    establish(host, launcher.as_ref(), config, &state, generation),
                )
                .await
                .unwrap_or(Err(SessionError::HandshakeTimeout(deadline)));
                match &outcome {
                    Ok(_) => {
                        info!("sandbox session ready");
                        state.set(generation, SessionState::Ready);
                    }
                    Err(e) => {
                        warn!(error = %e, "sandbox session failed");
                        state.set(generation, SessionState::TornDown);
                    }
                }
                outcome
            }
            .instrument(span),
        );
        async move {
            task.await
                .unwrap_or_else(|e| Err(SessionError::Launch(format!("setup task failed: {e}"))))
        }
        .boxed()
        .shared()
    }
}

async fn establish(
    host: Arc<dyn Host>,
    launcher: &dyn Launcher,
    config: HostConfig,
    state: &StateCell,
    generation: u64,
) -> core::result::Result<Arc<Session>, SessionError> {
    let transport = launcher
        .launch(&config.session.origin)
        .await
        .map_err(|e| SessionError::Launch(e.to_string()))?;
    state.set(generation, SessionState::Handshaking);

    let (tx, mut rx) = transport.into_parts();
    let frames = FrameSender::new(tx);
    let mut probe = interval(config.session.probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = probe.tick() => {
                if !frames.send(&Message::Init(INIT_PROBE.to_string())) {
                    return Err(SessionError::TransportClosed);
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    return Err(SessionError::TransportClosed);
                };
                match decode_message(&frame) {
                    Ok(Message::Init(token)) if token == INIT_ACK => break,
                    Ok(message) => debug!(kind = message.kind(), "ignoring message before handshake"),
                    Err(e) => warn!(error = %e, len = frame.len(), "dropping undecodable frame"),
                }
            }
        }
    }
    debug!("handshake acknowledged");
    Ok(Session::start(host, config, frames, rx))
}

struct PendingEval {
    reply: oneshot::Sender<Result<Value>>,
    console: Option<Arc<dyn ConsoleSink>>,
}

/// One established sandbox connection.
pub(crate) struct Session {
    channel: RemoteObjectChannel,
    frames: FrameSender,
    next_key: AtomicU64,
    evals: Mutex<HashMap<u64, PendingEval>>,
    visuals: Mutex<HashMap<u64, oneshot::Sender<Option<Rect>>>>,
    sockets: WebSocketForwardingService,
    host: Arc<dyn Host>,
    config: HostConfig,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn start(
        host: Arc<dyn Host>,
        config: HostConfig,
        frames: FrameSender,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Arc<Self> {
        let context = SerializationContext::new(config.context.clone());
        let rpc_frames = frames.clone();
        let channel = RemoteObjectChannel::new(context, move |envelope| {
            rpc_frames.send(&Message::Rpc(envelope));
        });
        let event_frames = frames.clone();
        let sockets = WebSocketForwardingService::new(host.clone(), move |event| {
            event_frames.send(&Message::WebSocketEvent(event));
        });

        let session = Arc::new(Self {
            channel,
            frames,
            next_key: AtomicU64::new(0),
            evals: Mutex::new(HashMap::new()),
            visuals: Mutex::new(HashMap::new()),
            sockets,
            host,
            config,
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let span = info_span!("session", context = %session.channel.context().id());
        let reader = tokio::spawn(read_loop(Arc::downgrade(&session), rx).instrument(span));
        *session.reader.lock() = Some(reader);
        session
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.frames.is_closed()
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::EvalReply(reply) => self.on_eval_reply(reply),
            Message::Rpc(envelope) => self.channel.on_receive_message(envelope),
            Message::Console(console) => self.on_console(console),
            Message::Fetch(request) => self.forward_fetch(request),
            Message::WebSocketForwarder(command) => self.sockets.handle(command),
            Message::PresentVisualReply(PresentVisualReply { call_key, bounds }) => {
                match self.visuals.lock().remove(&call_key) {
                    Some(reply) => {
                        let _ = reply.send(bounds);
                    }
                    None => warn!(call_key, "dropping presentation reply for unknown call"),
                }
            }
            Message::Init(_) => debug!("ignoring late handshake reply"),
            other => warn!(kind = other.kind(), "unexpected message from sandbox"),
        }
    }

    fn on_eval_reply(&self, reply: EvalReply) {
        let Some(pending) = self.evals.lock().remove(&reply.key) else {
            warn!(key = reply.key, "dropping eval reply for unknown key");
            return;
        };
        let outcome = if reply.success {
            Ok(self.channel.deserialize(&reply.result))
        } else {
            let error = reply.error.unwrap_or_default();
            Err(Error::Eval {
                error: self.channel.deserialize(&error),
            })
        };
        let _ = pending.reply.send(outcome);
    }

    fn on_console(&self, message: ConsoleMessage) {
        let args = self.channel.context().deserialize_all(&message.args);
        let sink = self
            .evals
            .lock()
            .get(&message.key)
            .and_then(|pending| pending.console.clone());
        match sink {
            Some(sink) => sink.on_console(message.level, &args),
            None => trace_console(message.level, &args),
        }
    }

    /// Reject everything outstanding and release every exported handle.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.close();
        let evals = std::mem::take(&mut *self.evals.lock());
        for (_, pending) in evals {
            let _ = pending.reply.send(Err(Error::ChannelClosed));
        }
        self.visuals.lock().clear();
        self.sockets.close_all();
        self.channel.context().teardown();
        debug!("session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        self.close();
    }
}

async fn read_loop(session: Weak<Session>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if enabled!(Level::TRACE)
            && let Ok(json) = isobridge_cbor::frame_to_json(&frame)
        {
            trace!(frame = %json, "frame from sandbox");
        }
        let message = match decode_message(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping undecodable frame");
                continue;
            }
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        session.dispatch(message);
    }
    debug!("sandbox transport closed");
    if let Some(session) = session.upgrade() {
        session.close();
    }
}
