//! Host side of sandboxed websockets.
//!
//! The sandbox cannot open sockets itself; it sends `new`, `send` and `close`
//! commands keyed by a socket id, and the host relays connection events back.

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    host::{Host, WebSocketConnection, WebSocketMessage},
    message::{WebSocketCommand, WebSocketEvent, WebSocketEventKind, WebSocketMethod},
    wire::{Tagged, WireValue},
};

type EventSink = Arc<dyn Fn(WebSocketEvent) + Send + Sync>;

enum Slot {
    /// `new` was received and the host is still connecting.
    Connecting,
    /// Frames queued here reach the socket in order through one writer task.
    Open(mpsc::UnboundedSender<WebSocketMessage>),
}

#[derive(Clone)]
pub struct WebSocketForwardingService {
    host: Arc<dyn Host>,
    sockets: Arc<Mutex<HashMap<String, Slot>>>,
    events: EventSink,
}

impl WebSocketForwardingService {
    pub fn new<F>(host: Arc<dyn Host>, events: F) -> Self
    where
        F: Fn(WebSocketEvent) + Send + Sync + 'static,
    {
        Self {
            host,
            sockets: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(events),
        }
    }

    pub fn handle(&self, command: WebSocketCommand) {
        let WebSocketCommand { key, method, args } = command;
        match method {
            WebSocketMethod::New => {
                let Some(url) = args.first().and_then(WireValue::as_str) else {
                    self.emit(&key, WebSocketEventKind::Error, vec!["missing url".into()]);
                    self.emit(&key, WebSocketEventKind::Close, Vec::new());
                    return;
                };
                let protocols = args
                    .iter()
                    .skip(1)
                    .filter_map(WireValue::as_str)
                    .map(str::to_string)
                    .collect();
                self.open(key, url.to_string(), protocols);
            }
            WebSocketMethod::Send => match args.first().and_then(message_from_wire) {
                Some(message) => self.forward(&key, message),
                None => warn!(socket = %key, "ignoring send without a text or binary payload"),
            },
            WebSocketMethod::Close => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let code = args
                    .first()
                    .and_then(WireValue::as_f64)
                    .filter(|c| (0.0..=f64::from(u16::MAX)).contains(c))
                    .map(|c| c as u16);
                let reason = args
                    .get(1)
                    .and_then(WireValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.close(&key, code, reason);
            }
        }
    }

    /// Number of sockets that are open or still connecting.
    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every socket; their connections close.
    pub fn close_all(&self) {
        self.sockets.lock().clear();
    }

    fn open(&self, key: String, url: String, protocols: Vec<String>) {
        self.sockets.lock().insert(key.clone(), Slot::Connecting);
        let service = self.clone();
        let span = info_span!("websocket", socket = %key, %url);
        tokio::spawn(
            async move {
                let connection = match service.host.connect_websocket(&url, &protocols).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(error = %e, "websocket connect failed");
                        service.sockets.lock().remove(&key);
                        service.emit(&key, WebSocketEventKind::Error, vec![e.to_string().into()]);
                        service.emit(&key, WebSocketEventKind::Close, Vec::new());
                        return;
                    }
                };
                let WebSocketConnection { outgoing, incoming } = connection;

                let (queue, pending) = mpsc::unbounded_channel();
                let opened = {
                    let mut sockets = service.sockets.lock();
                    match sockets.get_mut(&key) {
                        Some(slot) if matches!(slot, Slot::Connecting) => {
                            *slot = Slot::Open(queue);
                            true
                        }
                        _ => false,
                    }
                };
                if !opened {
                    debug!("socket closed while connecting");
                    let _ = outgoing
                        .send(WebSocketMessage::Close {
                            code: None,
                            reason: String::new(),
                        })
                        .await;
                    service.emit(&key, WebSocketEventKind::Close, Vec::new());
                    return;
                }
                tokio::spawn(
                    write_frames(service.clone(), key.clone(), outgoing, pending)
                        .in_current_span(),
                );
                service.emit(&key, WebSocketEventKind::Open, Vec::new());

                let mut incoming = incoming;
                let mut close = (None, String::new());
                while let Some(frame) = incoming.next().await {
                    match frame {
                        Ok(WebSocketMessage::Close { code, reason }) => {
                            close = (code, reason);
                            break;
                        }
                        Ok(message) => service.emit(
                            &key,
                            WebSocketEventKind::Message,
                            vec![message_to_wire(message)],
                        ),
                        Err(e) => {
                            service.emit(&key, WebSocketEventKind::Error, vec![e.to_string().into()]);
                            break;
                        }
                    }
                }
                service.sockets.lock().remove(&key);
                let (code, reason) = close;
                service.emit(
                    &key,
                    WebSocketEventKind::Close,
                    vec![
                        code.map_or(WireValue::Null, |c| WireValue::Number(f64::from(c))),
                        reason.into(),
                    ],
                );
                debug!("websocket closed");
            }
            .instrument(span),
        );
    }

    fn forward(&self, key: &str, message: WebSocketMessage) {
        let sent = match self.sockets.lock().get(key) {
            Some(Slot::Open(queue)) => queue.send(message).is_ok(),
            _ => false,
        };
        if !sent {
            self.emit(key, WebSocketEventKind::Error, vec!["socket is not open".into()]);
        }
    }

    fn close(&self, key: &str, code: Option<u16>, reason: String) {
        match self.sockets.lock().remove(key) {
            Some(Slot::Open(queue)) => {
                let _ = queue.send(WebSocketMessage::Close { code, reason });
            }
            Some(Slot::Connecting) => debug!(socket = %key, "close while connecting"),
            None => debug!(socket = %key, "close for unknown socket"),
        }
    }

    fn emit(&self, key: &str, event: WebSocketEventKind, data: Vec<WireValue>) {
        (self.events)(WebSocketEvent {
            key: key.to_string(),
            event,
            data,
        });
    }
}

async fn write_frames(
    service: WebSocketForwardingService,
    key: String,
    outgoing: mpsc::Sender<WebSocketMessage>,
    mut pending: mpsc::UnboundedReceiver<WebSocketMessage>,
) {
    while let Some(message) = pending.recv().await {
        let close = matches!(message, WebSocketMessage::Close { .. });
        if outgoing.send(message).await.is_err() {
            service.emit(&key, WebSocketEventKind::Error, vec!["socket is closed".into()]);
            break;
        }
        if close {
            break;
        }
    }
}

pub(crate) fn message_to_wire(message: WebSocketMessage) -> WireValue {
    match message {
        WebSocketMessage::Text(text) => WireValue::String(text),
        WebSocketMessage::Binary(data) => WireValue::tagged(Tagged::Bytes { data }),
        WebSocketMessage::Close { reason, .. } => WireValue::String(reason),
    }
}

pub(crate) fn message_from_wire(wire: &WireValue) -> Option<WebSocketMessage> {
    match wire {
        WireValue::String(text) => Some(WebSocketMessage::Text(text.clone())),
        WireValue::Tagged(tagged) => match tagged.as_ref() {
            Tagged::Bytes { data } => Some(WebSocketMessage::Binary(data.clone())),
            _ => None,
        },
        _ => None,
    }
}
