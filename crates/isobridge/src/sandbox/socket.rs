use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use super::RuntimeInner;
use crate::{
    host::WebSocketMessage,
    message::{Message, WebSocketCommand, WebSocketMethod},
    websocket::message_to_wire,
    wire::WireValue,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(WebSocketMessage),
    Error(String),
    Close { code: Option<u16>, reason: String },
}

/// A websocket opened by a script; the host holds the real connection.
pub struct SandboxWebSocket {
    key: String,
    runtime: Weak<RuntimeInner>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SandboxWebSocket {
    pub(super) fn new(
        key: String,
        runtime: &Arc<RuntimeInner>,
        events: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self {
            key,
            runtime: Arc::downgrade(runtime),
            events,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queue a text or binary message; close frames go through
    /// [`SandboxWebSocket::close`].
    pub fn send(&self, message: WebSocketMessage) -> bool {
        self.command(WebSocketMethod::Send, vec![message_to_wire(message)])
    }

    pub fn close(&self, code: Option<u16>, reason: &str) -> bool {
        self.command(
            WebSocketMethod::Close,
            vec![
                code.map_or(WireValue::Null, |c| WireValue::Number(f64::from(c))),
                reason.into(),
            ],
        )
    }

    /// The next lifecycle event; `None` after the socket closed.
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    fn command(&self, method: WebSocketMethod, args: Vec<WireValue>) -> bool {
        let Some(runtime) = self.runtime.upgrade() else {
            return false;
        };
        runtime
            .frames
            .send(&Message::WebSocketForwarder(WebSocketCommand {
                key: self.key.clone(),
                method,
                args,
            }))
    }
}

impl Drop for SandboxWebSocket {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade()
            && runtime.sockets.lock().remove(&self.key).is_some()
        {
            self.close(None, "");
        }
    }
}
