//! Messages exchanged between a host and its sandbox.
//!
//! Each message is one CBOR frame holding an externally tagged map, e.g.
//! `{"init": "ack"}` or `{"eval": {"key": 1, ...}}`.

use serde::{Deserialize, Serialize};

use crate::{channel::RpcEnvelope, dom::Rect, host::ConsoleLevel, wire::WireValue};

/// Handshake probe token sent by the host.
pub const INIT_PROBE: &str = "init";

/// Handshake reply token.
pub const INIT_ACK: &str = "ack";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Message {
    /// Handshake probe from the host, answered with [`INIT_ACK`].
    Init(String),
    Eval(EvalRequest),
    EvalReply(EvalReply),
    Rpc(RpcEnvelope),
    Console(ConsoleMessage),
    Fetch(FetchRequest),
    FetchReply(FetchReply),
    WebSocketForwarder(WebSocketCommand),
    WebSocketEvent(WebSocketEvent),
    PresentVisual(PresentVisual),
    PresentVisualReply(PresentVisualReply),
}

impl Message {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Eval(_) => "eval",
            Self::EvalReply(_) => "evalReply",
            Self::Rpc(_) => "rpc",
            Self::Console(_) => "console",
            Self::Fetch(_) => "fetch",
            Self::FetchReply(_) => "fetchReply",
            Self::WebSocketForwarder(_) => "webSocketForwarder",
            Self::WebSocketEvent(_) => "webSocketEvent",
            Self::PresentVisual(_) => "presentVisual",
            Self::PresentVisualReply(_) => "presentVisualReply",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRequest {
    pub key: u64,
    pub script: String,
    pub globals: WireValue,
    #[serde(default)]
    pub global_index: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalReply {
    pub key: u64,
    pub success: bool,
    #[serde(default)]
    pub result: WireValue,
    #[serde(default)]
    pub error: Option<WireValue>,
}

/// Console output produced while evaluating request `key`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    pub key: u64,
    pub level: ConsoleLevel,
    pub args: Vec<WireValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub key: u64,
    /// A serialized request value.
    pub request: WireValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReply {
    pub key: u64,
    pub success: bool,
    #[serde(default)]
    pub result: WireValue,
    #[serde(default)]
    pub error: Option<WireValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebSocketMethod {
    /// Args: url, then any protocols.
    New,
    /// Args: payload.
    Send,
    /// Args: optional code, optional reason.
    Close,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketCommand {
    pub key: String,
    pub method: WebSocketMethod,
    #[serde(default)]
    pub args: Vec<WireValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebSocketEventKind {
    Open,
    /// Data: payload.
    Message,
    /// Data: message.
    Error,
    /// Data: code, reason.
    Close,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketEvent {
    pub key: String,
    pub event: WebSocketEventKind,
    #[serde(default)]
    pub data: Vec<WireValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentVisual {
    pub dom_access_key: String,
    pub context_marker: String,
    pub call_key: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentVisualReply {
    pub call_key: u64,
    /// `None` when the access key did not resolve.
    #[serde(default)]
    pub bounds: Option<Rect>,
}
