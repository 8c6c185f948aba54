//! Value marshalling and remote-object RPC between a host and an isolated
//! script sandbox.

mod channel;
pub mod config;
pub mod dom;
pub mod error;
pub mod host;
mod marshal;
pub mod message;
pub mod sandbox;
mod session;
pub mod transport;
pub mod value;
mod websocket;
pub mod wire;

pub use channel::{RemoteObjectChannel, RpcEnvelope};
pub use config::{
    ContextConfig, HostConfig, Marshalling, Retention, SandboxConfig, SessionConfig, StreamConfig,
};
pub use dom::{ContextGroup, Node, NodeKind, NodeRegistry, Rect, RemoteNode};
pub use error::{Error, Result, SessionError};
pub use host::{
    BoxError, BoxedStream, ConsoleLevel, ConsoleSink, Host, HttpBodyStream, HttpRequest,
    HttpResponse, OfflineHost, TRACE_TARGET_SCRIPT, WebSocketConnection, WebSocketMessage,
};
pub use marshal::{FunctionPrimitiveCache, SerializationContext};
pub use sandbox::{
    LocalLauncher, SandboxRuntime, SandboxWebSocket, Scope, Script, ScriptEngine, SocketEvent,
};
pub use session::{SandboxedExecutionHost, SessionState};
pub use transport::{Launcher, Transport};
pub use value::{Completion, Function, Object, Promise, Value};
pub use websocket::WebSocketForwardingService;
pub use wire::{Tagged, WireValue};
