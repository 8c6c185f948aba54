//! Frame transport between a host and a sandbox.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    error::{Error, Result},
    host::BoxError,
    message::Message,
};

/// A bidirectional stream of frames.
///
/// Closing happens by dropping: once either half is gone the peer's
/// receiver ends.
pub struct Transport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Transport {
    pub const fn new(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { tx, rx }
    }

    /// Two connected in-process ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    pub fn into_parts(self) -> (mpsc::UnboundedSender<Bytes>, mpsc::UnboundedReceiver<Bytes>) {
        (self.tx, self.rx)
    }
}

/// Creates the sandbox for a new session.
#[async_trait::async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, origin: &str) -> Result<Transport, BoxError>;
}

#[async_trait::async_trait]
impl<T: Launcher + ?Sized> Launcher for std::sync::Arc<T> {
    async fn launch(&self, origin: &str) -> Result<Transport, BoxError> {
        (**self).launch(origin).await
    }
}

/// Encodes messages onto a transport.
#[derive(Clone)]
pub(crate) struct FrameSender(mpsc::UnboundedSender<Bytes>);

impl FrameSender {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self(tx)
    }

    pub(crate) fn try_send(&self, message: &Message) -> Result<()> {
        let frame = isobridge_cbor::encode_frame(message)?;
        self.0.send(frame).map_err(|_| Error::ChannelClosed)
    }

    /// `false` when the frame could not be encoded or the peer is gone.
    pub(crate) fn send(&self, message: &Message) -> bool {
        match self.try_send(message) {
            Ok(()) => true,
            Err(Error::ChannelClosed) => false,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to send frame");
                false
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

pub(crate) fn decode_message(frame: &[u8]) -> Result<Message> {
    Ok(isobridge_cbor::decode_frame(frame)?)
}
