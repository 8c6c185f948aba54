//! Call/return protocol between two serialization contexts.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, debug_span, warn};

use crate::{
    marshal::{Peer, SerializationContext},
    value::{Completion, Value},
    wire::WireValue,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "callKind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RpcEnvelope {
    Call {
        call_key: u64,
        /// Handle of the function to invoke.
        msg_key: String,
        args: Vec<WireValue>,
    },
    Return {
        call_key: u64,
        success: bool,
        result: WireValue,
    },
}

type SendHook = Box<dyn Fn(RpcEnvelope) + Send + Sync>;

/// One end of a remote-object channel.
///
/// Outbound envelopes go through the `on_send` hook given at construction;
/// the owner feeds inbound envelopes to [`RemoteObjectChannel::on_receive_message`].
#[derive(Clone)]
pub struct RemoteObjectChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    context: SerializationContext,
    next_key: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Completion>>>,
    on_send: SendHook,
    closed: AtomicBool,
}

fn closed_error() -> Value {
    Value::error("Error", "channel closed")
}

impl RemoteObjectChannel {
    pub fn new<F>(context: SerializationContext, on_send: F) -> Self
    where
        F: Fn(RpcEnvelope) + Send + Sync + 'static,
    {
        let inner = Arc::new(ChannelInner {
            context,
            next_key: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            on_send: Box::new(on_send),
            closed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&inner);
        let peer: Weak<dyn Peer> = weak;
        inner.context.bind_peer(peer);
        Self { inner }
    }

    pub fn context(&self) -> &SerializationContext {
        &self.inner.context
    }

    pub fn serialize(&self, value: &Value) -> WireValue {
        self.inner.context.serialize(value)
    }

    pub fn deserialize(&self, wire: &WireValue) -> Value {
        self.inner.context.deserialize(wire)
    }

    /// Call `handle` on the peer; resolves when the matching return arrives.
    pub fn send_call_message(
        &self,
        handle: impl Into<String>,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Completion> {
        self.inner.send_call(handle.into(), args)
    }

    /// Dispatch an envelope received from the peer.
    ///
    /// Calls run on their own task so a slow function does not hold up later
    /// messages.
    pub fn on_receive_message(&self, envelope: RpcEnvelope) {
        match envelope {
            RpcEnvelope::Call {
                call_key,
                msg_key,
                args,
            } => {
                let args = self.inner.context.deserialize_all(&args);
                let inner = self.inner.clone();
                let span = debug_span!("rpc_call", call_key, handle = %msg_key);
                tokio::spawn(
                    async move {
                        let (success, value) = match inner.context.invoke(&msg_key, args).await {
                            Ok(value) => (true, value),
                            Err(error) => (false, error),
                        };
                        if inner.closed.load(Ordering::Acquire) {
                            debug!("channel closed before call returned");
                            return;
                        }
                        let result = inner.context.serialize(&value);
                        (inner.on_send)(RpcEnvelope::Return {
                            call_key,
                            success,
                            result,
                        });
                    }
                    .instrument(span),
                );
            }
            RpcEnvelope::Return {
                call_key,
                success,
                result,
            } => {
                let Some(reply) = self.inner.pending.lock().remove(&call_key) else {
                    warn!(call_key, "dropping return for unknown call");
                    return;
                };
                let value = self.inner.context.deserialize(&result);
                let _ = reply.send(if success { Ok(value) } else { Err(value) });
            }
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Reject every outstanding call and refuse new ones.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for (_, reply) in pending {
            let _ = reply.send(Err(closed_error()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl ChannelInner {
    fn send_call(&self, handle: String, args: Vec<Value>) -> BoxFuture<'static, Completion> {
        if self.closed.load(Ordering::Acquire) {
            return futures::future::ready(Err(closed_error())).boxed();
        }
        let call_key = self.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_key, tx);
        let args = self.context.serialize_all(&args);
        (self.on_send)(RpcEnvelope::Call {
            call_key,
            msg_key: handle,
            args,
        });
        async move { rx.await.unwrap_or_else(|_| Err(closed_error())) }.boxed()
    }
}

impl Peer for ChannelInner {
    fn call(&self, handle: String, args: Vec<Value>) -> BoxFuture<'static, Completion> {
        self.send_call(handle, args)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::value::Function;

    /// Two channels wired back to back through CBOR frames.
    fn linked() -> (RemoteObjectChannel, RemoteObjectChannel, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let (to_a, to_a_rx) = mpsc::unbounded_channel::<bytes::Bytes>();
        let (to_b, to_b_rx) = mpsc::unbounded_channel::<bytes::Bytes>();
        let hook = |tx: mpsc::UnboundedSender<bytes::Bytes>, sent: Arc<AtomicUsize>| {
            move |envelope: RpcEnvelope| {
                sent.fetch_add(1, Ordering::SeqCst);
                if let Ok(frame) = isobridge_cbor::encode_frame(&envelope) {
                    let _ = tx.send(frame);
                }
            }
        };
        let a = RemoteObjectChannel::new(SerializationContext::default(), hook(to_b, sent.clone()));
        let b = RemoteObjectChannel::new(SerializationContext::default(), hook(to_a, sent.clone()));
        for (channel, mut rx) in [(b.clone(), to_b_rx), (a.clone(), to_a_rx)] {
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if let Ok(envelope) = isobridge_cbor::decode_frame(&frame) {
                        channel.on_receive_message(envelope);
                    }
                }
            });
        }
        (a, b, sent)
    }

    #[tokio::test]
    async fn call_roundtrip() -> anyhow::Result<()> {
        let (a, b, sent) = linked();
        let add = Function::from_sync("add", |_, args| {
            Ok(Value::Number(args.iter().filter_map(Value::as_f64).sum()))
        });
        let wire = a.serialize(&Value::from(add.clone()));
        let proxy = b.deserialize(&wire);
        let proxy = proxy.as_function().cloned().unwrap();

        let result = proxy.call(Value::Undefined, vec![Value::from(2), Value::from(3)]).await;
        assert_eq!(result, Ok(Value::from(5)));
        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert_eq!(b.pending_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn thrown_values_reject() -> anyhow::Result<()> {
        let (a, b, _) = linked();
        let fail = Function::from_sync("fail", |_, _| Err(Value::type_error("bad input")));
        let proxy = b.deserialize(&a.serialize(&Value::from(fail.clone())));
        let result = proxy.as_function().cloned().unwrap().call(Value::Undefined, Vec::new()).await;
        assert_eq!(result, Err(Value::type_error("bad input")));
        Ok(())
    }

    #[tokio::test]
    async fn close_rejects_pending_calls() -> anyhow::Result<()> {
        let channel = RemoteObjectChannel::new(SerializationContext::default(), |_| {});
        let call = channel.send_call_message("peer:f#1", Vec::new());
        assert_eq!(channel.pending_calls(), 1);
        channel.close();
        assert!(call.await.is_err());
        assert!(channel.send_call_message("peer:f#2", Vec::new()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_return_is_dropped() -> anyhow::Result<()> {
        let channel = RemoteObjectChannel::new(SerializationContext::default(), |_| {});
        channel.on_receive_message(RpcEnvelope::Return {
            call_key: 99,
            success: true,
            result: WireValue::Null,
        });
        assert_eq!(channel.pending_calls(), 0);
        Ok(())
    }
}
