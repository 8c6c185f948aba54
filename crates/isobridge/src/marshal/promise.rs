use tracing::warn;

use super::{DecodeClosure, EncodeClosure, Mode, SerializationContext};
use crate::{
    value::{Function, Promise, Value},
    wire::{PromiseSnapshot, Tagged, WireValue},
};

impl SerializationContext {
    /// Settled promises travel with their outcome; pending ones export a
    /// one-shot `then` handle that resolves when the promise settles.
    pub(super) fn serialize_promise(&self, promise: &Promise, cl: &mut EncodeClosure) -> Tagged {
        let encode = |value: &Value, cl: &mut EncodeClosure| {
            self.encode(value, cl, Mode::Structural)
                .unwrap_or_default()
        };
        match promise.peek() {
            Some(Ok(value)) => Tagged::Promise {
                handle: None,
                snapshot: PromiseSnapshot {
                    success: Some(true),
                    value: encode(&value, cl),
                    error: WireValue::undefined(),
                },
            },
            Some(Err(error)) => Tagged::Promise {
                handle: None,
                snapshot: PromiseSnapshot {
                    success: Some(false),
                    value: WireValue::undefined(),
                    error: encode(&error, cl),
                },
            },
            None => {
                let pending = promise.clone();
                let then = Function::new("then", move |_, _| {
                    let pending = pending.clone();
                    async move { pending.settled().await }
                });
                Tagged::Promise {
                    handle: Some(self.inner.functions.pin(&then, None, true)),
                    snapshot: PromiseSnapshot::default(),
                }
            }
        }
    }

    pub(super) fn deserialize_promise(
        &self,
        handle: Option<&str>,
        snapshot: &PromiseSnapshot,
        cl: &mut DecodeClosure,
    ) -> Promise {
        match (snapshot.success, handle) {
            (Some(true), _) => Promise::resolved(self.decode(&snapshot.value, cl)),
            (Some(false), _) => Promise::rejected(self.decode(&snapshot.error, cl)),
            (None, Some(handle)) => Promise::from_future(self.call_remote(handle.to_string(), Vec::new())),
            (None, None) => {
                warn!("pending promise without a then handle; resolving undefined");
                Promise::resolved(Value::Undefined)
            }
        }
    }
}
