//! Pull-based transfer of iterables, async iterables and byte streams.
//!
//! The exporting side mints a one-shot `start` handle. Starting spawns a
//! producer that drains the source into a buffer and returns a control
//! object with `pull` and `cancel` methods. Each `pull` returns
//! `{ buf, error, done }` with everything buffered so far.
//!
//! The producer pauses when nobody has pulled for the grace window or when
//! the buffer is full, and yields after each production slice.
//!
//! `start(true)` discards the source without producing; consumers dropped
//! before their first pull send it so the exporter does not keep the source.

use std::{
    collections::VecDeque,
    mem,
    sync::{Arc, OnceLock},
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

use super::{SerializationContext, functions::WeakFunctionCache};
use crate::{
    config::StreamConfig,
    value::{
        Array, AsyncIterable, ByteChunks, ByteStream, Completion, Function, Object, Value,
        ValueIter, ValueStream,
    },
};

enum Source {
    Sync(ValueIter),
    Async(ValueStream),
    Bytes(ByteChunks),
}

impl Source {
    fn take(owner: &Value) -> Option<Self> {
        match owner {
            Value::Iterable(it) => it.take().map(Self::Sync),
            Value::AsyncIterable(it) => it.take().map(Self::Async),
            Value::Stream(s) => s.take().map(Self::Bytes),
            _ => None,
        }
    }

    async fn next(&mut self) -> Option<Completion> {
        match self {
            Self::Sync(it) => it.next(),
            Self::Async(s) => s.next().await,
            Self::Bytes(s) => s.next().await.map(|chunk| chunk.map(Value::Bytes)),
        }
    }
}

impl SerializationContext {
    /// Export a sequence source behind a one-shot `start` handle.
    pub(super) fn export_sequence(&self, owner: &Value) -> String {
        let owner = owner.clone();
        let ctx = self.downgrade();
        let start = Function::new("start", move |_, args| {
            let source = Source::take(&owner);
            let ctx = ctx.upgrade();
            let discard = args.first().and_then(Value::as_bool) == Some(true);
            async move {
                if discard {
                    debug!("sequence discarded before start");
                    return Ok(Value::Undefined);
                }
                let Some(source) = source else {
                    return Err(Value::type_error("sequence has already been consumed"));
                };
                let Some(ctx) = ctx else {
                    return Err(Value::error("Error", "serialization context was dropped"));
                };
                Ok(Producer::start(&ctx, source))
            }
        });
        self.inner.functions.pin(&start, None, true)
    }

    pub(super) fn import_sequence(&self, handle: &str) -> AsyncIterable {
        AsyncIterable::from_stream(self.pulled(handle))
    }

    pub(super) fn import_byte_stream(&self, handle: &str) -> ByteStream {
        ByteStream::new(self.pulled(handle).map(|item| match item? {
            Value::Bytes(chunk) => Ok(chunk),
            Value::String(text) => Ok(Bytes::from(text)),
            other => Err(Value::type_error(format!(
                "expected a byte chunk, got {}",
                other.kind()
            ))),
        }))
    }

    fn pulled(&self, handle: &str) -> impl Stream<Item = Completion> + Send + use<> {
        let start = self.deserialize_function_primitive(handle, "start", None);
        futures::stream::unfold(Consumer::new(start), |mut consumer| async move {
            let item = consumer.next().await?;
            Some((item, consumer))
        })
    }
}

struct ProducerState {
    buf: Vec<Value>,
    error: Option<Value>,
    done: bool,
    cancelled: bool,
    /// A pull is parked waiting for items.
    waiting: bool,
    last_pull: Instant,
}

struct ControlHandles {
    pull: String,
    cancel: String,
}

struct Producer {
    state: Mutex<ProducerState>,
    produced: Notify,
    demand: Notify,
    config: StreamConfig,
    cache: WeakFunctionCache,
    handles: OnceLock<ControlHandles>,
}

impl Producer {
    fn start(ctx: &SerializationContext, source: Source) -> Value {
        let producer = Arc::new(Self {
            state: Mutex::new(ProducerState {
                buf: Vec::new(),
                error: None,
                done: false,
                cancelled: false,
                waiting: false,
                last_pull: Instant::now(),
            }),
            produced: Notify::new(),
            demand: Notify::new(),
            config: ctx.stream_config().clone(),
            cache: ctx.functions().downgrade(),
            handles: OnceLock::new(),
        });

        let pull = {
            let producer = producer.clone();
            Function::new("pull", move |_, _| {
                let producer = producer.clone();
                async move { Ok(producer.pull().await) }
            })
        };
        let cancel = {
            let producer = producer.clone();
            Function::from_sync("cancel", move |_, _| {
                producer.cancel();
                Ok(Value::Undefined)
            })
        };
        let _ = producer.handles.set(ControlHandles {
            pull: ctx.functions().pin(&pull, None, false),
            cancel: ctx.functions().pin(&cancel, None, false),
        });

        tokio::spawn(producer.run(source));
        Value::Object(Object::from_entries([("pull", pull), ("cancel", cancel)]))
    }

    async fn run(self: Arc<Self>, mut source: Source) {
        let mut slice_started = Instant::now();
        while self.wait_for_demand().await {
            let item = source.next().await;
            let done = {
                let mut state = self.state.lock();
                if state.cancelled {
                    break;
                }
                match item {
                    Some(Ok(value)) => state.buf.push(value),
                    Some(Err(error)) => {
                        state.error = Some(error);
                        state.done = true;
                    }
                    None => state.done = true,
                }
                state.done
            };
            self.produced.notify_one();
            if done {
                break;
            }
            if slice_started.elapsed() >= self.config.slice {
                tokio::task::yield_now().await;
                slice_started = Instant::now();
            }
        }
        debug!("sequence producer stopped");
    }

    /// Wait until producing is allowed; `false` once the producer should stop.
    async fn wait_for_demand(&self) -> bool {
        loop {
            {
                let state = self.state.lock();
                if state.cancelled {
                    return false;
                }
                let idle = !state.waiting && state.last_pull.elapsed() >= self.config.grace;
                if !idle && state.buf.len() < self.config.max_buffered {
                    return true;
                }
            }
            tokio::select! {
                () = self.demand.notified() => {}
                () = tokio::time::sleep(self.config.grace) => {
                    if !self.is_exported() {
                        return false;
                    }
                }
            }
        }
    }

    async fn pull(&self) -> Value {
        loop {
            let ready = {
                let mut state = self.state.lock();
                state.last_pull = Instant::now();
                if state.cancelled {
                    Some((Vec::new(), None, true))
                } else if !state.buf.is_empty() || state.done {
                    state.waiting = false;
                    let done = state.done;
                    let error = if done { state.error.take() } else { None };
                    Some((mem::take(&mut state.buf), error, done))
                } else {
                    state.waiting = true;
                    None
                }
            };
            self.demand.notify_one();
            if let Some((items, error, done)) = ready {
                if done {
                    self.release();
                }
                return Value::Object(Object::from_entries([
                    ("buf", Value::Array(Array::from_vec(items))),
                    ("error", error.unwrap_or_default()),
                    ("done", Value::Bool(done)),
                ]));
            }
            self.produced.notified().await;
        }
    }

    fn cancel(&self) {
        {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.buf.clear();
        }
        self.demand.notify_one();
        self.produced.notify_one();
        self.release();
    }

    fn release(&self) {
        if let Some(handles) = self.handles.get() {
            self.cache.release(&handles.pull);
            self.cache.release(&handles.cancel);
        }
    }

    /// Whether the control handles are still reachable by the peer.
    fn is_exported(&self) -> bool {
        self.handles
            .get()
            .is_none_or(|handles| self.cache.contains(&handles.pull))
    }
}

/// Tells the exporting side to stop when the consumer is dropped early.
///
/// Holds `start(true)` before the sequence has started and `cancel()` after.
struct ReleaseOnDrop {
    target: Option<Function>,
    args: Vec<Value>,
}

impl ReleaseOnDrop {
    fn discard(start: &Function) -> Self {
        Self {
            target: Some(start.clone()),
            args: vec![Value::Bool(true)],
        }
    }

    fn cancel(cancel: Option<Function>) -> Self {
        Self {
            target: cancel,
            args: Vec::new(),
        }
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(target) = self.target.take()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            let args = mem::take(&mut self.args);
            runtime.spawn(async move {
                if let Err(error) = target.call(Value::Undefined, args).await {
                    debug!(error = %error.describe(), "releasing remote sequence failed");
                }
            });
        }
    }
}

struct Consumer {
    start: Option<Function>,
    pull: Option<Function>,
    release: ReleaseOnDrop,
    queue: VecDeque<Value>,
    error: Option<Value>,
    done: bool,
}

impl Consumer {
    fn new(start: Function) -> Self {
        Self {
            release: ReleaseOnDrop::discard(&start),
            start: Some(start),
            pull: None,
            queue: VecDeque::new(),
            error: None,
            done: false,
        }
    }

    async fn next(&mut self) -> Option<Completion> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(Ok(item));
            }
            if let Some(error) = self.error.take() {
                self.finish();
                return Some(Err(error));
            }
            if self.done {
                self.finish();
                return None;
            }
            if let Some(start) = self.start.take() {
                self.release.target = None;
                self.begin(&start).await;
                continue;
            }
            let Some(pull) = self.pull.clone() else {
                self.done = true;
                continue;
            };
            match pull.call(Value::Undefined, Vec::new()).await {
                Ok(Value::Object(result)) => self.absorb(&result),
                // The producer's handles were reclaimed.
                Ok(Value::Undefined) => self.done = true,
                Ok(other) => self.fail(Value::type_error(format!(
                    "malformed pull result: {}",
                    other.kind()
                ))),
                Err(error) => self.fail(error),
            }
        }
    }

    async fn begin(&mut self, start: &Function) {
        match start.call(Value::Undefined, Vec::new()).await {
            Ok(Value::Object(control)) => {
                self.pull = control.get("pull").as_function().cloned();
                self.release = ReleaseOnDrop::cancel(control.get("cancel").as_function().cloned());
                if self.pull.is_none() {
                    self.fail(Value::type_error("sequence control has no pull method"));
                }
            }
            Ok(Value::Undefined) => self.done = true,
            Ok(other) => self.fail(Value::type_error(format!(
                "malformed sequence control: {}",
                other.kind()
            ))),
            Err(error) => self.fail(error),
        }
    }

    fn absorb(&mut self, result: &Object) {
        if let Value::Array(items) = result.get("buf") {
            self.queue.extend(items.to_vec());
        }
        let error = result.get("error");
        if !error.is_undefined() {
            self.fail(error);
        }
        if result.get("done").as_bool() == Some(true) {
            self.done = true;
        }
    }

    fn fail(&mut self, error: Value) {
        self.error = Some(error);
        self.done = true;
    }

    fn finish(&mut self) {
        self.release.target = None;
        self.pull = None;
    }
}
