//! Conversion between [`Value`]s and their [`WireValue`] form.
//!
//! Each side of a channel owns one [`SerializationContext`]. Values that
//! cannot be copied (functions, pending promises, iterables, streams, nodes)
//! are exported as handles minted by the context; the peer turns them back
//! into proxies that call home over the bound channel.

mod functions;
mod iterable;
mod nodes;
mod promise;

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use rand::Rng;
use tracing::warn;

pub use functions::FunctionPrimitiveCache;

use crate::{
    config::{ContextConfig, StreamConfig},
    dom::NodeRegistry,
    error::{Error, Result},
    value::{
        Array, Completion, ErrorValue, Function, Global, MapObject, Object, Property, RegExp,
        Request, Response, SetObject, Symbol, Value,
    },
    wire::{RequestWire, ResponseWire, Tagged, WireValue},
};

/// Outbound side of a channel, used by proxies to call the peer.
pub(crate) trait Peer: Send + Sync {
    fn call(&self, handle: String, args: Vec<Value>) -> BoxFuture<'static, Completion>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Structural,
    Raw,
}

#[derive(Clone)]
pub struct SerializationContext {
    inner: Arc<ContextInner>,
}

#[derive(Clone)]
pub(crate) struct WeakContext(Weak<ContextInner>);

struct ContextInner {
    id: String,
    functions: FunctionPrimitiveCache,
    nodes: Arc<NodeRegistry>,
    stream: StreamConfig,
    peer: Mutex<Option<Weak<dyn Peer>>>,
}

impl Default for SerializationContext {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl SerializationContext {
    pub fn new(config: ContextConfig) -> Self {
        let id = format!("{:012x}", rand::rng().random::<u64>() & 0xffff_ffff_ffff);
        Self {
            inner: Arc::new(ContextInner {
                functions: FunctionPrimitiveCache::new(id.clone(), config.retention),
                nodes: Arc::new(NodeRegistry::new()),
                stream: config.stream,
                peer: Mutex::new(None),
                id,
            }),
        }
    }

    /// Prefix of every handle this context mints.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn functions(&self) -> &FunctionPrimitiveCache {
        &self.inner.functions
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.inner.nodes
    }

    pub(crate) fn stream_config(&self) -> &StreamConfig {
        &self.inner.stream
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.inner))
    }

    pub(crate) fn bind_peer(&self, peer: Weak<dyn Peer>) {
        *self.inner.peer.lock() = Some(peer);
    }

    /// Whether `handle` was minted by this context.
    pub fn owns_handle(&self, handle: &str) -> bool {
        self.inner.functions.owns(handle)
    }

    /// Encode a value, exporting handles for everything that cannot be copied.
    pub fn serialize(&self, value: &Value) -> WireValue {
        match self.encode(value, &mut EncodeClosure::default(), Mode::Structural) {
            Ok(wire) => wire,
            // Structural encoding has no failure paths.
            Err(_) => WireValue::undefined(),
        }
    }

    pub fn serialize_all(&self, values: &[Value]) -> Vec<WireValue> {
        values.iter().map(|v| self.serialize(v)).collect()
    }

    /// Encode plain data only.
    ///
    /// # Errors
    /// Returns [`Error::DataClone`] for any value that would need a handle.
    pub fn serialize_raw(&self, value: &Value) -> Result<WireValue> {
        self.encode(value, &mut EncodeClosure::default(), Mode::Raw)
    }

    pub fn deserialize(&self, wire: &WireValue) -> Value {
        self.decode(wire, &mut DecodeClosure::default())
    }

    pub fn deserialize_all(&self, wires: &[WireValue]) -> Vec<Value> {
        wires.iter().map(|w| self.deserialize(w)).collect()
    }

    /// Serve an inbound call for `handle`.
    pub async fn invoke(&self, handle: &str, args: Vec<Value>) -> Completion {
        if !self.owns_handle(handle) {
            warn!(handle, context = %self.id(), "rejecting call for foreign handle");
            return Err(Value::error(
                "ReferenceError",
                format!("handle {handle} does not belong to this context"),
            ));
        }
        self.inner
            .functions
            .invoke_function_primitive(handle, args)
            .await
    }

    /// Release every handle and node key; outstanding proxies on the peer
    /// resolve `undefined` from now on.
    pub fn teardown(&self) {
        self.inner.functions.clear();
        self.inner.nodes.clear();
        *self.inner.peer.lock() = None;
    }

    /// Call a handle on the peer.
    pub(crate) fn call_remote(&self, handle: String, args: Vec<Value>) -> BoxFuture<'static, Completion> {
        let peer = self.inner.peer.lock().as_ref().and_then(Weak::upgrade);
        match peer {
            Some(peer) => peer.call(handle, args),
            None => futures::future::ready(Err(Value::error(
                "Error",
                format!("no channel bound for {handle}"),
            )))
            .boxed(),
        }
    }

    /// A local function that forwards to `handle` on the peer.
    pub(crate) fn deserialize_function_primitive(
        &self,
        handle: &str,
        name: &str,
        source_text: Option<&str>,
    ) -> Function {
        if self.owns_handle(handle)
            && let Some(local) = self.inner.functions.lookup(handle)
        {
            return local;
        }
        let ctx = self.downgrade();
        let target = handle.to_string();
        let proxy = Function::new(name, move |_, args| {
            let call = ctx.upgrade().map(|ctx| ctx.call_remote(target.clone(), args));
            async move {
                match call {
                    Some(call) => call.await,
                    None => Err(Value::error("Error", "serialization context was dropped")),
                }
            }
        });
        match source_text {
            Some(source) => proxy.with_source(source),
            None => proxy,
        }
    }

    fn function_wire(&self, function: &Function, receiver: Option<&Value>, member: &str) -> WireValue {
        WireValue::tagged(Tagged::Function {
            handle: self
                .inner
                .functions
                .serialize_function_primitive(function, receiver, member),
            name: function.name().to_string(),
            source_text: function.source_text().map(str::to_string),
        })
    }

    fn encode(&self, value: &Value, cl: &mut EncodeClosure, mode: Mode) -> Result<WireValue> {
        let capability = |kind: &'static str| -> Result<()> {
            match mode {
                Mode::Raw => Err(Error::DataClone { kind }),
                Mode::Structural => Ok(()),
            }
        };
        // Arrays, then iterables, then promises, then the remaining object
        // kinds; the order decides which adapter a value gets.
        let tagged = match value {
            Value::Undefined => Tagged::Undefined,
            Value::Null => return Ok(WireValue::Null),
            Value::Bool(b) => return Ok(WireValue::Bool(*b)),
            Value::Number(n) => return Ok(WireValue::Number(*n)),
            Value::String(s) => return Ok(WireValue::String(s.clone())),
            Value::BigInt(i) => Tagged::BigInt {
                value: i.to_string(),
            },
            Value::Symbol(s) => {
                capability("symbol")?;
                Tagged::Symbol {
                    known_name: s.well_known_name().map(str::to_string),
                    description: s.description().map(str::to_string),
                }
            }
            Value::Function(f) => {
                capability("function")?;
                return Ok(self.function_wire(f, None, f.name()));
            }
            Value::Array(a) => match cl.enter(a.addr()) {
                Visit::Seen(id) => Tagged::Ref { id },
                Visit::Fresh(id) => Tagged::Array {
                    id,
                    items: self.encode_seq(&a.to_vec(), cl, mode)?,
                },
            },
            Value::Iterable(_) => {
                capability("iterable")?;
                Tagged::Iterable {
                    handle: self.export_sequence(value),
                }
            }
            Value::AsyncIterable(_) => {
                capability("async iterable")?;
                Tagged::AsyncIterable {
                    handle: self.export_sequence(value),
                }
            }
            Value::Promise(p) => {
                capability("promise")?;
                self.serialize_promise(p, cl)
            }
            Value::Date(ms) => Tagged::Date { epoch_ms: *ms },
            Value::RegExp(RegExp { source, flags }) => Tagged::RegExp {
                source: source.clone(),
                flags: flags.clone(),
            },
            Value::Url(url) => Tagged::Url {
                href: url.to_string(),
            },
            Value::Error(e) => Tagged::Error {
                name: e.name.clone(),
                message: e.message.clone(),
                stack: e.stack.clone(),
            },
            Value::Map(m) => match cl.enter(m.addr()) {
                Visit::Seen(id) => Tagged::Ref { id },
                Visit::Fresh(id) => {
                    let mut entries = Vec::new();
                    for (k, v) in m.entries() {
                        entries.push((self.encode(&k, cl, mode)?, self.encode(&v, cl, mode)?));
                    }
                    Tagged::Map { id, entries }
                }
            },
            Value::Set(s) => match cl.enter(s.addr()) {
                Visit::Seen(id) => Tagged::Ref { id },
                Visit::Fresh(id) => Tagged::Set {
                    id,
                    items: self.encode_seq(&s.values(), cl, mode)?,
                },
            },
            Value::Bytes(b) => Tagged::Bytes { data: b.clone() },
            Value::Global(g) => {
                capability("global")?;
                Tagged::Window {
                    description: g.description.clone(),
                }
            }
            Value::Node(n) => {
                capability("node")?;
                Tagged::DomNode(self.serialize_dom_node(n))
            }
            Value::RemoteNode(n) => {
                capability("node")?;
                Tagged::DomNode(self.reexport_remote_node(n))
            }
            Value::Stream(_) => {
                capability("readable stream")?;
                Tagged::ReadableStream {
                    handle: self.export_sequence(value),
                }
            }
            Value::Response(r) => {
                capability("response")?;
                Tagged::Response(ResponseWire {
                    status: r.status,
                    status_text: r.status_text.clone(),
                    url: r.url.clone(),
                    headers: r.headers.clone(),
                    body: r
                        .body
                        .as_ref()
                        .map(|b| self.export_sequence(&Value::Stream(b.clone()))),
                })
            }
            Value::Request(r) => {
                capability("request")?;
                Tagged::Request(RequestWire {
                    method: r.method.clone(),
                    url: r.url.clone(),
                    headers: r.headers.clone(),
                    body: r
                        .body
                        .as_ref()
                        .map(|b| self.export_sequence(&Value::Stream(b.clone()))),
                })
            }
            Value::Object(o) => match cl.enter(o.addr()) {
                Visit::Seen(id) => Tagged::Ref { id },
                Visit::Fresh(id) => {
                    let props = self.encode_props(o, cl, mode)?;
                    match o.class_name() {
                        Some(class) => Tagged::Custom {
                            id,
                            ctor_name: class.to_string(),
                            props,
                        },
                        None => Tagged::Object { id, props },
                    }
                }
            },
        };
        Ok(WireValue::tagged(tagged))
    }

    fn encode_seq(&self, items: &[Value], cl: &mut EncodeClosure, mode: Mode) -> Result<Vec<WireValue>> {
        items.iter().map(|v| self.encode(v, cl, mode)).collect()
    }

    fn encode_props(
        &self,
        object: &Object,
        cl: &mut EncodeClosure,
        mode: Mode,
    ) -> Result<Vec<(String, WireValue)>> {
        let receiver = Value::Object(object.clone());
        let mut props = Vec::new();
        for (key, property) in object.properties() {
            let value = match property {
                Property::Value(v) => v,
                Property::Getter(getter) => match getter(object) {
                    Ok(v) => v,
                    Err(error) => {
                        warn!(property = %key, error = %error.describe(), "getter threw during serialization; omitting property");
                        continue;
                    }
                },
            };
            let wire = match (&value, mode) {
                // Methods stay bound to the object they were read from.
                (Value::Function(f), Mode::Structural) => self.function_wire(f, Some(&receiver), &key),
                _ => self.encode(&value, cl, mode)?,
            };
            props.push((key, wire));
        }
        Ok(props)
    }

    fn decode(&self, wire: &WireValue, cl: &mut DecodeClosure) -> Value {
        match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Number(n) => Value::Number(*n),
            WireValue::String(s) => Value::String(s.clone()),
            WireValue::Plain(map) => {
                let object = Object::new();
                for (key, value) in map {
                    object.set(key.clone(), self.decode(value, cl));
                }
                Value::Object(object)
            }
            WireValue::List(items) => {
                Value::Array(Array::from_vec(items.iter().map(|v| self.decode(v, cl)).collect()))
            }
            WireValue::Tagged(tagged) => self.decode_tagged(tagged, cl),
        }
    }

    fn decode_tagged(&self, tagged: &Tagged, cl: &mut DecodeClosure) -> Value {
        match tagged {
            Tagged::Undefined => Value::Undefined,
            Tagged::BigInt { value } => value.parse().map_or_else(
                |_| {
                    warn!(%value, "bigint out of range; decoding as undefined");
                    Value::Undefined
                },
                Value::BigInt,
            ),
            Tagged::Bytes { data } => Value::Bytes(data.clone()),
            Tagged::Array { id, items } => {
                let array = Array::new();
                cl.register(*id, Value::Array(array.clone()));
                for item in items {
                    array.push(self.decode(item, cl));
                }
                Value::Array(array)
            }
            Tagged::Object { id, props } => {
                let object = Object::new();
                self.decode_props(*id, &object, props, cl)
            }
            Tagged::Custom {
                id,
                ctor_name,
                props,
            } => {
                let object = Object::with_class(ctor_name.clone());
                self.decode_props(*id, &object, props, cl)
            }
            Tagged::Map { id, entries } => {
                let map = MapObject::new();
                cl.register(*id, Value::Map(map.clone()));
                for (k, v) in entries {
                    let key = self.decode(k, cl);
                    map.set(key, self.decode(v, cl));
                }
                Value::Map(map)
            }
            Tagged::Set { id, items } => {
                let set = SetObject::new();
                cl.register(*id, Value::Set(set.clone()));
                for item in items {
                    set.add(self.decode(item, cl));
                }
                Value::Set(set)
            }
            Tagged::Ref { id } => cl.resolve(*id),
            Tagged::Date { epoch_ms } => Value::Date(*epoch_ms),
            Tagged::RegExp { source, flags } => Value::RegExp(RegExp {
                source: source.clone(),
                flags: flags.clone(),
            }),
            Tagged::Url { href } => url::Url::parse(href).map_or_else(
                |e| {
                    warn!(%href, error = %e, "invalid url; decoding as string");
                    Value::String(href.clone())
                },
                Value::Url,
            ),
            Tagged::Error {
                name,
                message,
                stack,
            } => Value::Error(ErrorValue {
                name: name.clone(),
                message: message.clone(),
                stack: stack.clone(),
            }),
            Tagged::Function {
                handle,
                name,
                source_text,
            } => Value::Function(self.deserialize_function_primitive(
                handle,
                name,
                source_text.as_deref(),
            )),
            Tagged::Promise { handle, snapshot } => {
                Value::Promise(self.deserialize_promise(handle.as_deref(), snapshot, cl))
            }
            Tagged::Iterable { handle } | Tagged::AsyncIterable { handle } => {
                Value::AsyncIterable(self.import_sequence(handle))
            }
            Tagged::ReadableStream { handle } => Value::Stream(self.import_byte_stream(handle)),
            Tagged::DomNode(node) => self.deserialize_dom_node(node),
            Tagged::Symbol {
                known_name,
                description,
            } => Value::Symbol(match known_name {
                Some(name) => Symbol::well_known(name.clone()),
                None => Symbol::new(description.clone()),
            }),
            Tagged::Request(r) => Value::Request(Request {
                method: r.method.clone(),
                url: r.url.clone(),
                headers: r.headers.clone(),
                body: r.body.as_deref().map(|h| self.import_byte_stream(h)),
            }),
            Tagged::Response(r) => Value::Response(Response {
                status: r.status,
                status_text: r.status_text.clone(),
                url: r.url.clone(),
                headers: r.headers.clone(),
                body: r.body.as_deref().map(|h| self.import_byte_stream(h)),
            }),
            Tagged::Window { description } => Value::Global(Global {
                description: description.clone(),
            }),
        }
    }

    fn decode_props(
        &self,
        id: u32,
        object: &Object,
        props: &[(String, WireValue)],
        cl: &mut DecodeClosure,
    ) -> Value {
        cl.register(id, Value::Object(object.clone()));
        for (key, value) in props {
            object.set(key.clone(), self.decode(value, cl));
        }
        Value::Object(object.clone())
    }
}

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<SerializationContext> {
        self.0.upgrade().map(|inner| SerializationContext { inner })
    }
}

enum Visit {
    Fresh(u32),
    Seen(u32),
}

/// Containers already emitted while encoding one value.
#[derive(Default)]
struct EncodeClosure {
    ids: HashMap<usize, u32>,
}

impl EncodeClosure {
    fn enter(&mut self, addr: usize) -> Visit {
        let next = u32::try_from(self.ids.len()).unwrap_or(u32::MAX);
        match self.ids.get(&addr) {
            Some(id) => Visit::Seen(*id),
            None => {
                self.ids.insert(addr, next);
                Visit::Fresh(next)
            }
        }
    }
}

/// Containers already rebuilt while decoding one value.
#[derive(Default)]
struct DecodeClosure {
    refs: HashMap<u32, Value>,
}

impl DecodeClosure {
    fn register(&mut self, id: u32, value: Value) {
        self.refs.insert(id, value);
    }

    fn resolve(&self, id: u32) -> Value {
        self.refs.get(&id).cloned().unwrap_or_else(|| {
            warn!(id, "dangling back-reference; decoding as undefined");
            Value::Undefined
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::value::{Function, Promise};

    fn ctx() -> SerializationContext {
        SerializationContext::default()
    }

    fn roundtrip(value: &Value) -> Value {
        let ctx = ctx();
        ctx.deserialize(&ctx.serialize(value))
    }

    #[test]
    fn scalars_travel_untagged() {
        let ctx = ctx();
        assert_eq!(ctx.serialize(&Value::from(42)), WireValue::Number(42.0));
        assert_eq!(ctx.serialize(&Value::from("x")), WireValue::from("x"));
        assert_eq!(ctx.serialize(&Value::Null), WireValue::Null);
        assert!(ctx.serialize(&Value::Undefined).is_undefined());
    }

    #[test]
    fn structured_values_roundtrip() {
        let object = Object::from_entries([("a", Value::from(1)), ("b", Value::from("two"))]);
        let map = MapObject::new();
        map.set("k", Value::Date(0.0));
        let set = SetObject::new();
        set.add(Value::BigInt(-(1 << 100)));
        let values = [
            Value::from(object),
            Value::from(vec![Value::Null, Value::Bool(false)]),
            Value::Map(map),
            Value::Set(set),
            Value::Bytes(Bytes::from_static(b"\xff\x00")),
            Value::RegExp(RegExp {
                source: "a+".into(),
                flags: "gi".into(),
            }),
            Value::Url(url::Url::parse("https://example.com/a?b=c").unwrap()),
            Value::Error(ErrorValue::new("RangeError", "bad").with_stack("at x")),
            Value::Symbol(Symbol::well_known("iterator")),
        ];
        for value in values {
            assert!(roundtrip(&value).deep_eq(&value), "{value:?}");
        }
    }

    #[test]
    fn custom_objects_keep_class_name() {
        let point = Object::with_class("Point");
        point.set("x", 1);
        let decoded = roundtrip(&Value::from(point));
        assert_eq!(decoded.as_object().and_then(Object::class_name), Some("Point"));
    }

    #[test]
    fn cycles_and_shared_references_survive() {
        let root = Object::new();
        let shared = Array::from_vec(vec![Value::from(1)]);
        root.set("me", root.clone());
        root.set("a", shared.clone());
        root.set("b", shared);

        let decoded = roundtrip(&Value::from(root));
        let object = decoded.as_object().unwrap();
        assert!(object.get("me").as_object().is_some_and(|o| o.ptr_eq(object)));
        assert_eq!(object.get("a"), object.get("b"));
    }

    #[test]
    fn bigints_beyond_i128_decode_as_undefined() {
        let ctx = ctx();
        let decode = |value: String| ctx.deserialize(&WireValue::tagged(Tagged::BigInt { value }));
        assert_eq!(decode(i128::MAX.to_string()), Value::BigInt(i128::MAX));
        assert_eq!(decode(i128::MIN.to_string()), Value::BigInt(i128::MIN));
        assert_eq!(decode(format!("1{}", "0".repeat(40))), Value::Undefined);
    }

    #[test]
    fn failing_getter_is_omitted() {
        let object = Object::new();
        object.set("kept", 1);
        object.define_getter("broken", |_| Err(Value::type_error("no")));
        let decoded = roundtrip(&Value::from(object));
        assert_eq!(decoded.as_object().unwrap().keys(), ["kept"]);
    }

    #[test]
    fn raw_mode_rejects_capabilities() {
        let ctx = ctx();
        let object = Object::new();
        object.set("f", Function::from_sync("f", |_, _| Ok(Value::Undefined)));
        assert!(matches!(
            ctx.serialize_raw(&Value::from(object)),
            Err(Error::DataClone { kind: "function" })
        ));
        assert!(ctx.serialize_raw(&Value::from(vec![Value::from(1)])).is_ok());
        assert!(ctx.functions().is_empty());
    }

    #[tokio::test]
    async fn own_function_handles_resolve_locally() -> anyhow::Result<()> {
        let ctx = ctx();
        let f = Function::from_sync("f", |_, _| Ok(Value::from(7)));
        let decoded = ctx.deserialize(&ctx.serialize(&Value::from(f.clone())));
        assert!(decoded.as_function().is_some_and(|g| g.ptr_eq(&f)));
        Ok(())
    }

    #[tokio::test]
    async fn foreign_handles_are_rejected() -> anyhow::Result<()> {
        let ctx = ctx();
        let outcome = ctx.invoke("someone-else:f#1", Vec::new()).await;
        assert!(matches!(outcome, Err(Value::Error(e)) if e.name == "ReferenceError"));
        Ok(())
    }

    #[tokio::test]
    async fn settled_promise_embeds_outcome() -> anyhow::Result<()> {
        let ctx = ctx();
        let wire = ctx.serialize(&Value::from(Promise::resolved("done")));
        assert!(matches!(
            wire.as_tagged(),
            Some(Tagged::Promise { handle: None, .. })
        ));
        assert!(ctx.functions().is_empty());
        let promise = ctx.deserialize(&wire);
        assert_eq!(
            promise.as_promise().and_then(Promise::peek),
            Some(Ok(Value::from("done")))
        );
        Ok(())
    }
}
