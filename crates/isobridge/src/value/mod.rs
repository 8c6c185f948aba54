//! Script-level values as seen by the host.
//!
//! Primitive variants compare by value. Reference variants (arrays, objects,
//! functions, promises, streams, nodes) are shared handles: cloning a
//! [`Value`] clones the handle, and two handles are the same value exactly
//! when they point at the same allocation.

mod function;
mod object;
mod promise;
mod stream;

use std::{
    any::Any,
    collections::HashSet,
    fmt,
    sync::{Arc, Weak},
};

pub use bytes::Bytes;
pub use function::{Function, WeakFunction};
pub use object::{Array, Getter, MapObject, Object, Property, SetObject};
pub use promise::{Promise, Resolver};
pub use stream::{
    AsyncIterable, ByteChunks, ByteStream, Iterable, Request, Response, ValueIter, ValueStream,
};

use crate::dom::{Node, RemoteNode};

/// Outcome of script-level code; `Err` carries the thrown value.
pub type Completion = Result<Value, Value>;

pub(crate) type AnyRef = Arc<dyn Any + Send + Sync>;
pub(crate) type WeakAnyRef = Weak<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Limited to the `i128` range; wider bigints from a peer decode as
    /// `undefined` with a warning.
    BigInt(i128),
    String(String),
    Symbol(Symbol),
    Bytes(Bytes),
    Array(Array),
    Object(Object),
    Map(MapObject),
    Set(SetObject),
    /// Milliseconds since the Unix epoch; NaN for an invalid date.
    Date(f64),
    RegExp(RegExp),
    Url(url::Url),
    Error(ErrorValue),
    Function(Function),
    Promise(Promise),
    Iterable(Iterable),
    AsyncIterable(AsyncIterable),
    Stream(ByteStream),
    Node(Node),
    RemoteNode(RemoteNode),
    Request(Request),
    Response(Response),
    Global(Global),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegExp {
    pub source: String,
    pub flags: String,
}

/// A global object such as `window`, which never crosses by value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Global {
    pub description: String,
}

#[derive(Clone)]
pub struct Symbol(Arc<SymbolInner>);

struct SymbolInner {
    well_known: Option<String>,
    description: Option<String>,
}

impl Symbol {
    pub fn new(description: Option<String>) -> Self {
        Self(Arc::new(SymbolInner {
            well_known: None,
            description,
        }))
    }

    /// A well-known symbol such as `Symbol.iterator`, identified by name.
    pub fn well_known(name: impl Into<String>) -> Self {
        let name = name.into();
        Self(Arc::new(SymbolInner {
            description: Some(format!("Symbol.{name}")),
            well_known: Some(name),
        }))
    }

    pub fn well_known_name(&self) -> Option<&str> {
        self.0.well_known.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0.well_known, &other.0.well_known) {
            (Some(a), Some(b)) => a == b,
            _ => Arc::ptr_eq(&self.0, &other.0),
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.description().unwrap_or_default())
    }
}

impl Value {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorValue::new(name, message))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::error("TypeError", message)
    }

    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub const fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub const fn as_array(&self) -> Option<&Array> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub const fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    pub const fn as_promise(&self) -> Option<&Promise> {
        match self {
            Self::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub const fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Name of the value's kind, used in diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::BigInt(_) => "bigint",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Bytes(_) => "binary",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Date(_) => "date",
            Self::RegExp(_) => "regexp",
            Self::Url(_) => "url",
            Self::Error(_) => "error",
            Self::Function(_) => "function",
            Self::Promise(_) => "promise",
            Self::Iterable(_) => "iterable",
            Self::AsyncIterable(_) => "async iterable",
            Self::Stream(_) => "readable stream",
            Self::Node(_) | Self::RemoteNode(_) => "node",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Global(_) => "global",
        }
    }

    /// Short human-readable rendering, one level deep.
    pub fn describe(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::BigInt(i) => format!("{i}n"),
            Self::String(s) => s.clone(),
            Self::Symbol(s) => format!("{s:?}"),
            Self::Bytes(b) => format!("Uint8Array({})", b.len()),
            Self::Array(a) => format!("Array({})", a.len()),
            Self::Object(o) => match o.class_name() {
                Some(class) => format!("[object {class}]"),
                None => "[object Object]".to_string(),
            },
            Self::Map(m) => format!("Map({})", m.len()),
            Self::Set(s) => format!("Set({})", s.len()),
            Self::Date(ms) => format!("Date({})", format_number(*ms)),
            Self::RegExp(r) => format!("/{}/{}", r.source, r.flags),
            Self::Url(u) => u.to_string(),
            Self::Error(e) => e.to_string(),
            Self::Function(f) => format!("[Function: {}]", f.name()),
            Self::Node(n) => n
                .opening_tag_text()
                .unwrap_or_else(|| format!("#{:?}", n.kind())),
            Self::RemoteNode(n) => n
                .opening_tag_text
                .clone()
                .unwrap_or_else(|| format!("#{:?}", n.kind)),
            Self::Request(r) => format!("Request({} {})", r.method, r.url),
            Self::Response(r) => format!("Response({} {})", r.status, r.url),
            Self::Global(g) => g.description.clone(),
            Self::Promise(_) | Self::Iterable(_) | Self::AsyncIterable(_) | Self::Stream(_) => {
                format!("[{}]", self.kind())
            }
        }
    }

    /// Address of the shared allocation behind a reference value.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Self::Array(a) => Some(a.addr()),
            Self::Object(o) => Some(o.addr()),
            Self::Map(m) => Some(m.addr()),
            Self::Set(s) => Some(s.addr()),
            Self::Function(f) => Some(f.addr()),
            Self::Promise(p) => Some(p.addr()),
            Self::Iterable(i) => Some(i.addr()),
            Self::AsyncIterable(i) => Some(i.addr()),
            Self::Stream(s) => Some(s.addr()),
            Self::Node(n) => Some(n.addr()),
            _ => None,
        }
    }

    /// Type-erased strong reference to the shared allocation.
    pub(crate) fn any_ref(&self) -> Option<AnyRef> {
        match self {
            Self::Array(a) => Some(a.any_ref()),
            Self::Object(o) => Some(o.any_ref()),
            Self::Map(m) => Some(m.any_ref()),
            Self::Set(s) => Some(s.any_ref()),
            Self::Function(f) => Some(f.any_ref()),
            Self::Promise(p) => Some(p.any_ref()),
            Self::Iterable(i) => Some(i.any_ref()),
            Self::AsyncIterable(i) => Some(i.any_ref()),
            Self::Stream(s) => Some(s.any_ref()),
            Self::Node(n) => Some(n.any_ref()),
            _ => None,
        }
    }

    /// Rebuild a value from a reference obtained with [`Value::any_ref`].
    pub(crate) fn from_any_ref(any: AnyRef) -> Self {
        let any = match Array::from_any(any) {
            Ok(a) => return Self::Array(a),
            Err(any) => any,
        };
        let any = match Object::from_any(any) {
            Ok(o) => return Self::Object(o),
            Err(any) => any,
        };
        let any = match MapObject::from_any(any) {
            Ok(m) => return Self::Map(m),
            Err(any) => any,
        };
        let any = match SetObject::from_any(any) {
            Ok(s) => return Self::Set(s),
            Err(any) => any,
        };
        let any = match Function::from_any(any) {
            Ok(f) => return Self::Function(f),
            Err(any) => any,
        };
        let any = match Promise::from_any(any) {
            Ok(p) => return Self::Promise(p),
            Err(any) => any,
        };
        let any = match Iterable::from_any(any) {
            Ok(i) => return Self::Iterable(i),
            Err(any) => any,
        };
        let any = match AsyncIterable::from_any(any) {
            Ok(i) => return Self::AsyncIterable(i),
            Err(any) => any,
        };
        let any = match ByteStream::from_any(any) {
            Ok(s) => return Self::Stream(s),
            Err(any) => any,
        };
        match Node::from_any(any) {
            Ok(n) => Self::Node(n),
            Err(_) => Self::Undefined,
        }
    }

    /// `SameValueZero`: primitives by value (NaN equals NaN), references by
    /// identity.
    pub fn same_value_zero(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self == other,
        }
    }

    /// Structural equality that follows references, tolerating cycles.
    ///
    /// Capability values (functions, promises, streams, nodes) compare by
    /// identity.
    pub fn deep_eq(&self, other: &Self) -> bool {
        deep_eq_inner(self, other, &mut HashSet::new())
    }
}

fn deep_eq_inner(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
    if let (Some(x), Some(y)) = (a.identity(), b.identity()) {
        if x == y {
            return true;
        }
        // Assume equal while the pair is being compared further up the stack.
        if !seen.insert((x, y)) {
            return true;
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) | (Value::Date(x), Value::Date(y)) => {
            x == y || (x.is_nan() && y.is_nan())
        }
        (Value::Symbol(x), Value::Symbol(y)) => {
            x.well_known_name() == y.well_known_name() && x.description() == y.description()
        }
        (Value::Array(x), Value::Array(y)) => {
            deep_eq_seq(&x.to_vec(), &y.to_vec(), seen)
        }
        (Value::Set(x), Value::Set(y)) => deep_eq_seq(&x.values(), &y.values(), seen),
        (Value::Map(x), Value::Map(y)) => {
            let (xs, ys) = (x.entries(), y.entries());
            xs.len() == ys.len()
                && xs.iter().zip(&ys).all(|((xk, xv), (yk, yv))| {
                    deep_eq_inner(xk, yk, seen) && deep_eq_inner(xv, yv, seen)
                })
        }
        (Value::Object(x), Value::Object(y)) => {
            let (xs, ys) = (x.snapshot(), y.snapshot());
            x.class_name() == y.class_name()
                && xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(&ys)
                    .all(|((xk, xv), (yk, yv))| xk == yk && deep_eq_inner(xv, yv, seen))
        }
        (Value::RemoteNode(x), Value::RemoteNode(y)) => x.handle == y.handle,
        (Value::Request(x), Value::Request(y)) => {
            x.method == y.method && x.url == y.url && x.headers == y.headers
        }
        (Value::Response(x), Value::Response(y)) => {
            x.status == y.status && x.url == y.url && x.headers == y.headers
        }
        _ => a == b,
    }
}

fn deep_eq_seq(xs: &[Value], ys: &[Value], seen: &mut HashSet<(usize, usize)>) -> bool {
    xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_eq_inner(x, y, seen))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) | (Self::Date(a), Self::Date(b)) => a == b,
            (Self::BigInt(a), Self::BigInt(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::RegExp(a), Self::RegExp(b)) => a == b,
            (Self::Url(a), Self::Url(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            (Self::Global(a), Self::Global(b)) => a == b,
            (Self::RemoteNode(a), Self::RemoteNode(b)) => a.handle == b.handle,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Error(e) => write!(f, "{e:?}"),
            Self::Array(a) => f.debug_list().entries(a.to_vec().iter().map(Shallow)).finish(),
            Self::Object(o) => {
                let mut map = f.debug_map();
                for (key, value) in o.snapshot() {
                    map.entry(&key, &Shallow(&value));
                }
                map.finish()
            }
            other => f.write_str(&other.describe()),
        }
    }
}

/// Renders nested references without descending into them.
struct Shallow<'a>(&'a Value);

impl fmt::Debug for Shallow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::String(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.describe()),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        n.to_string()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<ErrorValue> for Value {
    fn from(e: ErrorValue) -> Self {
        Self::Error(e)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Self::Array(a)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Self::Object(o)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Self::Function(f)
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Self::Promise(p)
    }
}

impl From<Node> for Value {
    fn from(n: Node) -> Self {
        Self::Node(n)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Array(Array::from_vec(items.into_iter().map(Into::into).collect()))
    }
}
