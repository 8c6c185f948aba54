use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{AnyRef, Completion, Value};

/// Computed property; may fail, in which case serialization omits it.
pub type Getter = Arc<dyn Fn(&Object) -> Completion + Send + Sync>;

#[derive(Clone)]
pub enum Property {
    Value(Value),
    Getter(Getter),
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => v.fmt(f),
            Self::Getter(_) => f.write_str("[Getter]"),
        }
    }
}

/// A property bag with insertion-ordered string keys.
///
/// Objects with a class name are instances of a user-defined class and cross
/// the boundary as custom objects.
#[derive(Clone)]
pub struct Object(Arc<ObjectInner>);

struct ObjectInner {
    class: Option<String>,
    props: Mutex<IndexMap<String, Property>>,
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Object {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_class(class: impl Into<String>) -> Self {
        Self::build(Some(class.into()))
    }

    fn build(class: Option<String>) -> Self {
        Self(Arc::new(ObjectInner {
            class,
            props: Mutex::new(IndexMap::new()),
        }))
    }

    pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let object = Self::new();
        for (key, value) in entries {
            object.set(key, value);
        }
        object
    }

    pub fn class_name(&self) -> Option<&str> {
        self.0.class.as_deref()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0
            .props
            .lock()
            .insert(key.into(), Property::Value(value.into()));
    }

    pub fn define_getter<F>(&self, key: impl Into<String>, getter: F)
    where
        F: Fn(&Self) -> Completion + Send + Sync + 'static,
    {
        self.0
            .props
            .lock()
            .insert(key.into(), Property::Getter(Arc::new(getter)));
    }

    /// Read a property, evaluating getters.
    ///
    /// Missing properties read as `undefined`.
    ///
    /// # Errors
    /// Returns the value thrown by a failing getter.
    pub fn try_get(&self, key: &str) -> Completion {
        let property = self.0.props.lock().get(key).cloned();
        match property {
            None => Ok(Value::Undefined),
            Some(Property::Value(v)) => Ok(v),
            Some(Property::Getter(getter)) => getter(self),
        }
    }

    /// Read a property; failing getters read as `undefined`.
    pub fn get(&self, key: &str) -> Value {
        self.try_get(key).unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.props.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Property> {
        self.0.props.lock().shift_remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.props.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.props.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Own properties in insertion order, getters unevaluated.
    pub fn properties(&self) -> Vec<(String, Property)> {
        self.0
            .props
            .lock()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    /// Own properties with getters evaluated; failing getters are skipped.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.properties()
            .into_iter()
            .filter_map(|(key, property)| match property {
                Property::Value(v) => Some((key, v)),
                Property::Getter(getter) => getter(self).ok().map(|v| (key, v)),
            })
            .collect()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<ObjectInner>().map(Self)
    }
}

#[derive(Clone, Default)]
pub struct Array(Arc<ArrayInner>);

#[derive(Default)]
struct ArrayInner(Mutex<Vec<Value>>);

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Arc::new(ArrayInner(Mutex::new(items))))
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.0.0.lock().push(value.into());
    }

    pub fn get(&self, index: usize) -> Value {
        self.0.0.lock().get(index).cloned().unwrap_or_default()
    }

    /// Assign an element, padding with `undefined` as needed.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        let mut items = self.0.0.lock();
        if items.len() <= index {
            items.resize(index + 1, Value::Undefined);
        }
        items[index] = value.into();
    }

    pub fn len(&self) -> usize {
        self.0.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.0.0.lock().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<ArrayInner>().map(Self)
    }
}

/// Insertion-ordered map keyed by `SameValueZero`.
#[derive(Clone, Default)]
pub struct MapObject(Arc<MapInner>);

#[derive(Default)]
struct MapInner(Mutex<Vec<(Value, Value)>>);

impl MapObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) {
        let (key, value) = (key.into(), value.into());
        let mut entries = self.0.0.lock();
        match entries.iter_mut().find(|(k, _)| k.same_value_zero(&key)) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.0
            .0
            .lock()
            .iter()
            .find(|(k, _)| k.same_value_zero(key))
            .map(|(_, v)| v.clone())
    }

    pub fn len(&self) -> usize {
        self.0.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.0.lock().clone()
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<MapInner>().map(Self)
    }
}

#[derive(Clone, Default)]
pub struct SetObject(Arc<SetInner>);

#[derive(Default)]
struct SetInner(Mutex<Vec<Value>>);

impl SetObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, value: impl Into<Value>) {
        let value = value.into();
        let mut items = self.0.0.lock();
        if !items.iter().any(|v| v.same_value_zero(&value)) {
            items.push(value);
        }
    }

    pub fn has(&self, value: &Value) -> bool {
        self.0.0.lock().iter().any(|v| v.same_value_zero(value))
    }

    pub fn len(&self) -> usize {
        self.0.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.0.lock().clone()
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<SetInner>().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keeps_insertion_order() {
        let o = Object::from_entries([("b", 1), ("a", 2)]);
        o.set("c", 3);
        o.set("b", 4);
        assert_eq!(o.keys(), ["b", "a", "c"]);
        assert_eq!(o.get("b"), Value::from(4));
        assert_eq!(o.get("missing"), Value::Undefined);
    }

    #[test]
    fn failing_getter_is_skipped_in_snapshot() {
        let o = Object::new();
        o.set("ok", true);
        o.define_getter("bad", |_| Err(Value::type_error("nope")));
        assert!(o.try_get("bad").is_err());
        let keys: Vec<_> = o.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["ok"]);
    }

    #[test]
    fn map_and_set_use_same_value_zero() {
        let m = MapObject::new();
        m.set(f64::NAN, 1);
        m.set(f64::NAN, 2);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&Value::Number(f64::NAN)), Some(Value::from(2)));

        let s = SetObject::new();
        let o = Object::new();
        s.add(o.clone());
        s.add(o.clone());
        s.add(Object::new());
        assert_eq!(s.len(), 2);
        assert!(s.has(&Value::from(o)));
    }

    #[test]
    fn array_set_pads_with_undefined() {
        let a = Array::new();
        a.set(2, "x");
        assert_eq!(a.to_vec(), [Value::Undefined, Value::Undefined, Value::from("x")]);
    }
}
