use std::{
    fmt,
    future::Future,
    sync::{Arc, OnceLock, Weak},
};

use futures::{FutureExt, future::BoxFuture};

use super::{AnyRef, Completion, Value};

type CallFn = dyn Fn(Value, Vec<Value>) -> BoxFuture<'static, Completion> + Send + Sync;

/// A callable value.
///
/// Host functions are native closures; functions received from the other
/// side are proxies that forward the call over the channel.
#[derive(Clone)]
pub struct Function(Arc<FunctionInner>);

struct FunctionInner {
    name: String,
    source: OnceLock<String>,
    call: Box<CallFn>,
}

#[derive(Clone)]
pub struct WeakFunction(Weak<FunctionInner>);

impl Function {
    /// Wrap an async closure taking `this` and the arguments.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        Self(Arc::new(FunctionInner {
            name: name.into(),
            source: OnceLock::new(),
            call: Box::new(move |this, args| f(this, args).boxed()),
        }))
    }

    /// Wrap a synchronous closure.
    pub fn from_sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Completion + Send + Sync + 'static,
    {
        Self::new(name, move |this, args| futures::future::ready(f(this, args)))
    }

    /// Attach the function's source text, reported alongside its handle.
    #[must_use]
    pub fn with_source(self, source: impl Into<String>) -> Self {
        let _ = self.0.source.set(source.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn source_text(&self) -> Option<&str> {
        self.0.source.get().map(String::as_str)
    }

    pub fn call(&self, this: Value, args: Vec<Value>) -> BoxFuture<'static, Completion> {
        (self.0.call)(this, args)
    }

    pub fn downgrade(&self) -> WeakFunction {
        WeakFunction(Arc::downgrade(&self.0))
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
        any.downcast::<FunctionInner>().map(Self)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function: {}]", self.name())
    }
}

impl WeakFunction {
    pub fn upgrade(&self) -> Option<Function> {
        self.0.upgrade().map(Function)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}
