use std::{fmt, future::Future, sync::Arc};

use tokio::sync::watch;

use super::{AnyRef, Completion, Value};

/// A single-assignment eventual value.
#[derive(Clone)]
pub struct Promise(Arc<PromiseInner>);

struct PromiseInner {
    state: watch::Sender<Option<Completion>>,
}

/// Settles the paired [`Promise`]; dropping it unsettled leaves the promise
/// pending forever.
pub struct Resolver(Promise);

impl Promise {
    pub fn pending() -> (Self, Resolver) {
        let promise = Self(Arc::new(PromiseInner {
            state: watch::Sender::new(None),
        }));
        (promise.clone(), Resolver(promise))
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.resolve(value);
        promise
    }

    pub fn rejected(error: impl Into<Value>) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.reject(error);
        promise
    }

    /// Settle with the output of a future driven on the current runtime.
    ///
    /// Outside a runtime the promise rejects immediately.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let (promise, resolver) = Self::pending();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { resolver.settle(future.await) });
            }
            Err(_) => resolver.reject(Value::error("Error", "no async runtime available")),
        }
        promise
    }

    /// The settled outcome, if any, without waiting.
    pub fn peek(&self) -> Option<Completion> {
        self.0.state.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.0.state.borrow().is_some()
    }

    /// Wait until the promise settles.
    pub async fn settled(&self) -> Completion {
        let mut rx = self.0.state.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => {
                let outcome: Option<Completion> = (*state).clone();
                outcome.unwrap_or(Ok(Value::Undefined))
            }
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => Ok(Value::Undefined),
        }
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<PromiseInner>().map(Self)
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peek() {
            None => f.write_str("Promise { <pending> }"),
            Some(Ok(v)) => write!(f, "Promise {{ {v:?} }}"),
            Some(Err(e)) => write!(f, "Promise {{ <rejected> {e:?} }}"),
        }
    }
}

impl Resolver {
    pub fn resolve(self, value: impl Into<Value>) {
        self.settle(Ok(value.into()));
    }

    pub fn reject(self, error: impl Into<Value>) {
        self.settle(Err(error.into()));
    }

    pub fn settle(self, outcome: Completion) {
        self.0.0.state.send_if_modified(move |state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        });
    }

    pub fn promise(&self) -> &Promise {
        &self.0
    }
}
