//! Handle table for exported functions.
//!
//! A handle names a function together with the receiver it is bound to.
//! Exporting the same member of the same receiver twice yields the same
//! handle. Under [`Retention::Weak`] the table never keeps a function or its
//! receiver alive; once either is gone the handle is stale and invoking it
//! resolves `undefined`.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::Retention,
    value::{AnyRef, Completion, Function, Value, WeakAnyRef, WeakFunction},
};

#[derive(Clone)]
pub struct FunctionPrimitiveCache(Arc<CacheInner>);

#[derive(Clone)]
pub(crate) struct WeakFunctionCache(Weak<CacheInner>);

struct CacheInner {
    prefix: String,
    retention: Retention,
    counter: AtomicU64,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    /// (receiver or function address, member) -> handle
    by_member: HashMap<(usize, String), String>,
    /// Pinned function address -> handle
    pinned: HashMap<usize, String>,
}

struct Entry {
    function: FunctionSlot,
    receiver: Option<ReceiverSlot>,
    one_shot: bool,
}

enum FunctionSlot {
    Weak(WeakFunction),
    Pinned(Function),
}

enum ReceiverSlot {
    Weak(WeakAnyRef),
    Pinned(AnyRef),
}

impl Entry {
    /// The live function and its `this`, or `None` if reclaimed.
    fn resolve(&self) -> Option<(Function, Value)> {
        let function = match &self.function {
            FunctionSlot::Weak(f) => f.upgrade()?,
            FunctionSlot::Pinned(f) => f.clone(),
        };
        let this = match &self.receiver {
            None => Value::Undefined,
            Some(ReceiverSlot::Weak(r)) => Value::from_any_ref(r.upgrade()?),
            Some(ReceiverSlot::Pinned(r)) => Value::from_any_ref(r.clone()),
        };
        Some((function, this))
    }

    fn is_alive(&self) -> bool {
        self.resolve().is_some()
    }
}

impl FunctionPrimitiveCache {
    pub(crate) fn new(prefix: impl Into<String>, retention: Retention) -> Self {
        Self(Arc::new(CacheInner {
            prefix: prefix.into(),
            retention,
            counter: AtomicU64::new(0),
            state: Mutex::new(CacheState::default()),
        }))
    }

    pub(crate) fn downgrade(&self) -> WeakFunctionCache {
        WeakFunctionCache(Arc::downgrade(&self.0))
    }

    pub fn retention(&self) -> Retention {
        self.0.retention
    }

    /// Export `function` as member `member` of `receiver`.
    ///
    /// Repeated exports of the same (receiver, member) pair return the same
    /// handle while the entry is alive.
    pub fn serialize_function_primitive(
        &self,
        function: &Function,
        receiver: Option<&Value>,
        member: &str,
    ) -> String {
        let mut state = self.0.state.lock();
        if let Some(handle) = state.pinned.get(&function.addr()) {
            return handle.clone();
        }

        let owner = receiver
            .and_then(Value::identity)
            .unwrap_or_else(|| function.addr());
        let key = (owner, member.to_string());
        if let Some(handle) = state.by_member.get(&key)
            && let Some(entry) = state.entries.get(handle)
            && entry.resolve().is_some_and(|(f, this)| {
                f.ptr_eq(function) && this.identity() == receiver.and_then(Value::identity)
            })
        {
            return handle.clone();
        }

        let handle = self.mint(member);
        let receiver = receiver.and_then(Value::any_ref).map(|r| match self.0.retention {
            Retention::Weak => ReceiverSlot::Weak(Arc::downgrade(&r)),
            Retention::Session => ReceiverSlot::Pinned(r),
        });
        let function = match self.0.retention {
            Retention::Weak => FunctionSlot::Weak(function.downgrade()),
            Retention::Session => FunctionSlot::Pinned(function.clone()),
        };
        state.entries.insert(
            handle.clone(),
            Entry {
                function,
                receiver,
                one_shot: false,
            },
        );
        state.by_member.insert(key, handle.clone());
        handle
    }

    /// Export a protocol adapter function.
    ///
    /// The function itself is pinned; `owner` is held weakly and the entry
    /// dies with it. One-shot entries are released after their first
    /// invocation.
    pub(crate) fn pin(&self, function: &Function, owner: Option<&Value>, one_shot: bool) -> String {
        let handle = self.mint(function.name());
        let receiver = owner
            .and_then(Value::any_ref)
            .map(|r| ReceiverSlot::Weak(Arc::downgrade(&r)));
        let mut state = self.0.state.lock();
        state.entries.insert(
            handle.clone(),
            Entry {
                function: FunctionSlot::Pinned(function.clone()),
                receiver,
                one_shot,
            },
        );
        state.pinned.insert(function.addr(), handle.clone());
        handle
    }

    /// Invoke the function behind `handle` with its bound receiver.
    pub async fn invoke_function_primitive(&self, handle: &str, args: Vec<Value>) -> Completion {
        let target = {
            let mut state = self.0.state.lock();
            let resolved = state.entries.get(handle).map(|entry| (entry.resolve(), entry.one_shot));
            match resolved {
                Some((Some(target), one_shot)) => {
                    if one_shot {
                        state.remove(handle);
                    }
                    Some(target)
                }
                Some((None, _)) => {
                    state.remove(handle);
                    None
                }
                None => None,
            }
        };
        match target {
            Some((function, this)) => function.call(this, args).await,
            None => {
                warn!(handle, "invoked stale function handle; resolving undefined");
                Ok(Value::Undefined)
            }
        }
    }

    /// The live function behind `handle`.
    pub fn lookup(&self, handle: &str) -> Option<Function> {
        let state = self.0.state.lock();
        state.entries.get(handle)?.resolve().map(|(f, _)| f)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.0
            .state
            .lock()
            .entries
            .get(handle)
            .is_some_and(Entry::is_alive)
    }

    pub fn release(&self, handle: &str) -> bool {
        self.0.state.lock().remove(handle)
    }

    /// Drop stale entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut state = self.0.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_alive());
        let removed = before - state.entries.len();
        state.prune_indexes();
        if removed > 0 {
            debug!(removed, "swept stale function handles");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.0.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.0.state.lock() = CacheState::default();
    }

    pub(crate) fn owns(&self, handle: &str) -> bool {
        handle
            .strip_prefix(self.0.prefix.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    fn mint(&self, name: &str) -> String {
        let n = self.0.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = if name.is_empty() { "anonymous" } else { name };
        format!("{}:{name}#{n}", self.0.prefix)
    }
}

impl CacheState {
    fn remove(&mut self, handle: &str) -> bool {
        let removed = self.entries.remove(handle).is_some();
        if removed {
            self.prune_indexes();
        }
        removed
    }

    fn prune_indexes(&mut self) {
        let entries = &self.entries;
        self.by_member.retain(|_, h| entries.contains_key(h));
        self.pinned.retain(|_, h| entries.contains_key(h));
    }
}

impl WeakFunctionCache {
    pub(crate) fn release(&self, handle: &str) {
        if let Some(cache) = self.0.upgrade() {
            FunctionPrimitiveCache(cache).release(handle);
        }
    }

    pub(crate) fn contains(&self, handle: &str) -> bool {
        self.0
            .upgrade()
            .is_some_and(|cache| FunctionPrimitiveCache(cache).contains(handle))
    }
}
