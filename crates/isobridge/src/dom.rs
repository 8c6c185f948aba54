//! Document nodes, their per-context registry, and visual presentation.
//!
//! Nodes never cross the boundary by value. A serialized node carries an
//! access key that stays valid in the registry of the context that minted it;
//! any context sharing the same [`ContextGroup`] can resolve the key back to
//! the live node and place it on a surface.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, Weak},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::value::{AnyRef, Function, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Element,
    Text,
    Comment,
    Document,
    Fragment,
}

/// Layout box of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A box without area does not occupy layout space.
    pub fn is_degenerate(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Smallest box enclosing both; degenerate boxes are ignored.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        if self.is_degenerate() {
            return other;
        }
        if other.is_degenerate() {
            return self;
        }
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        Self::new(left, top, right - left, bottom - top)
    }
}

#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

struct NodeInner {
    kind: NodeKind,
    tag_name: Option<String>,
    attributes: Mutex<Vec<(String, String)>>,
    text: Mutex<Option<String>>,
    children: Mutex<Vec<Node>>,
    parent: Mutex<Weak<NodeInner>>,
    bounds: Mutex<Rect>,
    access_key: OnceLock<String>,
}

#[derive(Clone)]
pub struct WeakNode(Weak<NodeInner>);

impl Node {
    fn build(kind: NodeKind, tag_name: Option<String>, text: Option<String>) -> Self {
        Self(Arc::new(NodeInner {
            kind,
            tag_name,
            attributes: Mutex::new(Vec::new()),
            text: Mutex::new(text),
            children: Mutex::new(Vec::new()),
            parent: Mutex::new(Weak::new()),
            bounds: Mutex::new(Rect::default()),
            access_key: OnceLock::new(),
        }))
    }

    pub fn element(tag_name: impl Into<String>) -> Self {
        Self::build(NodeKind::Element, Some(tag_name.into().to_ascii_lowercase()), None)
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::build(NodeKind::Text, None, Some(content.into()))
    }

    pub fn comment(content: impl Into<String>) -> Self {
        Self::build(NodeKind::Comment, None, Some(content.into()))
    }

    pub fn document() -> Self {
        Self::build(NodeKind::Document, None, None)
    }

    pub fn fragment() -> Self {
        Self::build(NodeKind::Fragment, None, None)
    }

    pub fn kind(&self) -> NodeKind {
        self.0.kind
    }

    pub fn tag_name(&self) -> Option<&str> {
        self.0.tag_name.as_deref()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<String>) {
        let (name, value) = (name.into(), value.into());
        let mut attributes = self.0.attributes.lock();
        match attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => attributes.push((name, value)),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.0
            .attributes
            .lock()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn text_content(&self) -> Option<String> {
        self.0.text.lock().clone()
    }

    pub fn set_text_content(&self, text: impl Into<String>) {
        *self.0.text.lock() = Some(text.into());
    }

    /// `<tag attr="value">` for elements.
    pub fn opening_tag_text(&self) -> Option<String> {
        let tag = self.tag_name()?;
        let mut out = format!("<{tag}");
        for (name, value) in self.0.attributes.lock().iter() {
            out.push_str(&format!(" {name}=\"{}\"", value.replace('"', "&quot;")));
        }
        out.push('>');
        Some(out)
    }

    /// Append `child`, detaching it from its current parent first.
    pub fn append_child(&self, child: &Self) {
        if child.ptr_eq(self) {
            return;
        }
        child.detach();
        *child.0.parent.lock() = Arc::downgrade(&self.0);
        self.0.children.lock().push(child.clone());
    }

    pub fn detach(&self) {
        let parent = self.0.parent.lock().upgrade();
        if let Some(parent) = parent {
            parent.children.lock().retain(|c| !c.ptr_eq(self));
        }
        *self.0.parent.lock() = Weak::new();
    }

    pub fn parent(&self) -> Option<Self> {
        self.0.parent.lock().upgrade().map(Self)
    }

    pub fn children(&self) -> Vec<Self> {
        self.0.children.lock().clone()
    }

    pub fn child_count(&self) -> usize {
        self.0.children.lock().len()
    }

    pub fn set_bounds(&self, bounds: Rect) {
        *self.0.bounds.lock() = bounds;
    }

    pub fn bounds(&self) -> Rect {
        *self.0.bounds.lock()
    }

    /// The node's own box, or the union of its children's boxes when its own
    /// box is degenerate.
    pub fn layout_envelope(&self) -> Rect {
        let own = self.bounds();
        if !own.is_degenerate() {
            return own;
        }
        self.children()
            .iter()
            .map(Self::layout_envelope)
            .fold(own, Rect::union)
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The node's access key, minting it on first use.
    pub(crate) fn access_key(&self, mint: impl FnOnce() -> String) -> String {
        self.0.access_key.get_or_init(mint).clone()
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }

    pub(crate) fn any_ref(&self) -> AnyRef {
        self.0.clone()
    }

    pub(crate) fn from_any(any: AnyRef) -> Result<Self, AnyRef> {
        any.downcast::<NodeInner>().map(Self)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opening_tag_text() {
            Some(tag) => f.write_str(&tag),
            None => write!(f, "#{:?}", self.kind()),
        }
    }
}

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }
}

/// A node living in another context.
#[derive(Clone)]
pub struct RemoteNode {
    /// Access key; resolvable by any context in the owner's group.
    pub handle: String,
    pub kind: NodeKind,
    pub tag_name: Option<String>,
    pub opening_tag_text: Option<String>,
    pub child_count: u32,
    pub(crate) get_children: Option<Function>,
}

impl RemoteNode {
    /// Fetch the node's children from its owner.
    ///
    /// # Errors
    /// Returns the value thrown by the owner, or a `TypeError` for a malformed
    /// reply.
    pub async fn children(&self) -> Result<Vec<Value>, Value> {
        let Some(get_children) = &self.get_children else {
            return Ok(Vec::new());
        };
        match get_children.call(Value::Undefined, Vec::new()).await? {
            Value::Array(children) => Ok(children.to_vec()),
            Value::Undefined => Ok(Vec::new()),
            other => Err(Value::type_error(format!(
                "expected child list, got {}",
                other.kind()
            ))),
        }
    }
}

impl fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNode")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("tag_name", &self.tag_name)
            .finish_non_exhaustive()
    }
}

struct RegistryEntry {
    node: WeakNode,
    children_handle: Option<String>,
}

/// Access keys minted by one context.
///
/// Entries hold nodes weakly; a key whose node has been dropped stays known
/// but resolves to nothing.
#[derive(Default)]
pub struct NodeRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &str, node: &Node) {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| RegistryEntry {
                node: node.downgrade(),
                children_handle: None,
            });
    }

    pub fn resolve(&self, key: &str) -> Option<Node> {
        self.entries.lock().get(key)?.node.upgrade()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose nodes are gone; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.node.upgrade().is_some());
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn children_handle(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key)?.children_handle.clone()
    }

    pub(crate) fn set_children_handle(&self, key: &str, handle: String) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.children_handle = Some(handle);
        }
    }
}

/// Contexts that share node access keys.
#[derive(Clone, Default)]
pub struct ContextGroup(Arc<GroupInner>);

#[derive(Default)]
struct GroupInner {
    registries: Mutex<Vec<Weak<NodeRegistry>>>,
    surfaces: Mutex<HashMap<String, Node>>,
}

impl ContextGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, registry: &Arc<NodeRegistry>) {
        let mut registries = self.0.registries.lock();
        registries.retain(|r| r.strong_count() > 0);
        if !registries
            .iter()
            .any(|r| std::ptr::eq(r.as_ptr(), Arc::as_ptr(registry)))
        {
            registries.push(Arc::downgrade(registry));
        }
    }

    /// Resolve an access key minted by any member context.
    pub fn resolve(&self, key: &str) -> Option<Node> {
        let registries: Vec<_> = self
            .0
            .registries
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        registries.iter().find_map(|r| r.resolve(key))
    }

    /// The surface identified by `marker`, created on first use.
    pub fn surface(&self, marker: &str) -> Node {
        self.0
            .surfaces
            .lock()
            .entry(marker.to_string())
            .or_insert_with(|| {
                let surface = Node::element("div");
                surface.set_attribute("data-context", marker);
                surface
            })
            .clone()
    }

    /// Move the node behind `key` onto the surface for `marker` and report
    /// its layout envelope; `None` when the key does not resolve.
    pub fn present(&self, key: &str, marker: &str) -> Option<Rect> {
        let node = self.resolve(key)?;
        self.surface(marker).append_child(&node);
        Some(node.layout_envelope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_child_relocates() {
        let a = Node::element("DIV");
        let b = Node::element("section");
        let child = Node::text("hi");
        a.append_child(&child);
        b.append_child(&child);
        assert_eq!(a.child_count(), 0);
        assert_eq!(b.child_count(), 1);
        assert!(child.parent().is_some_and(|p| p.ptr_eq(&b)));
        assert_eq!(a.tag_name(), Some("div"));
    }

    #[test]
    fn opening_tag_includes_attributes() {
        let node = Node::element("a");
        node.set_attribute("href", "/x");
        node.set_attribute("title", "say \"hi\"");
        assert_eq!(
            node.opening_tag_text().as_deref(),
            Some("<a href=\"/x\" title=\"say &quot;hi&quot;\">")
        );
        assert_eq!(Node::text("t").opening_tag_text(), None);
    }

    #[test]
    fn degenerate_box_uses_children_union() {
        let parent = Node::element("span");
        let first = Node::element("b");
        first.set_bounds(Rect::new(10.0, 10.0, 5.0, 5.0));
        let second = Node::element("i");
        second.set_bounds(Rect::new(20.0, 0.0, 10.0, 5.0));
        parent.append_child(&first);
        parent.append_child(&second);
        assert_eq!(parent.layout_envelope(), Rect::new(10.0, 0.0, 20.0, 15.0));

        parent.set_bounds(Rect::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(parent.layout_envelope(), Rect::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn group_resolves_across_registries() {
        let group = ContextGroup::new();
        let first = Arc::new(NodeRegistry::new());
        let second = Arc::new(NodeRegistry::new());
        group.join(&first);
        group.join(&second);
        group.join(&second);

        let node = Node::element("canvas");
        node.set_bounds(Rect::new(0.0, 0.0, 300.0, 150.0));
        second.register("k1", &node);

        assert_eq!(
            group.present("k1", "m"),
            Some(Rect::new(0.0, 0.0, 300.0, 150.0))
        );
        assert!(node.parent().is_some_and(|p| p.ptr_eq(&group.surface("m"))));
        assert_eq!(group.present("unknown", "m"), None);
    }

    #[test]
    fn registry_keys_outlive_nodes() {
        let registry = NodeRegistry::new();
        let node = Node::element("p");
        registry.register("k", &node);
        assert!(registry.resolve("k").is_some());
        drop(node);
        assert!(registry.contains("k"));
        assert!(registry.resolve("k").is_none());
        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
    }
}
