use std::sync::atomic::{AtomicU64, Ordering};

use super::SerializationContext;
use crate::{
    dom::{Node, RemoteNode},
    value::{Array, Function, Value},
    wire::DomNodeWire,
};

static NODE_KEYS: AtomicU64 = AtomicU64::new(0);

impl SerializationContext {
    /// Register `node` under its access key and describe it for the peer.
    pub(super) fn serialize_dom_node(&self, node: &Node) -> DomNodeWire {
        let key = node.access_key(|| {
            format!(
                "{}:node#{}",
                self.id(),
                NODE_KEYS.fetch_add(1, Ordering::Relaxed) + 1
            )
        });
        let nodes = &self.inner.nodes;
        nodes.register(&key, node);

        let get_children = match nodes.children_handle(&key) {
            Some(handle) if self.inner.functions.contains(&handle) => handle,
            _ => {
                let weak = node.downgrade();
                let children = Function::from_sync("getChildren", move |_, _| {
                    Ok(weak.upgrade().map_or(Value::Undefined, |node| {
                        Value::Array(Array::from_vec(
                            node.children().into_iter().map(Value::Node).collect(),
                        ))
                    }))
                });
                let handle = self
                    .inner
                    .functions
                    .pin(&children, Some(&Value::Node(node.clone())), false);
                nodes.set_children_handle(&key, handle.clone());
                handle
            }
        };

        DomNodeWire {
            handle: key,
            node_kind: node.kind(),
            tag_name: node.tag_name().map(str::to_string),
            opening_tag_text: node.opening_tag_text(),
            child_count: u32::try_from(node.child_count()).unwrap_or(u32::MAX),
            get_children: Some(get_children),
        }
    }

    /// Forward a node received from the peer, keeping its original key.
    pub(super) fn reexport_remote_node(&self, node: &RemoteNode) -> DomNodeWire {
        DomNodeWire {
            handle: node.handle.clone(),
            node_kind: node.kind,
            tag_name: node.tag_name.clone(),
            opening_tag_text: node.opening_tag_text.clone(),
            child_count: node.child_count,
            get_children: node.get_children.as_ref().map(|f| {
                self.inner
                    .functions
                    .serialize_function_primitive(f, None, "getChildren")
            }),
        }
    }

    /// Nodes minted here come back live; others become [`RemoteNode`]s.
    pub(super) fn deserialize_dom_node(&self, wire: &DomNodeWire) -> Value {
        if let Some(node) = self.inner.nodes.resolve(&wire.handle) {
            return Value::Node(node);
        }
        Value::RemoteNode(RemoteNode {
            handle: wire.handle.clone(),
            kind: wire.node_kind,
            tag_name: wire.tag_name.clone(),
            opening_tag_text: wire.opening_tag_text.clone(),
            child_count: wire.child_count,
            get_children: wire
                .get_children
                .as_deref()
                .map(|h| self.deserialize_function_primitive(h, "getChildren", None)),
        })
    }
}
