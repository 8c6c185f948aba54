//! Tagged wire representation of values.
//!
//! JSON-compatible scalars travel as themselves. Everything else is a map
//! carrying a `$t` tag. Untagged maps and lists decode as plain objects and
//! arrays, so peers that only speak plain data interoperate.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::dom::NodeKind;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Tagged(Box<Tagged>),
    /// Untagged map from a plain-data peer.
    Plain(IndexMap<String, WireValue>),
    /// Untagged list from a plain-data peer.
    List(Vec<WireValue>),
}

impl Default for WireValue {
    fn default() -> Self {
        Self::undefined()
    }
}

impl WireValue {
    pub fn undefined() -> Self {
        Self::tagged(Tagged::Undefined)
    }

    pub fn tagged(tagged: Tagged) -> Self {
        Self::Tagged(Box::new(tagged))
    }

    pub fn as_tagged(&self) -> Option<&Tagged> {
        match self {
            Self::Tagged(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.as_tagged(), Some(Tagged::Undefined))
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for WireValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$t", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Tagged {
    Undefined,
    BigInt {
        value: String,
    },
    Bytes {
        data: Bytes,
    },
    Array {
        id: u32,
        items: Vec<WireValue>,
    },
    Object {
        id: u32,
        props: Vec<(String, WireValue)>,
    },
    /// Instance of a user-defined class.
    Custom {
        id: u32,
        ctor_name: String,
        props: Vec<(String, WireValue)>,
    },
    Map {
        id: u32,
        entries: Vec<(WireValue, WireValue)>,
    },
    Set {
        id: u32,
        items: Vec<WireValue>,
    },
    /// Back-reference to a container seen earlier in the same value.
    Ref {
        id: u32,
    },
    Date {
        epoch_ms: f64,
    },
    RegExp {
        source: String,
        flags: String,
    },
    Url {
        href: String,
    },
    Error {
        name: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Function {
        handle: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_text: Option<String>,
    },
    /// A pending promise carries a `then` handle; a settled one embeds its
    /// outcome.
    Promise {
        #[serde(default)]
        handle: Option<String>,
        #[serde(default)]
        snapshot: PromiseSnapshot,
    },
    Iterable {
        handle: String,
    },
    AsyncIterable {
        handle: String,
    },
    ReadableStream {
        handle: String,
    },
    DomNode(DomNodeWire),
    Symbol {
        #[serde(default)]
        known_name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Request(RequestWire),
    Response(ResponseWire),
    Window {
        description: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromiseSnapshot {
    /// `None` while pending.
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub value: WireValue,
    #[serde(default)]
    pub error: WireValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomNodeWire {
    /// Access key in the owner's registry.
    pub handle: String,
    pub node_kind: NodeKind,
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub opening_tag_text: Option<String>,
    pub child_count: u32,
    #[serde(default)]
    pub get_children: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWire {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Stream handle of the body.
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseWire {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}
