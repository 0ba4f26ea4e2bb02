//! # Values
//!
//! `Value` is the dynamic argument and result type of every invocation.
//! Plain data crosses the wire as-is. Remote-capable objects and proxies are
//! live handles that must be substituted with a `Reference` before a message
//! leaves the process (see `substitute`).

use std::sync::Arc;

use crate::binding::BindingId;
use crate::binding::Remote;
use crate::fault::Fault;
use crate::invoker::Proxy;

/// Which peer owns the binding a reference points at, relative to the message
/// that carries it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Owner {
    /// The object lives on the peer that sent the message.
    Sender,
    /// The object lives on the peer receiving the message ("your object, coming back").
    Receiver,
}

/// Wire-safe stand-in for a remote-capable object.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Reference {
    pub owner: Owner,
    pub dynamic: bool,
    pub binding_id: BindingId,
    /// Interface names, in method-table order.
    pub interfaces: Vec<String>,
}

/// A dynamically typed invocation value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    /// A local object that can be called remotely.
    Object(Arc<dyn Remote>),
    /// A handle to an object that lives on the peer.
    Proxy(Proxy),
    /// A reference descriptor, as it appears on the wire.
    Ref(Reference),
}

impl Value {
    /// Wraps a local object so it can be passed by reference.
    pub fn object(target: impl Remote) -> Self {
        Self::Object(Arc::new(target))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn Remote>> {
        match self {
            Self::Object(target) => Some(target),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Looks up a key in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// True if the value contains no live objects or proxies.
    pub fn is_wire_safe(&self) -> bool {
        match self {
            Self::Object(_) | Self::Proxy(_) => false,
            Self::List(items) => items.iter().all(Value::is_wire_safe),
            Self::Map(entries) => entries.iter().all(|(_, v)| v.is_wire_safe()),
            _ => true,
        }
    }

    /// Rebuilds the value, passing every non-container leaf through `f`.
    pub fn rewrite<F>(self, f: &mut F) -> Result<Value, Fault>
    where
        F: FnMut(Value) -> Result<Value, Fault>,
    {
        match self {
            Self::List(items) => items
                .into_iter()
                .map(|item| item.rewrite(f))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Self::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| v.rewrite(f).map(|v| (k, v)))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Map),
            leaf => f(leaf),
        }
    }
}

/// Identity of the allocation behind a remote object, ignoring the vtable.
pub(crate) fn object_key(target: &Arc<dyn Remote>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => object_key(a) == object_key(b),
            (Self::Proxy(a), Self::Proxy(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Int(v) => write!(f, "Int({})", v),
            Self::Float(v) => write!(f, "Float({})", v),
            Self::Str(s) => write!(f, "Str({:?})", s),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Map(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Self::Object(target) => write!(f, "Object({:#x})", object_key(target)),
            Self::Proxy(proxy) => write!(f, "{:?}", proxy),
            Self::Ref(r) => write!(f, "{:?}", r),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<Proxy> for Value {
    fn from(v: Proxy) -> Self {
        Self::Proxy(v)
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Self::Ref(v)
    }
}
