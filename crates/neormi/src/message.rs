//! # Wire Messages
//!
//! The value-level shapes exchanged between peers. Byte encoding is left to
//! the transport; everything here is plain owned data once substitution has
//! replaced live objects with references.

use crate::binding::BindingId;
use crate::fault::Fault;
use crate::interface::MethodId;
use crate::value::Value;

/// Addresses one method of one binding on the receiving peer.
#[derive(Clone, Debug, PartialEq)]
pub struct InvocationMessage {
    pub dynamic: bool,
    pub binding_id: BindingId,
    pub method_id: MethodId,
    pub arguments: Vec<Value>,
}

impl InvocationMessage {
    pub fn is_wire_safe(&self) -> bool {
        self.arguments.iter().all(Value::is_wire_safe)
    }
}

/// Correlation token. Unique per connection and direction.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u64);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token-{}", self.0)
    }
}

/// What a correlated request asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Invoke(InvocationMessage),
    /// Resolve a name in the peer's static registry to a reference.
    Lookup(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Expects exactly one `Response` carrying the same token.
    Request { token: Token, payload: Payload },
    /// Fire-and-forget invocation; never answered.
    Oneway(InvocationMessage),
    Response { token: Token, outcome: Result<Value, Fault> },
}

impl Message {
    /// True if no live object or proxy is left anywhere in the message.
    pub fn is_wire_safe(&self) -> bool {
        match self {
            Self::Request { payload: Payload::Invoke(invocation), .. } => invocation.is_wire_safe(),
            Self::Request { payload: Payload::Lookup(_), .. } => true,
            Self::Oneway(invocation) => invocation.is_wire_safe(),
            Self::Response { outcome: Ok(value), .. } => value.is_wire_safe(),
            Self::Response { outcome: Err(_), .. } => true,
        }
    }
}
