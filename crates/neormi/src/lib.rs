//! # NeoRMI
//!
//! Remote method invocation between two peers over an abstract duplex channel.
//!
//! ## Architecture
//!
//! - **Correlation**: `Request` is the single-assignment cell every
//!   asynchronous exchange resolves through.
//! - **Publication**: `Binding`s expose local `Remote` objects through
//!   explicit method tables, held in a node-wide `StaticRegistry` (by name) or
//!   a per-connection `DynamicRegistry` (objects that crossed the wire).
//! - **Calling**: `Invoker`s and `Proxy`s turn method calls into requests.
//! - **Dispatch**: each `Connection` pumps its transport, executes inbound
//!   invocations on the node's executor (serialized per method where declared
//!   ordered) and matches responses to pending requests.
//! - **Substitution**: objects and proxies cross the wire as `Reference`s and
//!   are resolved back on arrival, so identity survives a round trip.

pub mod binding;
pub mod connection;
pub mod executor;
pub mod fault;
pub mod interface;
pub mod invoker;
pub mod memory;
pub mod message;
pub mod node;
pub mod ordered;
pub mod registry;
pub mod request;
pub mod substitute;
pub mod transport;
pub mod value;

pub use binding::Binding;
pub use binding::BindingId;
pub use binding::Call;
pub use binding::RegistryKind;
pub use binding::Remote;
pub use connection::Connection;
pub use connection::ConnectionState;
pub use connection::InvokerFactory;
pub use fault::Fault;
pub use interface::Interface;
pub use interface::Method;
pub use interface::MethodId;
pub use invoker::Invocation;
pub use invoker::Invoker;
pub use invoker::Proxy;
pub use node::Node;
pub use node::NodeBuilder;
pub use request::Request;
pub use value::Value;
