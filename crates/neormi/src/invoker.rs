//! # Invokers and Proxies
//!
//! The calling side of a remote binding.
//!
//! - `Invoker`: turns a method reference plus arguments into an `Invocation`.
//!   Names are resolved against the binding's method table before anything is
//!   sent, so an unknown method fails without wire traffic.
//! - `Invocation`: the correlation cell of one call, plus what was called.
//! - `Proxy`: a synchronous facade over an invoker, and the form the peer's
//!   objects take when they arrive as arguments or results.
//!
//! One-way methods are never correlated: their invocation completes with
//! `Value::Null` as soon as the transport accepts the message.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::binding::BindingId;
use crate::connection::Link;
use crate::fault::Fault;
use crate::interface::Catalog;
use crate::interface::MethodId;
use crate::interface::MethodTable;
use crate::message::InvocationMessage;
use crate::message::Message;
use crate::message::Payload;
use crate::request::Request;
use crate::substitute::Substitute;
use crate::transport::ChannelId;
use crate::value::Owner;
use crate::value::Reference;
use crate::value::Value;

pub use crate::request::Error;
pub use crate::request::Result;

/// What the calling side knows about a binding on the peer.
#[derive(Clone, Debug)]
pub struct RemoteBinding {
    dynamic: bool,
    id: BindingId,
    table: MethodTable,
}

impl RemoteBinding {
    pub fn new(dynamic: bool, id: BindingId, table: MethodTable) -> Self {
        Self { dynamic, id, table }
    }

    /// Rebuilds the peer's method table from the interface names in `reference`.
    pub fn from_reference(
        reference: &Reference,
        catalog: &Catalog,
    ) -> std::result::Result<Self, Fault> {
        let interfaces = catalog.resolve(&reference.interfaces)?;
        Ok(Self::new(reference.dynamic, reference.binding_id, MethodTable::new(interfaces)))
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn table(&self) -> &MethodTable {
        &self.table
    }
}

/// A method, by id or by (optionally qualified) name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MethodRef<'a> {
    Id(MethodId),
    Name(&'a str),
}

impl From<MethodId> for MethodRef<'_> {
    fn from(id: MethodId) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a str> for MethodRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

/// Client-side representative of one remote binding.
#[derive(Clone)]
pub struct Invoker {
    link: Arc<Link>,
    binding: Arc<RemoteBinding>,
    timeout: Option<Duration>,
}

impl Invoker {
    pub(crate) fn new(link: Arc<Link>, binding: RemoteBinding) -> Self {
        let timeout = link.default_timeout();
        Self {
            link,
            binding: Arc::new(binding),
            timeout,
        }
    }

    pub fn binding(&self) -> &RemoteBinding {
        &self.binding
    }

    pub fn channel_id(&self) -> ChannelId {
        self.link.channel_id()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Overrides the timeout of `call` and of proxies created afterwards.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Starts a call. Never blocks.
    pub fn invoke<'a>(&self, method: impl Into<MethodRef<'a>>, args: Vec<Value>) -> Invocation {
        let id = match method.into() {
            MethodRef::Id(id) => id,
            MethodRef::Name(name) => match self.binding.table.resolve(name) {
                Some(id) => id,
                None => {
                    let fault = Fault::UnknownMethod(format!(
                        "'{}' is not a method of {}",
                        name, self.binding.id
                    ));
                    return self.failed(None, args, fault);
                }
            },
        };

        let Some(entry) = self.binding.table.get(id) else {
            return self.failed(Some(id), args, Fault::unknown_method_id(id));
        };
        let oneway = entry.method.oneway;

        let arguments = match args
            .iter()
            .cloned()
            .map(|arg| self.link.outbound(arg))
            .collect::<std::result::Result<Vec<_>, _>>()
        {
            Ok(arguments) => arguments,
            Err(fault) => return self.failed(Some(id), args, fault),
        };

        let message = InvocationMessage {
            dynamic: self.binding.dynamic,
            binding_id: self.binding.id,
            method_id: id,
            arguments,
        };

        let request = if oneway {
            let request = Request::new();
            let (done, link) = (request.clone(), self.link.clone());
            self.link
                .send(Message::Oneway(message))
                .on_complete(move |delivery| {
                    link.settle(done, delivery.clone().map(|()| Value::Null));
                });
            request
        } else {
            self.link.request(Payload::Invoke(message))
        };

        Invocation { request, invoker: self.clone(), method: Some(id), args }
    }

    /// Shorthand for `invoke` by id.
    pub fn invoke_id(&self, method: MethodId, args: Vec<Value>) -> Invocation {
        self.invoke(method, args)
    }

    /// Invokes and blocks for the result, up to the invoker's timeout.
    pub fn call<'a>(&self, method: impl Into<MethodRef<'a>>, args: Vec<Value>) -> Result<Value> {
        self.invoke(method, args).wait(self.timeout)
    }

    /// A proxy that shares this invoker's connection, binding and timeout.
    pub fn proxy(&self) -> Proxy {
        Proxy { invoker: self.clone() }
    }

    fn failed(&self, method: Option<MethodId>, args: Vec<Value>, fault: Fault) -> Invocation {
        tracing::warn!(
            channel = %self.channel_id(),
            binding = %self.binding.id,
            %fault,
            "invocation failed before sending"
        );
        Invocation {
            request: Request::failed(fault),
            invoker: self.clone(),
            method,
            args,
        }
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("channel", &self.channel_id())
            .field("binding", &self.binding.id)
            .field("dynamic", &self.binding.dynamic)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// One outstanding remote call.
///
/// Dereferences to its correlation cell. Dropping it does not cancel the call.
pub struct Invocation {
    request: Request<Value>,
    invoker: Invoker,
    method: Option<MethodId>,
    args: Vec<Value>,
}

impl Invocation {
    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// `None` if the method name could not be resolved.
    pub fn method(&self) -> Option<MethodId> {
        self.method
    }

    /// The arguments as passed in, before substitution.
    pub fn arguments(&self) -> &[Value] {
        &self.args
    }

    pub fn request(&self) -> &Request<Value> {
        &self.request
    }

    pub fn into_request(self) -> Request<Value> {
        self.request
    }
}

impl Deref for Invocation {
    type Target = Request<Value>;

    fn deref(&self) -> &Self::Target {
        &self.request
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("binding", &self.invoker.binding.id)
            .field("method", &self.method)
            .field("request", &self.request)
            .finish()
    }
}

/// A local stand-in for an object that lives on the peer.
#[derive(Clone)]
pub struct Proxy {
    invoker: Invoker,
}

impl Proxy {
    /// Calls a method and blocks for its result, up to the invoker's timeout.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.invoker.call(method, args)
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub fn channel_id(&self) -> ChannelId {
        self.invoker.channel_id()
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.invoker.binding.table.implements(interface)
    }

    /// The descriptor for the proxied binding, seen from `owner`'s side.
    pub fn reference(&self, owner: Owner) -> Reference {
        Reference {
            owner,
            dynamic: self.invoker.binding.dynamic,
            binding_id: self.invoker.binding.id,
            interfaces: self.invoker.binding.table.interface_names(),
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id() == other.channel_id()
            && self.invoker.binding.dynamic == other.invoker.binding.dynamic
            && self.invoker.binding.id == other.invoker.binding.id
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proxy({} {} {})",
            self.channel_id(),
            if self.invoker.binding.dynamic { "dynamic" } else { "static" },
            self.invoker.binding.id
        )
    }
}
