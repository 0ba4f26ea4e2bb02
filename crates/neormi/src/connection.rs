//! # Connection Dispatcher
//!
//! Routes messages of one connection in both directions.
//!
//! ## Architecture
//!
//! - **Pump**: A task reads the transport and dispatches each message:
//!   requests and one-way invocations go to their binding, responses complete
//!   the pending request with the same token.
//! - **Writer**: A task owns outbound delivery, so messages reach the
//!   transport in the order they were submitted. Each send reports through a
//!   `Request<()>`. A lost link closes the whole connection.
//! - **Executor**: Invocations and the completion of pending requests run on
//!   the connection's executor, never on the pump, so a target or a callback
//!   may block on another call over the same connection.
//! - **Substitution**: The link is the connection's `Substitute`: it owns the
//!   dynamic registry that local objects are published in, and materializes
//!   proxies for the peer's objects.
//!
//! ## Lifecycle
//!
//! `Established` on open, `Active` once a message flows, `Closed` when either
//! side hangs up. Closing fails every pending request with
//! `Fault::ConnectionClosed` and discards the dynamic registry.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::binding::Binding;
use crate::binding::BindingId;
use crate::executor::Executor;
use crate::fault::Fault;
use crate::invoker::Invoker;
use crate::invoker::Proxy;
use crate::invoker::RemoteBinding;
use crate::message::InvocationMessage;
use crate::message::Message;
use crate::message::Payload;
use crate::message::Token;
use crate::node::Shared;
use crate::registry::DynamicRegistry;
use crate::registry::StaticRegistry;
use crate::request;
use crate::request::Outcome;
use crate::request::Request;
use crate::substitute;
use crate::substitute::Substitute;
use crate::transport;
use crate::transport::ChannelId;
use crate::transport::Transport;
use crate::value::Owner;
use crate::value::Reference;
use crate::value::Value;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, nothing exchanged yet.
    Established,
    Active,
    Closed,
}

type Outbound = (Message, Request<()>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-connection dispatcher state.
pub(crate) struct Link {
    this: Weak<Link>,
    channel: ChannelId,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    executor: Arc<dyn Executor>,
    dynamics: DynamicRegistry,
    pending: DashMap<Token, Request<Value>>,
    next_token: AtomicU64,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    closing: Notify,
}

impl Link {
    /// Registers the connection with its node and spawns its pump and writer.
    pub(crate) fn open(
        shared: Arc<Shared>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        handle: &Handle,
    ) -> Arc<Self> {
        let channel = transport.channel_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let link = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            channel,
            transport: transport.clone(),
            shared,
            executor,
            dynamics: DynamicRegistry::new(),
            pending: DashMap::new(),
            next_token: AtomicU64::new(1),
            state: Mutex::new(ConnectionState::Established),
            outbound: Mutex::new(Some(tx)),
            closing: Notify::new(),
        });
        link.shared.connections.insert(channel, link.clone());

        handle.spawn(Self::write_loop(Arc::downgrade(&link), transport, rx));
        handle.spawn(Self::pump(link.clone()));

        tracing::debug!(channel = %channel, "connection established");
        link
    }

    async fn write_loop(
        link: Weak<Self>,
        transport: Arc<dyn Transport>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let channel = transport.channel_id();
        while let Some((message, delivery)) = rx.recv().await {
            match transport.send(message).await {
                Ok(()) => {
                    delivery.succeed(());
                }
                // The message itself was unsendable; the link is still usable.
                Err(e @ transport::Error::Io(_)) => {
                    tracing::warn!(channel = %channel, error = %e, "send failed");
                    delivery.fail(e.into());
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "link lost while sending");
                    let reason = e.to_string();
                    delivery.fail(e.into());
                    if let Some(link) = link.upgrade() {
                        link.shutdown(&reason);
                    }
                }
            }
        }
        tracing::debug!(channel = %channel, "writer stopped");
    }

    async fn pump(link: Arc<Self>) {
        let reason = loop {
            tokio::select! {
                received = link.transport.recv() => match received {
                    Ok(Some(message)) => link.handle(message),
                    Ok(None) => break "peer closed the channel".to_string(),
                    Err(e) => {
                        tracing::warn!(
                            channel = %link.channel,
                            error = %e,
                            "transport error in pump"
                        );
                        break e.to_string();
                    }
                },
                _ = link.closing.notified() => break "closed locally".to_string(),
            }
        };

        link.shutdown(&reason);
        link.transport.close().await;
    }

    pub(crate) fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.shared.config.timeout
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn activate(&self) {
        let mut state = lock(&self.state);
        if *state == ConnectionState::Established {
            *state = ConnectionState::Active;
        }
    }

    /// Closes the connection. Idempotent.
    pub(crate) fn shutdown(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        self.closing.notify_one();
        // Queued messages still drain; nothing new is accepted.
        lock(&self.outbound).take();
        self.shared.connections.remove(&self.channel);

        let tokens: Vec<Token> = self.pending.iter().map(|e| *e.key()).collect();
        let failed = tokens.len();
        for token in tokens {
            if let Some((_, request)) = self.pending.remove(&token) {
                self.settle(request, Err(Fault::ConnectionClosed));
            }
        }

        let dropped = self.dynamics.unbind_all();
        tracing::debug!(
            channel = %self.channel,
            reason,
            failed,
            dropped = dropped.len(),
            "connection closed"
        );
    }

    /// Queues a message for the writer.
    pub(crate) fn send(&self, message: Message) -> Request<()> {
        let delivery = Request::new();
        let queued = match &*lock(&self.outbound) {
            Some(tx) => tx.send((message, delivery.clone())).is_ok(),
            None => false,
        };
        if queued {
            self.activate();
        } else {
            delivery.fail(Fault::ConnectionClosed);
        }
        delivery
    }

    /// Sends a correlated request; the returned cell completes with the
    /// peer's response, already substituted for local use.
    pub(crate) fn request(&self, payload: Payload) -> Request<Value> {
        let request = Request::new();
        if self.state() == ConnectionState::Closed {
            request.fail(Fault::ConnectionClosed);
            return request;
        }

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.pending.insert(token, request.clone());

        // A shutdown between the check above and the insert would miss this entry.
        if self.state() == ConnectionState::Closed {
            if let Some((_, request)) = self.pending.remove(&token) {
                request.fail(Fault::ConnectionClosed);
            }
            return request;
        }

        let this = self.this.clone();
        self.send(Message::Request { token, payload }).on_complete(move |delivery| {
            if let Err(fault) = delivery {
                if let Some(link) = this.upgrade() {
                    if let Some((_, request)) = link.pending.remove(&token) {
                        link.settle(request, Err(fault.clone()));
                    }
                }
            }
        });
        request
    }

    /// Completes a caller-visible request on the executor, so its callbacks
    /// never run on the pump or the writer.
    pub(crate) fn settle(&self, request: Request<Value>, outcome: Outcome<Value>) {
        self.executor.execute(Box::new(move || {
            request.complete(outcome);
        }));
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn binding(&self, dynamic: bool, id: BindingId) -> Option<Arc<Binding>> {
        if dynamic {
            self.dynamics.get(id)
        } else {
            self.shared.statics.get(id)
        }
    }

    fn handle(self: &Arc<Self>, message: Message) {
        self.activate();
        match message {
            Message::Request { token, payload: Payload::Invoke(invocation) } => {
                self.handle_invoke(token, invocation)
            }
            Message::Request { token, payload: Payload::Lookup(name) } => {
                self.handle_lookup(token, &name)
            }
            Message::Oneway(invocation) => self.handle_oneway(invocation),
            Message::Response { token, outcome } => self.handle_response(token, outcome),
        }
    }

    fn handle_invoke(self: &Arc<Self>, token: Token, invocation: InvocationMessage) {
        let reply = Request::new();
        let link = self.clone();
        reply.on_complete(move |outcome| link.respond(token, outcome.clone()));

        let (dynamic, id) = (invocation.dynamic, invocation.binding_id);
        let Some(binding) = self.binding(dynamic, id) else {
            tracing::warn!(channel = %self.channel, binding = %id, dynamic, "binding not found");
            reply.fail(Fault::BindingNotFound { dynamic, id });
            return;
        };

        let substitute: Arc<dyn Substitute> = self.clone();
        let (method, args) = (invocation.method_id, invocation.arguments);
        let executor = self.executor.as_ref();
        if let Err(fault) = binding.execute(executor, substitute, Some(reply), method, args) {
            tracing::warn!(channel = %self.channel, binding = %id, %fault, "invocation rejected");
        }
    }

    fn handle_oneway(self: &Arc<Self>, invocation: InvocationMessage) {
        let (dynamic, id) = (invocation.dynamic, invocation.binding_id);
        let Some(binding) = self.binding(dynamic, id) else {
            tracing::warn!(
                channel = %self.channel,
                binding = %id,
                dynamic,
                "one-way invocation for unknown binding dropped"
            );
            return;
        };

        let substitute: Arc<dyn Substitute> = self.clone();
        let (method, args) = (invocation.method_id, invocation.arguments);
        match binding.execute(self.executor.as_ref(), substitute, None, method, args) {
            Ok(()) => {}
            Err(fault @ Fault::IllegalState(_)) => {
                tracing::error!(
                    channel = %self.channel,
                    binding = %id,
                    %fault,
                    "one-way invocation of a value method"
                );
            }
            Err(fault) => {
                tracing::warn!(
                    channel = %self.channel,
                    binding = %id,
                    %fault,
                    "one-way invocation dropped"
                );
            }
        }
    }

    fn handle_lookup(&self, token: Token, name: &str) {
        let outcome = match self.shared.statics.lookup(name) {
            Some(binding) => Ok(Value::Ref(binding.reference(Owner::Sender))),
            None => {
                tracing::warn!(channel = %self.channel, name, "lookup of unbound name");
                Err(Fault::NameNotFound(name.to_string()))
            }
        };
        self.respond(token, outcome);
    }

    fn handle_response(&self, token: Token, outcome: Result<Value, Fault>) {
        let Some((_, request)) = self.pending.remove(&token) else {
            tracing::debug!(
                channel = %self.channel,
                token = %token,
                "late or duplicate response ignored"
            );
            return;
        };
        let outcome = outcome.and_then(|value| self.inbound(value));
        self.settle(request, outcome);
    }

    fn respond(&self, token: Token, outcome: Result<Value, Fault>) {
        let channel = self.channel;
        self.send(Message::Response { token, outcome }).on_complete(move |delivery| {
            if let Err(fault) = delivery {
                tracing::warn!(
                    channel = %channel,
                    token = %token,
                    %fault,
                    "response not delivered"
                );
            }
        });
    }

    fn materialize(&self, reference: &Reference) -> Result<Value, Fault> {
        let link = self.this.upgrade().ok_or(Fault::ConnectionClosed)?;
        let remote = RemoteBinding::from_reference(reference, &self.shared.catalog)?;
        Ok(Value::Proxy(Invoker::new(link, remote).proxy()))
    }
}

impl Substitute for Link {
    fn inbound(&self, value: Value) -> Result<Value, Fault> {
        substitute::import(value, &self.shared.statics, &self.dynamics, &|reference: &Reference| {
            self.materialize(reference)
        })
    }

    fn outbound(&self, value: Value) -> Result<Value, Fault> {
        substitute::export(value, self.channel, &self.dynamics)
    }
}

/// Handle to an open connection.
#[derive(Clone)]
pub struct Connection {
    link: Arc<Link>,
}

impl Connection {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.link.channel
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Fails all pending requests, discards dynamic bindings and hangs up.
    pub fn close(&self) {
        self.link.shutdown("closed locally");
    }

    /// Requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.link.pending_count()
    }

    pub fn invoker_factory(&self) -> InvokerFactory {
        InvokerFactory { link: self.link.clone() }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.link.channel)
            .field("state", &self.link.state())
            .field("pending", &self.link.pending_count())
            .finish()
    }
}

/// Creates invokers and proxies for the peer's objects.
#[derive(Clone)]
pub struct InvokerFactory {
    link: Arc<Link>,
}

impl InvokerFactory {
    pub fn channel_id(&self) -> ChannelId {
        self.link.channel
    }

    /// Builds an invoker for a reference received from the peer.
    pub fn invoker(&self, reference: &Reference) -> Result<Invoker, Fault> {
        let remote = RemoteBinding::from_reference(reference, &self.link.shared.catalog)?;
        Ok(Invoker::new(self.link.clone(), remote))
    }

    /// Asks the peer to resolve `name`. Completes with a `Value::Proxy`.
    pub fn lookup(&self, name: &str) -> Request<Value> {
        self.link.request(Payload::Lookup(name.to_string()))
    }

    /// Blocks for a proxy to the object the peer bound under `name`.
    pub fn lookup_proxy(&self, name: &str) -> request::Result<Proxy> {
        let value = self.lookup(name).wait(self.link.default_timeout())?;
        Ok(expect_proxy(value)?)
    }

    pub fn lookup_invoker(&self, name: &str) -> request::Result<Invoker> {
        self.lookup_proxy(name).map(|proxy| proxy.invoker().clone())
    }

    /// Like `lookup_invoker`, without blocking a thread. No timeout applies.
    pub async fn lookup_invoker_async(&self, name: &str) -> Result<Invoker, Fault> {
        let value = self.lookup(name).completion().await?;
        expect_proxy(value).map(|proxy| proxy.invoker().clone())
    }

    /// The node-wide registry the peer's lookups resolve against.
    pub fn static_registry(&self) -> &StaticRegistry {
        &self.link.shared.statics
    }

    /// Objects published implicitly on this connection.
    pub fn dynamic_registry(&self) -> &DynamicRegistry {
        &self.link.dynamics
    }
}

fn expect_proxy(value: Value) -> Result<Proxy, Fault> {
    match value {
        Value::Proxy(proxy) => Ok(proxy),
        other => Err(Fault::MalformedReference(format!(
            "lookup returned {:?} instead of a proxy",
            other
        ))),
    }
}
