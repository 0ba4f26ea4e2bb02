//! # Node
//!
//! The hosting surface of the engine: one static registry, one interface
//! catalog, one method-invocation executor, and any number of connections.
//!
//! ## Architecture
//!
//! - **NodeBuilder**: Fluent configuration (executor, default timeout,
//!   pre-registered interfaces).
//! - **Shared**: Node state every connection holds on to.
//! - **Connections**: Tracked by `ChannelId` until they close.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;

use crate::binding;
use crate::binding::Binding;
use crate::binding::BindingId;
use crate::binding::Remote;
use crate::connection::Connection;
use crate::connection::InvokerFactory;
use crate::connection::Link;
use crate::executor::BlockingPool;
use crate::executor::Executor;
use crate::interface;
use crate::interface::Catalog;
use crate::interface::Interface;
use crate::registry::StaticRegistry;
use crate::transport::ChannelId;
use crate::transport::Transport;

/// Default for synchronous calls and proxies.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum Error {
    Bind(binding::Error),
    Interface(interface::Error),
    /// `connect` was called outside of a tokio runtime.
    NoRuntime,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "Bind error: {}", e),
            Self::Interface(e) => write!(f, "Interface error: {}", e),
            Self::NoRuntime => write!(f, "No tokio runtime to drive the connection"),
        }
    }
}

impl std::error::Error for Error {}

impl From<binding::Error> for Error {
    fn from(e: binding::Error) -> Self {
        Self::Bind(e)
    }
}

impl From<interface::Error> for Error {
    fn from(e: interface::Error) -> Self {
        Self::Interface(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Snapshot of a node's settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Default timeout of synchronous calls. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self { timeout: Some(DEFAULT_TIMEOUT) }
    }
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    /// Explicitly configured executor; connections default to their runtime's blocking pool.
    pub(crate) executor: Option<Arc<dyn Executor>>,
    pub(crate) statics: StaticRegistry,
    pub(crate) catalog: Catalog,
    pub(crate) connections: DashMap<ChannelId, Arc<Link>>,
}

pub struct NodeBuilder {
    config: Config,
    executor: Option<Arc<dyn Executor>>,
    interfaces: Vec<Arc<Interface>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            executor: None,
            interfaces: Vec::new(),
        }
    }

    /// Where inbound invocations and response callbacks run. Defaults to the
    /// blocking pool of the runtime each connection is opened on.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Makes an interface definition known, so references carrying it can be resolved.
    pub fn interface(mut self, interface: Arc<Interface>) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn build(self) -> Result<Node> {
        let catalog = Catalog::new();
        for interface in self.interfaces {
            catalog.register(interface)?;
        }

        Ok(Node {
            shared: Arc::new(Shared {
                config: self.config,
                executor: self.executor,
                statics: StaticRegistry::new(),
                catalog,
                connections: DashMap::new(),
            }),
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of the invocation engine.
///
/// Cheap to clone; clones share registries and connections.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub fn static_registry(&self) -> &StaticRegistry {
        &self.shared.statics
    }

    /// Publishes `target` under `name` with all of its non-local interfaces.
    pub fn bind(&self, name: impl Into<String>, target: Arc<dyn Remote>) -> Result<Arc<Binding>> {
        let exposed = binding::exposed_interfaces(target.as_ref(), None)?;
        self.register_interfaces(&exposed)?;
        Ok(self.shared.statics.bind_as(name, target, exposed)?)
    }

    /// Publishes `target` under `name`, exposing exactly `interfaces`.
    pub fn bind_as(
        &self,
        name: impl Into<String>,
        target: Arc<dyn Remote>,
        interfaces: Vec<Arc<Interface>>,
    ) -> Result<Arc<Binding>> {
        let exposed = binding::exposed_interfaces(target.as_ref(), Some(interfaces))?;
        self.register_interfaces(&exposed)?;
        Ok(self.shared.statics.bind_as(name, target, exposed)?)
    }

    /// Checks every interface against the catalog before any is added, so a
    /// conflict leaves both the catalog and the registry untouched.
    fn register_interfaces(&self, interfaces: &[Arc<Interface>]) -> Result<()> {
        for interface in interfaces {
            self.shared.catalog.check(interface)?;
        }
        for interface in interfaces {
            self.shared.catalog.register(interface.clone())?;
        }
        Ok(())
    }

    pub fn unbind(&self, id: BindingId) -> Option<Arc<Binding>> {
        self.shared.statics.unbind(id)
    }

    /// Looks up a local binding by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Binding>> {
        self.shared.statics.lookup(name)
    }

    /// Starts serving a transport. Must be called from within a tokio runtime.
    ///
    /// Without a configured executor, the connection runs invocations on the
    /// blocking pool of this runtime.
    pub fn connect(&self, transport: impl Transport) -> Result<Connection> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let executor: Arc<dyn Executor> = match &self.shared.executor {
            Some(executor) => executor.clone(),
            None => Arc::new(BlockingPool::new(handle.clone())),
        };
        let link = Link::open(self.shared.clone(), Arc::new(transport), executor, &handle);
        Ok(Connection::new(link))
    }

    pub fn connection(&self, channel: ChannelId) -> Option<Connection> {
        self.shared
            .connections
            .get(&channel)
            .map(|entry| Connection::new(entry.value().clone()))
    }

    pub fn invoker_factory(&self, channel: ChannelId) -> Option<InvokerFactory> {
        self.connection(channel).map(|c| c.invoker_factory())
    }

    /// Channels of all open connections.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.shared.connections.iter().map(|e| *e.key()).collect();
        channels.sort();
        channels
    }
}
