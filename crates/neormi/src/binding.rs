//! # Bindings
//!
//! A `Binding` publishes one local object: its id, its method table and the
//! ordered-execution queues of its ordered methods. It also owns the
//! server-side execution path for invocations addressed to it.
//!
//! ## Architecture
//!
//! - **Remote**: The trait a target implements. It declares its interfaces
//!   explicitly and receives calls as `(interface, method, args)`, replacing
//!   runtime reflection with a table built once at bind time.
//! - **Execution**: `execute` validates the method id, then hands the work to
//!   the injected executor, through the method's ordered queue if it has one.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::executor::Executor;
use crate::executor::Task;
use crate::fault::Fault;
use crate::fault::panic_message;
use crate::interface::Interface;
use crate::interface::MethodId;
use crate::interface::MethodTable;
use crate::interface::Returns;
use crate::ordered::OrderedQueue;
use crate::request::Outcome;
use crate::request::Request;
use crate::substitute::Substitute;
use crate::value::Owner;
use crate::value::Reference;
use crate::value::Value;

/// Strong type for binding identifiers, unique within one registry.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingId(pub u64);

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

/// Which registry a binding belongs to.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum RegistryKind {
    Static,
    Dynamic,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Binding configuration errors. These are fatal to the bind call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A declared interface is not among those the target implements.
    InterfaceNotImplemented(String),
    /// A declared interface is marked local-only.
    LocalOnly(String),
    /// The target exposes no remote interface at all.
    NoRemoteInterfaces,
    /// The static registry already has a binding under this name.
    NameTaken(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InterfaceNotImplemented(name) => {
                write!(f, "interface '{}' is not implemented by the target", name)
            }
            Self::LocalOnly(name) => write!(f, "interface '{}' is local-only", name),
            Self::NoRemoteInterfaces => write!(f, "target exposes no remote interfaces"),
            Self::NameTaken(name) => write!(f, "name '{}' is already bound", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One incoming call, as seen by a target.
pub struct Call<'a> {
    pub interface: &'a str,
    pub method: &'a str,
    pub id: MethodId,
    pub args: Vec<Value>,
}

impl Call<'_> {
    pub fn arg(&self, index: usize) -> anyhow::Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| {
                anyhow::anyhow!("{}.{}: missing argument {}", self.interface, self.method, index)
            })
    }

    pub fn str_arg(&self, index: usize) -> anyhow::Result<&str> {
        self.arg(index)?
            .as_str()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{}.{}: argument {} is not a string",
                    self.interface,
                    self.method,
                    index
                )
            })
    }

    pub fn int_arg(&self, index: usize) -> anyhow::Result<i64> {
        self.arg(index)?
            .as_int()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{}.{}: argument {} is not an integer",
                    self.interface,
                    self.method,
                    index
                )
            })
    }
}

/// An object whose methods can be invoked from another process.
pub trait Remote: Send + Sync + 'static {
    /// Every interface this object implements, local-only ones included.
    fn interfaces(&self) -> Vec<Arc<Interface>>;

    /// An explicit subset to expose instead of all non-local interfaces.
    fn exposed(&self) -> Option<Vec<Arc<Interface>>> {
        None
    }

    /// Executes one call. Errors are delivered to the caller as the call's failure cause.
    fn invoke(&self, call: Call<'_>) -> anyhow::Result<Value>;

    /// Called after the object is added to a registry.
    fn bound_to(&self, _registry: RegistryKind, _id: BindingId) {}

    /// Called after the object is removed from a registry.
    fn unbound_from(&self, _registry: RegistryKind, _id: BindingId) {}
}

/// Computes the interfaces a binding of `target` exposes.
///
/// `declared` (or else `Remote::exposed`) selects the interfaces explicitly;
/// each one must be implemented by the target and must not be local-only.
/// Without a declaration, all non-local interfaces are exposed.
pub fn exposed_interfaces(
    target: &dyn Remote,
    declared: Option<Vec<Arc<Interface>>>,
) -> Result<Vec<Arc<Interface>>> {
    let implemented = target.interfaces();

    let exposed = match declared.or_else(|| target.exposed()) {
        Some(declared) => {
            for iface in &declared {
                if !implemented.iter().any(|i| **i == **iface) {
                    return Err(Error::InterfaceNotImplemented(iface.name().to_string()));
                }
                if iface.is_local_only() {
                    return Err(Error::LocalOnly(iface.name().to_string()));
                }
            }
            declared
        }
        None => implemented.into_iter().filter(|i| !i.is_local_only()).collect(),
    };

    if exposed.is_empty() {
        return Err(Error::NoRemoteInterfaces);
    }
    Ok(exposed)
}

/// A published local object.
pub struct Binding {
    id: BindingId,
    kind: RegistryKind,
    name: Option<String>,
    table: MethodTable,
    target: Arc<dyn Remote>,
    queues: HashMap<MethodId, Arc<OrderedQueue>>,
}

impl Binding {
    /// Builds a binding; see `exposed_interfaces` for how the interface set is chosen.
    pub fn new(
        id: BindingId,
        kind: RegistryKind,
        name: Option<String>,
        target: Arc<dyn Remote>,
        declared: Option<Vec<Arc<Interface>>>,
    ) -> Result<Self> {
        let table = MethodTable::new(exposed_interfaces(target.as_ref(), declared)?);
        let queues = table
            .entries()
            .iter()
            .filter(|e| e.method.ordered)
            .map(|e| (e.id, Arc::new(OrderedQueue::new())))
            .collect();

        Ok(Self { id, kind, name, table, target, queues })
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    pub fn is_dynamic(&self) -> bool {
        self.kind == RegistryKind::Dynamic
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn table(&self) -> &MethodTable {
        &self.table
    }

    pub fn target(&self) -> &Arc<dyn Remote> {
        &self.target
    }

    pub fn ordered_queue(&self, method: MethodId) -> Option<&Arc<OrderedQueue>> {
        self.queues.get(&method)
    }

    /// The descriptor that stands in for this binding's target on the wire.
    pub fn reference(&self, owner: Owner) -> Reference {
        Reference {
            owner,
            dynamic: self.is_dynamic(),
            binding_id: self.id,
            interfaces: self.table.interface_names(),
        }
    }

    /// Schedules one invocation of `method`.
    ///
    /// The outcome goes to `reply`. Without a reply only void methods may be
    /// invoked; anything else is an `IllegalState` error and nothing runs.
    /// Unknown method ids fail `reply` and return the same fault.
    ///
    /// Once scheduled, execution runs to completion even if the caller stops waiting.
    pub fn execute(
        &self,
        executor: &dyn Executor,
        substitute: Arc<dyn Substitute>,
        reply: Option<Request<Value>>,
        method: MethodId,
        args: Vec<Value>,
    ) -> std::result::Result<(), Fault> {
        let Some(entry) = self.table.get(method) else {
            let fault = Fault::unknown_method_id(method);
            tracing::warn!(binding = %self.id, method = %method, "method id does not exist");
            if let Some(reply) = reply {
                reply.fail(fault.clone());
            }
            return Err(fault);
        };

        if reply.is_none() && entry.method.returns != Returns::Void {
            return Err(Fault::IllegalState(format!(
                "{}.{} returns a value but no reply was requested",
                entry.interface, entry.method.name
            )));
        }

        let target = self.target.clone();
        let interface = entry.interface.clone();
        let name = entry.method.name.clone();
        let returns = entry.method.returns;
        let binding = self.id;

        let task: Task = Box::new(move || {
            let call = Call { interface: &interface, method: &name, id: method, args };
            let outcome = run_call(target.as_ref(), call, returns, substitute.as_ref());
            match reply {
                Some(reply) => {
                    reply.complete(outcome);
                }
                None => {
                    if let Err(fault) = outcome {
                        tracing::warn!(
                            binding = %binding,
                            method = %name,
                            %fault,
                            "one-way invocation failed"
                        );
                    }
                }
            }
        });

        match self.queues.get(&method) {
            Some(queue) => {
                if queue.submit(task) {
                    let queue = queue.clone();
                    executor.execute(Box::new(move || queue.run()));
                }
            }
            None => executor.execute(task),
        }
        Ok(())
    }
}

/// Resolves arguments, invokes the target and wraps the result for the wire.
fn run_call(
    target: &dyn Remote,
    mut call: Call<'_>,
    returns: Returns,
    substitute: &dyn Substitute,
) -> Outcome<Value> {
    call.args = std::mem::take(&mut call.args)
        .into_iter()
        .map(|arg| substitute.inbound(arg))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let (interface, method) = (call.interface, call.method);
    let result = match std::panic::catch_unwind(AssertUnwindSafe(|| target.invoke(call))) {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => {
            let fault = Fault::from_error(error);
            tracing::warn!(interface, method, %fault, "declared failure caught");
            return Err(fault);
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            tracing::warn!(interface, method, %reason, "target panicked");
            return Err(Fault::Panicked(reason));
        }
    };

    match returns {
        Returns::Void => Ok(Value::Null),
        Returns::Value => substitute.outbound(result),
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("interfaces", &self.table.interface_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use crate::executor::Inline;
    use crate::interface::Method;
    use crate::substitute::Passthrough;

    /// Spawns a thread per task.
    struct Threads;

    impl Executor for Threads {
        fn execute(&self, task: Task) {
            thread::spawn(task);
        }
    }

    fn greeter() -> Arc<Interface> {
        Interface::builder("Greeter")
            .method(Method::new("greet"))
            .method(Method::new("slow").ordered())
            .method(Method::void("touch"))
            .method(Method::new("fail"))
            .method(Method::new("explode"))
            .build()
            .unwrap()
    }

    fn admin() -> Arc<Interface> {
        Interface::builder("Admin")
            .method(Method::void("shutdown"))
            .local_only()
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct Host {
        seen: Mutex<Vec<i64>>,
        busy: AtomicBool,
    }

    impl Remote for Host {
        fn interfaces(&self) -> Vec<Arc<Interface>> {
            vec![greeter(), admin()]
        }

        fn invoke(&self, call: Call<'_>) -> anyhow::Result<Value> {
            match call.method {
                "greet" => Ok(format!("hello {}", call.str_arg(0)?).into()),
                "slow" => {
                    assert!(!self.busy.swap(true, Ordering::SeqCst), "overlapping ordered calls");
                    let n = call.int_arg(0)?;
                    thread::sleep(Duration::from_millis((n % 3) as u64));
                    self.seen.lock().unwrap().push(n);
                    self.busy.store(false, Ordering::SeqCst);
                    Ok(Value::Int(n))
                }
                "touch" => Ok(Value::from("ignored")),
                "fail" => Err(anyhow::anyhow!("no greeting today")),
                "explode" => panic!("kaboom"),
                other => Err(anyhow::anyhow!("unexpected method {}", other)),
            }
        }
    }

    fn bind(declared: Option<Vec<Arc<Interface>>>) -> Result<Binding> {
        let host = Arc::new(Host::default());
        Binding::new(BindingId(0), RegistryKind::Static, Some("g".into()), host, declared)
    }

    fn run(binding: &Binding, method: &str, args: Vec<Value>) -> Request<Value> {
        let reply = Request::new();
        let id = binding.table().resolve(method).unwrap();
        binding
            .execute(&Inline, Arc::new(Passthrough), Some(reply.clone()), id, args)
            .unwrap();
        reply
    }

    #[test]
    fn test_discovery_skips_local_only() {
        let binding = bind(None).unwrap();
        assert_eq!(binding.table().interface_names(), vec!["Greeter"]);
        assert!(binding.ordered_queue(binding.table().resolve("slow").unwrap()).is_some());
        assert!(binding.ordered_queue(binding.table().resolve("greet").unwrap()).is_none());
    }

    #[test]
    fn test_declared_interfaces_must_be_implemented() {
        let stranger = Interface::builder("Stranger").method(Method::new("x")).build().unwrap();
        assert_eq!(
            bind(Some(vec![stranger])).unwrap_err(),
            Error::InterfaceNotImplemented("Stranger".into())
        );
        assert_eq!(bind(Some(vec![admin()])).unwrap_err(), Error::LocalOnly("Admin".into()));
        assert_eq!(bind(Some(vec![])).unwrap_err(), Error::NoRemoteInterfaces);
    }

    #[test]
    fn test_execute_success_and_void() {
        let binding = bind(None).unwrap();
        assert_eq!(
            run(&binding, "greet", vec!["world".into()]).attachment(),
            Some("hello world".into())
        );
        assert_eq!(run(&binding, "touch", vec![]).attachment(), Some(Value::Null));
    }

    #[test]
    fn test_execute_captures_failures() {
        let binding = bind(None).unwrap();
        assert_eq!(
            run(&binding, "fail", vec![]).cause(),
            Some(Fault::Application("no greeting today".into()))
        );
        assert_eq!(
            run(&binding, "explode", vec![]).cause(),
            Some(Fault::Panicked("kaboom".into()))
        );
        assert!(matches!(
            run(&binding, "greet", vec![Value::Int(1)]).cause(),
            Some(Fault::Application(_))
        ));
    }

    #[test]
    fn test_unknown_method_fails_reply() {
        let binding = bind(None).unwrap();
        let reply = Request::new();
        let err = binding
            .execute(&Inline, Arc::new(Passthrough), Some(reply.clone()), MethodId(99), vec![])
            .unwrap_err();
        assert!(matches!(err, Fault::UnknownMethod(_)));
        assert_eq!(reply.cause(), Some(err));
    }

    #[test]
    fn test_value_method_without_reply_is_illegal() {
        let binding = bind(None).unwrap();
        let greet = binding.table().resolve("greet").unwrap();
        let err = binding
            .execute(&Inline, Arc::new(Passthrough), None, greet, vec!["x".into()])
            .unwrap_err();
        assert!(matches!(err, Fault::IllegalState(_)));

        let touch = binding.table().resolve("touch").unwrap();
        binding.execute(&Inline, Arc::new(Passthrough), None, touch, vec![]).unwrap();
    }

    #[test]
    fn test_ordered_method_serializes_across_threads() {
        let host = Arc::new(Host::default());
        let binding =
            Binding::new(BindingId(1), RegistryKind::Dynamic, None, host.clone(), None).unwrap();
        let slow = binding.table().resolve("slow").unwrap();

        let replies: Vec<_> = (0..30)
            .map(|i| {
                let reply = Request::new();
                let args = vec![Value::Int(i)];
                binding
                    .execute(&Threads, Arc::new(Passthrough), Some(reply.clone()), slow, args)
                    .unwrap();
                reply
            })
            .collect();

        for reply in &replies {
            assert!(reply.synchronize(Some(Duration::from_secs(10))));
            assert!(reply.is_successful());
        }
        assert_eq!(*host.seen.lock().unwrap(), (0..30).collect::<Vec<_>>());
    }
}
