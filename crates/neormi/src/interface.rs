//! # Interfaces and Method Tables
//!
//! An `Interface` is the explicit declaration of a remote-callable API: an
//! ordered list of methods plus the attributes the invocation engine needs
//! (ordered execution, fire-and-forget, return shape).
//!
//! ## Philosophy
//!
//! - **Declaration-Time Safety**: Invalid combinations (a fire-and-forget
//!   method that returns a value or declares failures) are rejected when the
//!   interface is built, never at call time.
//! - **Deterministic Ids**: A `MethodTable` sorts interfaces by name and keeps
//!   declaration order within each, so two peers that share the same interface
//!   definitions derive identical method ids.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::fault::Fault;

/// Strong type for method identifiers within a binding.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "method-{}", self.0)
    }
}

/// Interface declaration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Two methods in one interface share a name.
    DuplicateMethod { interface: String, method: String },
    /// A fire-and-forget method must not return a value.
    OnewayReturnsValue { interface: String, method: String },
    /// A fire-and-forget method must not declare failures; nobody would receive them.
    OnewayDeclaresFailures { interface: String, method: String },
    /// A different definition is already registered under this name.
    Conflict(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateMethod { interface, method } => {
                write!(f, "interface '{}' declares '{}' more than once", interface, method)
            }
            Self::OnewayReturnsValue { interface, method } => {
                write!(f, "one-way method '{}.{}' must be void", interface, method)
            }
            Self::OnewayDeclaresFailures { interface, method } => {
                write!(f, "one-way method '{}.{}' cannot declare failures", interface, method)
            }
            Self::Conflict(name) => {
                write!(f, "interface '{}' is already registered with a different definition", name)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The return shape of a method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Returns {
    Void,
    Value,
}

/// A single method declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub returns: Returns,
    /// Invocations run one at a time, in arrival order, per binding.
    pub ordered: bool,
    /// The caller does not wait for execution; only the send is acknowledged.
    pub oneway: bool,
    /// The method may fail with an application error.
    pub fallible: bool,
}

impl Method {
    /// A value-returning method that may fail.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            returns: Returns::Value,
            ordered: false,
            oneway: false,
            fallible: true,
        }
    }

    /// A void method whose completion the caller still awaits.
    pub fn void(name: impl Into<String>) -> Self {
        Self {
            returns: Returns::Void,
            ..Self::new(name)
        }
    }

    /// A fire-and-forget void method.
    pub fn oneway(name: impl Into<String>) -> Self {
        Self {
            returns: Returns::Void,
            oneway: true,
            fallible: false,
            ..Self::new(name)
        }
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn fallible(mut self, fallible: bool) -> Self {
        self.fallible = fallible;
        self
    }
}

/// A named set of methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    name: String,
    local_only: bool,
    methods: Vec<Method>,
}

impl Interface {
    pub fn builder(name: impl Into<String>) -> InterfaceBuilder {
        InterfaceBuilder {
            name: name.into(),
            local_only: false,
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local-only interfaces are never exposed by default interface discovery.
    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

pub struct InterfaceBuilder {
    name: String,
    local_only: bool,
    methods: Vec<Method>,
}

impl InterfaceBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn build(self) -> Result<Arc<Interface>> {
        let mut seen = std::collections::HashSet::new();
        for method in &self.methods {
            let ctx = || (self.name.clone(), method.name.clone());
            if !seen.insert(method.name.as_str()) {
                let (interface, method) = ctx();
                return Err(Error::DuplicateMethod { interface, method });
            }
            if method.oneway && method.returns != Returns::Void {
                let (interface, method) = ctx();
                return Err(Error::OnewayReturnsValue { interface, method });
            }
            if method.oneway && method.fallible {
                let (interface, method) = ctx();
                return Err(Error::OnewayDeclaresFailures { interface, method });
            }
        }

        Ok(Arc::new(Interface {
            name: self.name,
            local_only: self.local_only,
            methods: self.methods,
        }))
    }
}

/// One row of a method table.
#[derive(Clone, Debug)]
pub struct MethodEntry {
    pub id: MethodId,
    pub interface: String,
    pub method: Method,
}

/// The method-id space of one binding.
#[derive(Clone, Debug, Default)]
pub struct MethodTable {
    interfaces: Vec<Arc<Interface>>,
    entries: Vec<MethodEntry>,
    by_name: HashMap<String, MethodId>,
}

impl MethodTable {
    /// Builds the table. Interfaces are sorted by name and deduplicated.
    pub fn new(interfaces: impl IntoIterator<Item = Arc<Interface>>) -> Self {
        let mut interfaces: Vec<Arc<Interface>> = interfaces.into_iter().collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        interfaces.dedup_by(|a, b| a.name == b.name);

        let mut entries = Vec::new();
        let mut by_name = HashMap::new();
        let mut plain: HashMap<&str, Option<MethodId>> = HashMap::new();

        for iface in &interfaces {
            for method in &iface.methods {
                let id = MethodId(entries.len() as u32);
                by_name.insert(format!("{}.{}", iface.name, method.name), id);
                plain
                    .entry(method.name.as_str())
                    .and_modify(|slot| *slot = None)
                    .or_insert(Some(id));
                entries.push(MethodEntry {
                    id,
                    interface: iface.name.clone(),
                    method: method.clone(),
                });
            }
        }

        // Unqualified names only resolve when unambiguous.
        for (name, id) in plain {
            if let Some(id) = id {
                by_name.insert(name.to_string(), id);
            }
        }

        Self { interfaces, entries, by_name }
    }

    pub fn interfaces(&self) -> &[Arc<Interface>] {
        &self.interfaces
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.name.clone()).collect()
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i.name == interface)
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodEntry> {
        self.entries.get(id.0 as usize)
    }

    pub fn contains(&self, id: MethodId) -> bool {
        (id.0 as usize) < self.entries.len()
    }

    /// Resolves `method` or `Interface.method` to an id.
    pub fn resolve(&self, name: &str) -> Option<MethodId> {
        self.by_name.get(name).copied()
    }

    pub fn entries(&self) -> &[MethodEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Interface definitions known to a node, by name.
///
/// The receiving side of a reference descriptor resolves its interface names
/// here to rebuild the sender's method table.
#[derive(Default)]
pub struct Catalog {
    interfaces: DashMap<String, Arc<Interface>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition. Re-registering an identical definition is a no-op.
    /// Fails if a different definition is already registered under the same name.
    pub fn check(&self, interface: &Interface) -> Result<()> {
        match self.interfaces.get(&interface.name) {
            Some(existing) if **existing.value() != *interface => {
                Err(Error::Conflict(interface.name.clone()))
            }
            _ => Ok(()),
        }
    }

    pub fn register(&self, interface: Arc<Interface>) -> Result<()> {
        match self.interfaces.entry(interface.name.clone()) {
            Entry::Occupied(existing) => {
                if **existing.get() != *interface {
                    return Err(Error::Conflict(interface.name.clone()));
                }
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(interface);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Interface>> {
        self.interfaces.get(name).map(|entry| entry.value().clone())
    }

    /// Resolves every name or fails with the first unknown one.
    pub fn resolve(&self, names: &[String]) -> std::result::Result<Vec<Arc<Interface>>, Fault> {
        names
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| {
                    Fault::MalformedReference(format!("unknown interface '{}'", name))
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeter() -> Arc<Interface> {
        Interface::builder("Greeter")
            .method(Method::new("greet").ordered())
            .method(Method::oneway("poke"))
            .build()
            .unwrap()
    }

    fn counter() -> Arc<Interface> {
        Interface::builder("Counter")
            .method(Method::new("get"))
            .method(Method::void("reset"))
            .method(Method::new("greet"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_method_ids_independent_of_declaration_order() {
        let a = MethodTable::new([greeter(), counter()]);
        let b = MethodTable::new([counter(), greeter(), counter()]);

        assert_eq!(a.len(), 5);
        assert_eq!(a.interface_names(), vec!["Counter", "Greeter"]);
        for entry in a.entries() {
            let other = b.get(entry.id).unwrap();
            assert_eq!(other.interface, entry.interface);
            assert_eq!(other.method, entry.method);
        }
    }

    #[test]
    fn test_ambiguous_plain_name_requires_qualification() {
        let table = MethodTable::new([greeter(), counter()]);
        assert_eq!(table.resolve("greet"), None);
        assert_eq!(table.resolve("Counter.greet"), Some(MethodId(2)));
        assert_eq!(table.resolve("Greeter.greet"), Some(MethodId(3)));
        assert_eq!(table.resolve("poke"), Some(MethodId(4)));
        assert_eq!(table.resolve("missing"), None);
        assert!(!table.contains(MethodId(5)));
    }

    #[test]
    fn test_oneway_must_be_void_and_infallible() {
        let err = Interface::builder("Bad")
            .method(Method { returns: Returns::Value, ..Method::oneway("x") })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::OnewayReturnsValue { .. }));

        let err = Interface::builder("Bad")
            .method(Method::oneway("x").fallible(true))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::OnewayDeclaresFailures { .. }));
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let err = Interface::builder("Dup")
            .method(Method::new("a"))
            .method(Method::void("a"))
            .build()
            .unwrap_err();
        assert_eq!(err, Error::DuplicateMethod { interface: "Dup".into(), method: "a".into() });
    }

    #[test]
    fn test_catalog_rejects_conflicting_definitions() {
        let catalog = Catalog::new();
        catalog.register(greeter()).unwrap();
        catalog.register(greeter()).unwrap();

        let impostor = Interface::builder("Greeter")
            .method(Method::new("greet"))
            .build()
            .unwrap();
        assert_eq!(catalog.register(impostor), Err(Error::Conflict("Greeter".into())));

        let resolved = catalog.resolve(&["Greeter".into()]).unwrap();
        assert_eq!(resolved[0].methods().len(), 2);
        assert!(matches!(
            catalog.resolve(&["Nope".into()]),
            Err(Fault::MalformedReference(_))
        ));
    }
}
