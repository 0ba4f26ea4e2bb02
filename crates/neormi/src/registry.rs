//! # Registries
//!
//! Identity-indexed tables of bindings.
//!
//! - `StaticRegistry`: explicitly named, long-lived bindings, one per node.
//! - `DynamicRegistry`: bindings created implicitly when a local object is
//!   passed across a connection, one per connection.
//!
//! Ids are allocated monotonically and never reused, so a stale reference can
//! only ever miss, never hit a different object. Each registry is guarded by a
//! single lock; iteration is over a point-in-time snapshot. Listener hooks run
//! after the lock is released.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::binding::Binding;
use crate::binding::BindingId;
use crate::binding::Error;
use crate::binding::RegistryKind;
use crate::binding::Remote;
use crate::binding::Result;
use crate::fault::Fault;
use crate::fault::panic_message;
use crate::interface::Interface;
use crate::substitute::export_object;
use crate::value::Value;
use crate::value::object_key;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn notify_bound(binding: &Binding) {
    let hook = || binding.target().bound_to(binding.kind(), binding.id());
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
        let reason = panic_message(payload.as_ref());
        tracing::warn!(binding = %binding.id(), %reason, "bound_to hook panicked");
    }
}

fn notify_unbound(binding: &Binding) {
    let hook = || binding.target().unbound_from(binding.kind(), binding.id());
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
        let reason = panic_message(payload.as_ref());
        tracing::warn!(binding = %binding.id(), %reason, "unbound_from hook panicked");
    }
}

fn snapshot(bindings: &HashMap<BindingId, Arc<Binding>>) -> Vec<Arc<Binding>> {
    let mut all: Vec<_> = bindings.values().cloned().collect();
    all.sort_by_key(|b| b.id());
    all
}

#[derive(Default)]
struct StaticState {
    next_id: u64,
    bindings: HashMap<BindingId, Arc<Binding>>,
    names: HashMap<String, BindingId>,
}

/// Named bindings published by the hosting application.
#[derive(Default)]
pub struct StaticRegistry {
    state: Mutex<StaticState>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `target` under `name`, exposing its discovered interfaces.
    pub fn bind(&self, name: impl Into<String>, target: Arc<dyn Remote>) -> Result<Arc<Binding>> {
        self.bind_with(name.into(), target, None)
    }

    /// Publishes `target` under `name`, exposing exactly `interfaces`.
    pub fn bind_as(
        &self,
        name: impl Into<String>,
        target: Arc<dyn Remote>,
        interfaces: Vec<Arc<Interface>>,
    ) -> Result<Arc<Binding>> {
        self.bind_with(name.into(), target, Some(interfaces))
    }

    fn bind_with(
        &self,
        name: String,
        target: Arc<dyn Remote>,
        declared: Option<Vec<Arc<Interface>>>,
    ) -> Result<Arc<Binding>> {
        let binding = {
            let mut state = lock(&self.state);
            if state.names.contains_key(&name) {
                return Err(Error::NameTaken(name));
            }
            let id = BindingId(state.next_id);
            let binding =
                Binding::new(id, RegistryKind::Static, Some(name.clone()), target, declared)?;
            let binding = Arc::new(binding);
            state.next_id += 1;
            state.bindings.insert(id, binding.clone());
            state.names.insert(name, id);
            binding
        };

        tracing::debug!(binding = %binding.id(), name = binding.name(), "bound");
        notify_bound(&binding);
        Ok(binding)
    }

    pub fn unbind(&self, id: BindingId) -> Option<Arc<Binding>> {
        let binding = {
            let mut state = lock(&self.state);
            let binding = state.bindings.remove(&id)?;
            if let Some(name) = binding.name() {
                state.names.remove(name);
            }
            binding
        };

        tracing::debug!(binding = %id, name = binding.name(), "unbound");
        notify_unbound(&binding);
        Some(binding)
    }

    pub fn unbind_name(&self, name: &str) -> Option<Arc<Binding>> {
        let id = *lock(&self.state).names.get(name)?;
        self.unbind(id)
    }

    /// Removes every binding and returns them in id order.
    pub fn unbind_all(&self) -> Vec<Arc<Binding>> {
        let removed = {
            let mut state = lock(&self.state);
            state.names.clear();
            let removed = snapshot(&state.bindings);
            state.bindings.clear();
            removed
        };
        for binding in &removed {
            notify_unbound(binding);
        }
        removed
    }

    pub fn get(&self, id: BindingId) -> Option<Arc<Binding>> {
        lock(&self.state).bindings.get(&id).cloned()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Binding>> {
        let state = lock(&self.state);
        let id = state.names.get(name)?;
        state.bindings.get(id).cloned()
    }

    /// Point-in-time copy of all bindings, in id order.
    pub fn bindings(&self) -> Vec<Arc<Binding>> {
        snapshot(&lock(&self.state).bindings)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct DynamicState {
    next_id: u64,
    bindings: HashMap<BindingId, Arc<Binding>>,
    by_target: HashMap<usize, BindingId>,
}

/// Bindings for objects that escaped across one connection.
#[derive(Default)]
pub struct DynamicRegistry {
    state: Mutex<DynamicState>,
}

impl DynamicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the binding of `target`, creating it on first sight.
    pub fn resolve_or_create(&self, target: Arc<dyn Remote>) -> Result<Arc<Binding>> {
        let key = object_key(&target);
        let binding = {
            let mut state = lock(&self.state);
            let existing = state.by_target.get(&key).and_then(|id| state.bindings.get(id));
            if let Some(existing) = existing {
                return Ok(existing.clone());
            }
            let id = BindingId(state.next_id);
            let binding = Arc::new(Binding::new(id, RegistryKind::Dynamic, None, target, None)?);
            state.next_id += 1;
            state.bindings.insert(id, binding.clone());
            state.by_target.insert(key, id);
            binding
        };

        tracing::debug!(binding = %binding.id(), "bound dynamically");
        notify_bound(&binding);
        Ok(binding)
    }

    /// Replaces every local object in `args` (nested ones included) with its
    /// reference descriptor, publishing objects seen for the first time.
    pub fn replace_remote_objects(&self, args: &mut [Value]) -> std::result::Result<(), Fault> {
        for arg in args.iter_mut() {
            let value = std::mem::take(arg);
            *arg = value.rewrite(&mut |leaf| match leaf {
                Value::Object(target) => export_object(self, target),
                other => Ok(other),
            })?;
        }
        Ok(())
    }

    pub fn get(&self, id: BindingId) -> Option<Arc<Binding>> {
        lock(&self.state).bindings.get(&id).cloned()
    }

    pub fn unbind(&self, id: BindingId) -> Option<Arc<Binding>> {
        let binding = {
            let mut state = lock(&self.state);
            let binding = state.bindings.remove(&id)?;
            state.by_target.remove(&object_key(binding.target()));
            binding
        };
        tracing::debug!(binding = %id, "unbound dynamically");
        notify_unbound(&binding);
        Some(binding)
    }

    /// Removes every binding and returns them in id order.
    pub fn unbind_all(&self) -> Vec<Arc<Binding>> {
        let removed = {
            let mut state = lock(&self.state);
            state.by_target.clear();
            let removed = snapshot(&state.bindings);
            state.bindings.clear();
            removed
        };
        for binding in &removed {
            notify_unbound(binding);
        }
        removed
    }

    /// Point-in-time copy of all bindings, in id order.
    pub fn bindings(&self) -> Vec<Arc<Binding>> {
        snapshot(&lock(&self.state).bindings)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
