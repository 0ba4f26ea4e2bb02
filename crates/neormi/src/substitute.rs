//! # Object-Reference Substitution
//!
//! Every argument and return value is rewritten on its way out and on its way
//! in, so live objects never cross the wire and references never reach user code.
//!
//! ## Rules
//!
//! Outbound (`export`):
//! - a local object is published in the connection's dynamic registry and
//!   replaced by a `Sender`-owned reference;
//! - a proxy for the peer's object is replaced by a `Receiver`-owned reference
//!   ("your object, coming back"). Proxies of other connections cannot be forwarded.
//!
//! Inbound (`import`):
//! - a `Receiver`-owned reference resolves against the local registries to the
//!   original object, so identity survives a round trip;
//! - a `Sender`-owned reference materializes a proxy bound to the sender.
//!
//! Both directions are applied symmetrically on both peers.

use std::sync::Arc;

use crate::binding::Remote;
use crate::fault::Fault;
use crate::registry::DynamicRegistry;
use crate::registry::StaticRegistry;
use crate::transport::ChannelId;
use crate::value::Owner;
use crate::value::Reference;
use crate::value::Value;

/// Rewrites values crossing a connection boundary.
pub trait Substitute: Send + Sync {
    /// Applied to values received from the peer.
    fn inbound(&self, value: Value) -> Result<Value, Fault>;
    /// Applied to values about to be sent to the peer.
    fn outbound(&self, value: Value) -> Result<Value, Fault>;
}

/// Leaves values untouched, for execution that never crosses a wire.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl Substitute for Passthrough {
    fn inbound(&self, value: Value) -> Result<Value, Fault> {
        Ok(value)
    }

    fn outbound(&self, value: Value) -> Result<Value, Fault> {
        Ok(value)
    }
}

/// Publishes a local object dynamically and returns its descriptor.
pub(crate) fn export_object(
    dynamics: &DynamicRegistry,
    target: Arc<dyn Remote>,
) -> Result<Value, Fault> {
    let binding = dynamics
        .resolve_or_create(target)
        .map_err(|e| Fault::IllegalState(format!("cannot export object: {}", e)))?;
    Ok(Value::Ref(binding.reference(Owner::Sender)))
}

/// Outbound rewrite for one connection.
pub(crate) fn export(
    value: Value,
    channel: ChannelId,
    dynamics: &DynamicRegistry,
) -> Result<Value, Fault> {
    value.rewrite(&mut |leaf| match leaf {
        Value::Object(target) => export_object(dynamics, target),
        Value::Proxy(proxy) => {
            if proxy.channel_id() != channel {
                return Err(Fault::MalformedReference(format!(
                    "proxy belongs to {} and cannot be sent over {}",
                    proxy.channel_id(),
                    channel
                )));
            }
            Ok(Value::Ref(proxy.reference(Owner::Receiver)))
        }
        other => Ok(other),
    })
}

/// Inbound rewrite; `materialize` turns a sender-owned reference into a proxy.
pub(crate) fn import<F>(
    value: Value,
    statics: &StaticRegistry,
    dynamics: &DynamicRegistry,
    materialize: &F,
) -> Result<Value, Fault>
where
    F: Fn(&Reference) -> Result<Value, Fault>,
{
    value.rewrite(&mut |leaf| match leaf {
        Value::Ref(reference) => match reference.owner {
            Owner::Receiver => resolve_local(statics, dynamics, &reference),
            Owner::Sender => materialize(&reference),
        },
        Value::Object(_) | Value::Proxy(_) => Err(Fault::MalformedReference(
            "live handle received from the wire".into(),
        )),
        other => Ok(other),
    })
}

/// Maps a reference to one of our own bindings back to its target.
pub(crate) fn resolve_local(
    statics: &StaticRegistry,
    dynamics: &DynamicRegistry,
    reference: &Reference,
) -> Result<Value, Fault> {
    let binding = if reference.dynamic {
        dynamics.get(reference.binding_id)
    } else {
        statics.get(reference.binding_id)
    };
    match binding {
        Some(binding) => Ok(Value::Object(binding.target().clone())),
        None => Err(Fault::MalformedReference(format!(
            "{} {} is not part of the local registries",
            if reference.dynamic { "dynamic" } else { "static" },
            reference.binding_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::binding::BindingId;
    use crate::binding::Call;
    use crate::interface::Interface;
    use crate::interface::Method;

    struct Echo;

    impl Remote for Echo {
        fn interfaces(&self) -> Vec<Arc<Interface>> {
            vec![Interface::builder("Echo").method(Method::new("echo")).build().unwrap()]
        }

        fn invoke(&self, call: Call<'_>) -> anyhow::Result<Value> {
            Ok(call.arg(0)?.clone())
        }
    }

    fn no_proxies(_: &Reference) -> Result<Value, Fault> {
        Err(Fault::IllegalState("unexpected materialize".into()))
    }

    #[test]
    fn test_exported_object_comes_back_as_itself() {
        let statics = StaticRegistry::new();
        let dynamics = DynamicRegistry::new();
        let target: Arc<dyn Remote> = Arc::new(Echo);

        let list = Value::List(vec![Value::Object(target.clone())]);
        let wire = export(list, ChannelId(1), &dynamics).unwrap();
        assert!(wire.is_wire_safe());
        let Value::Ref(mut reference) = wire.as_list().unwrap()[0].clone() else {
            panic!("expected a reference");
        };
        assert_eq!(reference.owner, Owner::Sender);
        assert!(reference.dynamic);
        assert_eq!(reference.interfaces, vec!["Echo".to_string()]);

        // The peer hands it back: from our point of view we now receive it.
        reference.owner = Owner::Receiver;
        let back = import(Value::Ref(reference), &statics, &dynamics, &no_proxies).unwrap();
        assert_eq!(back, Value::Object(target));
    }

    #[test]
    fn test_export_is_idempotent_per_object() {
        let dynamics = DynamicRegistry::new();
        let target: Arc<dyn Remote> = Arc::new(Echo);
        let a = export(Value::Object(target.clone()), ChannelId(1), &dynamics).unwrap();
        let b = export(Value::Object(target), ChannelId(1), &dynamics).unwrap();
        assert_eq!(a, b);
        assert_eq!(dynamics.len(), 1);
    }

    #[test]
    fn test_unknown_local_reference_is_malformed() {
        let reference = Reference {
            owner: Owner::Receiver,
            dynamic: false,
            binding_id: BindingId(9),
            interfaces: vec![],
        };
        let err = import(
            Value::Ref(reference),
            &StaticRegistry::new(),
            &DynamicRegistry::new(),
            &no_proxies,
        )
        .unwrap_err();
        assert!(matches!(err, Fault::MalformedReference(_)));
    }

    #[test]
    fn test_sender_reference_is_materialized() {
        let reference = Reference {
            owner: Owner::Sender,
            dynamic: true,
            binding_id: BindingId(3),
            interfaces: vec!["Echo".into()],
        };
        let out = import(
            Value::Ref(reference.clone()),
            &StaticRegistry::new(),
            &DynamicRegistry::new(),
            &|r: &Reference| Ok(Value::Int(r.binding_id.0 as i64)),
        )
        .unwrap();
        assert_eq!(out, Value::Int(3));
    }
}
