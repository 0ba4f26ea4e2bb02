//! # Failure Causes
//!
//! A `Fault` is the failure side of every correlation cell. It crosses the
//! wire inside responses, so it only carries owned, serializable data.
//!
//! These are distinct from the per-module `Error` types: a `Fault` describes
//! why one call failed, whereas module errors describe misconfiguration or a
//! broken channel on the local side.

use crate::binding::BindingId;
use crate::interface::MethodId;
use crate::request;
use crate::transport;

/// Reasons for a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The method id or name does not exist on the binding.
    UnknownMethod(String),
    /// No binding with this id exists in the addressed registry.
    BindingNotFound { dynamic: bool, id: BindingId },
    /// No binding is published under this name.
    NameNotFound(String),
    /// A reference descriptor could not be resolved or produced.
    MalformedReference(String),
    /// The target method returned an error.
    Application(String),
    /// The target method panicked.
    Panicked(String),
    /// The call was made in a way the protocol forbids.
    IllegalState(String),
    /// The connection closed before a response arrived.
    ConnectionClosed,
    /// The message could not be handed to the transport.
    Transport(String),
}

impl Fault {
    pub(crate) fn unknown_method_id(id: MethodId) -> Self {
        Self::UnknownMethod(format!("method id ({}) does not exist", id.0))
    }

    /// Converts an error returned by a target into a fault.
    ///
    /// A `Fault` wrapped in the error, or the remote cause of a failed nested
    /// call, is passed through as-is.
    pub fn from_error(error: anyhow::Error) -> Self {
        let error = match error.downcast::<Fault>() {
            Ok(fault) => return fault,
            Err(error) => error,
        };
        match error.downcast::<request::Error>() {
            Ok(request::Error::Remote(fault)) => fault,
            Ok(timeout) => Self::Application(timeout.to_string()),
            Err(error) => Self::Application(format!("{:#}", error)),
        }
    }

    /// True for failures raised by the invocation machinery rather than the target.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnknownMethod(_)
                | Self::BindingNotFound { .. }
                | Self::NameNotFound(_)
                | Self::MalformedReference(_)
        )
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMethod(msg) => write!(f, "Unknown method: {}", msg),
            Self::BindingNotFound { dynamic, id } => {
                let kind = if *dynamic { "dynamic" } else { "static" };
                write!(f, "Binding not found: {} {}", kind, id)
            }
            Self::NameNotFound(name) => write!(f, "Name not bound: '{}'", name),
            Self::MalformedReference(msg) => write!(f, "Malformed reference: {}", msg),
            Self::Application(msg) => write!(f, "Application failure: {}", msg),
            Self::Panicked(msg) => write!(f, "Target panicked: {}", msg),
            Self::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Transport(msg) => write!(f, "Transport failure: {}", msg),
        }
    }
}

impl std::error::Error for Fault {}

impl From<transport::Error> for Fault {
    fn from(e: transport::Error) -> Self {
        match e {
            transport::Error::Closed => Self::ConnectionClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_passes_through_anyhow() {
        let original = Fault::NameNotFound("g".into());
        let error = anyhow::Error::new(original.clone());
        assert_eq!(Fault::from_error(error), original);
    }

    #[test]
    fn test_nested_remote_failure_passes_through() {
        let error = anyhow::Error::new(request::Error::Remote(Fault::ConnectionClosed));
        assert_eq!(Fault::from_error(error), Fault::ConnectionClosed);
    }

    #[test]
    fn test_application_fault_keeps_context_chain() {
        let error = anyhow::anyhow!("disk full").context("saving greeting");
        match Fault::from_error(error) {
            Fault::Application(msg) => {
                assert!(msg.contains("saving greeting"));
                assert!(msg.contains("disk full"));
            }
            other => panic!("Expected Application, got {:?}", other),
        }
    }

    #[test]
    fn test_protocol_faults() {
        assert!(Fault::NameNotFound("g".into()).is_protocol());
        assert!(Fault::BindingNotFound { dynamic: true, id: BindingId(3) }.is_protocol());
        assert!(!Fault::Application("no".into()).is_protocol());
        assert!(!Fault::ConnectionClosed.is_protocol());
    }

    #[test]
    fn test_closed_transport_maps_to_connection_closed() {
        assert_eq!(Fault::from(transport::Error::Closed), Fault::ConnectionClosed);
        assert!(matches!(
            Fault::from(transport::Error::Io("boom".into())),
            Fault::Transport(_)
        ));
    }
}
