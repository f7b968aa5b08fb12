//! Call-related error types.

use crate::transport::TransportError;
use signalbox_core::InvalidTransition;
use signalbox_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    MediaAcquisition(String),

    #[error("signaling write failed: {0}")]
    SignalingWrite(#[source] StoreError),

    #[error("signaling read failed: {0}")]
    Store(#[source] StoreError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("cannot {action} while {state}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("receiver {0} is already in a call")]
    ReceiverBusy(String),

    #[error("no pending incoming call")]
    NoPendingCall,
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::MediaAcquisition(msg) => CallError::MediaAcquisition(msg),
            other => CallError::Negotiation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_by_kind() {
        let err: CallError = TransportError::MediaAcquisition("denied".into()).into();
        assert!(matches!(err, CallError::MediaAcquisition(ref m) if m == "denied"));

        let err: CallError = TransportError::Closed.into();
        assert!(matches!(err, CallError::Negotiation(_)));
    }

    #[test]
    fn test_invalid_state_message() {
        let err = CallError::InvalidState {
            state: "active",
            action: "accept",
        };
        assert_eq!(err.to_string(), "cannot accept while active");
    }
}
