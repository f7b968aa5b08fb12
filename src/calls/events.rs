//! Notifications published to the UI layer.

use crate::transport::RemoteTrack;
use signalbox_core::{CallRecord, CallId, LocalCallStatus};

/// Emitted by a [`CallCoordinator`](super::CallCoordinator).
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Status(LocalCallStatus),
    /// Remote media is attached and playing.
    RemoteTrack(RemoteTrack),
    /// Whole seconds spent active.
    Duration(u64),
}

/// Emitted by an [`IncomingCallMailbox`](super::IncomingCallMailbox).
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxEvent {
    /// A ringing call is waiting for a decision.
    Incoming(CallRecord),
    /// A ringing call was declined because calls are disabled.
    AutoRejected(CallRecord),
    /// The pending call went away before a decision.
    Dismissed { call_id: CallId },
}
