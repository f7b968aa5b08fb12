//! Call signaling over a shared record store.
//!
//! Two peers negotiate a direct media session without a signaling server:
//! the caller writes a call record at the receiver's key, both sides append
//! discovery candidates to their own partition, and each side watches the
//! other's writes.
//!
//! # Architecture
//!
//! - [`SignalingChannel`]: typed access to call records and candidate partitions
//! - [`CallCoordinator`]: drives one participant through one call attempt
//! - [`IncomingCallMailbox`]: surfaces ringing calls while idle
//! - [`CallEvent`] & [`MailboxEvent`]: notifications for the UI layer
//!
//! # Protocol Overview
//!
//! The caller publishes `{status: ringing, offer}`. The receiver either writes
//! `{status: rejected}` or `{status: accepted, answer}`. Hanging up deletes the
//! record, which the other side observes as the end of the call.

mod coordinator;
mod error;
mod events;
mod mailbox;
mod session;
mod signaling;

pub use coordinator::{CallCoordinator, CoordinatorConfig};
pub use error::CallError;
pub use events::{CallEvent, MailboxEvent};
pub use mailbox::{CallAvailability, IncomingCallMailbox};
pub use session::format_duration;
pub use signaling::{CallSnapshot, CallSubscription, CandidateSubscription, SignalingChannel};
