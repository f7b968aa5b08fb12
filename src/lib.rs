// Re-export the data model and store helpers from the core crate
pub use signalbox_core::{state, types};

pub mod calls;
pub mod store;
pub mod transport;

pub use calls::{
    CallAvailability, CallCoordinator, CallError, CallEvent, CoordinatorConfig,
    IncomingCallMailbox, MailboxEvent, SignalingChannel,
};
pub use signalbox_core::{
    CallId, CallRecord, CallRole, CallStatus, CallType, CallerProfile, EndReason, IceCandidate,
    LocalCallStatus, SessionDescription,
};
pub use store::{InMemoryStore, RecordStore};
