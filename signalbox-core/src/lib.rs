//! Runtime-independent building blocks for call signaling: the shared call
//! record and candidate types, the store key layout, write sanitization and
//! the local call state machine.

pub mod state;
pub mod store;
pub mod types;

pub use state::{EndReason, InvalidTransition, LocalCallStatus, StatusTransition};
pub use types::call::{CallId, CallRecord, CallStatus, CallType, CallUpdate, CallerProfile};
pub use types::session::{CallRole, CandidateType, IceCandidate, SdpType, SessionDescription};
