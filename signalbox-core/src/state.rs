//! Local call status machine.
//!
//! The shared record's `status` only says where the negotiation stands; this
//! is the finer-grained status each participant shows to its own UI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Why a call ended locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up.
    LocalHangup,
    /// Local user declined an incoming call.
    LocalRejected,
    /// The record disappeared or was marked ended by the other side.
    RemoteHangup,
    /// The other side declined.
    RemoteRejected,
    /// Local capture could not be obtained.
    MediaUnavailable,
    /// A signaling write failed and could not be masked.
    SignalingFailed,
    /// The transport refused a session description.
    NegotiationFailed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local_hangup",
            EndReason::LocalRejected => "local_rejected",
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::RemoteRejected => "remote_rejected",
            EndReason::MediaUnavailable => "media_unavailable",
            EndReason::SignalingFailed => "signaling_failed",
            EndReason::NegotiationFailed => "negotiation_failed",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UI-facing status of one participant's call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LocalCallStatus {
    /// Initial state for both roles.
    Ringing { since: DateTime<Utc> },
    /// Caller only: answer observed, remote description being applied.
    Connecting { since: DateTime<Utc> },
    Active { connected_at: DateTime<Utc> },
    /// Absorbing.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl Default for LocalCallStatus {
    fn default() -> Self {
        Self::ringing()
    }
}

impl LocalCallStatus {
    pub fn ringing() -> Self {
        Self::Ringing { since: Utc::now() }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing { .. } => "ringing",
            Self::Connecting { .. } => "connecting",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            Self::Ended { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Apply a transition. Anything not in the table leaves the status
    /// untouched and returns [`InvalidTransition`].
    pub fn apply(&mut self, transition: StatusTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let next = match (&*self, transition) {
            (Self::Ringing { .. }, StatusTransition::RemoteAnswerReceived) => {
                Self::Connecting { since: now }
            }
            (Self::Connecting { .. }, StatusTransition::RemoteAnswerApplied) => {
                Self::Active { connected_at: now }
            }
            (Self::Ringing { .. }, StatusTransition::LocalAccepted) => {
                Self::Active { connected_at: now }
            }
            (
                Self::Ringing { .. } | Self::Connecting { .. },
                StatusTransition::Terminated { reason },
            ) => Self::Ended {
                reason,
                ended_at: now,
                duration_secs: None,
            },
            (Self::Active { connected_at }, StatusTransition::Terminated { reason }) => {
                Self::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: Some(now.signed_duration_since(*connected_at).num_seconds()),
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.as_str().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        *self = next;
        Ok(())
    }
}

impl fmt::Display for LocalCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    RemoteAnswerReceived,
    RemoteAnswerApplied,
    LocalAccepted,
    Terminated { reason: EndReason },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
