//! The shared call record and its partial updates.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::session::SessionDescription;

/// Opaque call identifier, generated by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id: 128 random bits rendered as 32 uppercase hex chars.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Negotiation status stored in the shared call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Rejected,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        }
    }

    /// `ringing` and `accepted` records still describe a call in progress.
    pub fn is_live(&self) -> bool {
        matches!(self, CallStatus::Ringing | CallStatus::Accepted)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media kind of a call. Informational for the signaling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

/// Snapshot of the initiator's identity, denormalized into the record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallerProfile {
    pub id: String,
    pub name: String,
    pub avatar: String,
}

impl CallerProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: String::new(),
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = avatar.into();
        self
    }
}

/// The single shared document describing one call attempt.
///
/// Stored at `calls/{receiver_id}`. Optional fields are omitted from the wire
/// form rather than written as `null`, and decoding tolerates both extra
/// fields and missing optional ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: String,
    #[serde(default)]
    pub caller_name: String,
    #[serde(default)]
    pub caller_avatar: String,
    pub receiver_id: String,
    pub status: CallStatus,
    #[serde(rename = "type", default)]
    pub call_type: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Creation time in epoch milliseconds. Never used for ordering.
    #[serde(default)]
    pub timestamp: i64,
}

impl CallRecord {
    /// A new `ringing` record from `caller` to `receiver_id`.
    pub fn ringing(
        id: CallId,
        caller: &CallerProfile,
        receiver_id: impl Into<String>,
        call_type: CallType,
    ) -> Self {
        Self {
            id,
            caller_id: caller.id.clone(),
            caller_name: caller.name.clone(),
            caller_avatar: caller.avatar.clone(),
            receiver_id: receiver_id.into(),
            status: CallStatus::Ringing,
            call_type,
            offer: None,
            answer: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_offer(mut self, offer: SessionDescription) -> Self {
        self.offer = Some(offer);
        self
    }

    /// Apply a partial update the way the store merges one.
    pub fn merge(&mut self, update: &CallUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(offer) = &update.offer {
            self.offer = Some(offer.clone());
        }
        if let Some(answer) = &update.answer {
            self.answer = Some(answer.clone());
        }
    }
}

/// Partial update of a call record. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl CallUpdate {
    pub fn accepted(answer: SessionDescription) -> Self {
        Self {
            status: Some(CallStatus::Accepted),
            answer: Some(answer),
            ..Default::default()
        }
    }

    pub fn rejected() -> Self {
        Self {
            status: Some(CallStatus::Rejected),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.offer.is_none() && self.answer.is_none()
    }
}
