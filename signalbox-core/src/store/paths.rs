//! Key layout of the signaling records.
//!
//! ```text
//! calls/{receiverId}                       call record
//! calls/candidates/{callId}/caller         candidates discovered by the caller
//! calls/candidates/{callId}/receiver       candidates discovered by the receiver
//! ```

use super::error::{Result, StoreError};
use crate::types::call::CallId;
use crate::types::session::CallRole;

pub const CALLS_ROOT: &str = "calls";
pub const CANDIDATES_ROOT: &str = "calls/candidates";

/// Characters the hosted stores refuse inside a key segment.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

pub fn call_path(receiver_id: &str) -> String {
    format!("{CALLS_ROOT}/{receiver_id}")
}

pub fn candidates_path(call_id: &CallId) -> String {
    format!("{CANDIDATES_ROOT}/{call_id}")
}

pub fn candidate_partition_path(call_id: &CallId, side: CallRole) -> String {
    format!("{CANDIDATES_ROOT}/{call_id}/{}", side.as_str())
}

/// Split a key path into its segments, rejecting empty or illegal ones.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    trimmed
        .split('/')
        .map(|segment| {
            if segment.is_empty() || segment.contains(FORBIDDEN) {
                Err(StoreError::InvalidPath(path.to_string()))
            } else {
                Ok(segment)
            }
        })
        .collect()
}
