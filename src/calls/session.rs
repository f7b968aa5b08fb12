//! Resources owned by one participant's live call.

use crate::store::Unsubscribe;
use crate::transport::TransportSession;
use log::debug;
use signalbox_core::{IceCandidate, LocalCallStatus};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub(crate) struct CallSession {
    pub status: LocalCallStatus,
    pub muted: bool,
    pub speaker: bool,
    pub transport: Option<Arc<dyn TransportSession>>,
    pub subscriptions: Vec<Unsubscribe>,
    pub ticker: Option<JoinHandle<()>>,
    /// Remote candidates that arrived before a remote description was set.
    pub pending_candidates: Vec<IceCandidate>,
    /// Receiver only: an answer has been created for this call.
    pub answered: bool,
}

impl CallSession {
    pub fn new(speaker: bool) -> Self {
        Self {
            status: LocalCallStatus::ringing(),
            muted: false,
            speaker,
            transport: None,
            subscriptions: Vec::new(),
            ticker: None,
            pending_candidates: Vec::new(),
            answered: false,
        }
    }

    /// Release everything the call holds. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        for handle in self.subscriptions.drain(..) {
            handle.cancel();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if !self.pending_candidates.is_empty() {
            debug!(
                "Dropping {} queued remote candidate(s)",
                self.pending_candidates.len()
            );
            self.pending_candidates.clear();
        }
    }
}

/// Render whole seconds as `m:ss`. Minutes are not wrapped into hours.
pub fn format_duration(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
