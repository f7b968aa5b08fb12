//! Watches a participant's own key for incoming calls while idle.

use super::coordinator::{CallCoordinator, CoordinatorConfig};
use super::error::CallError;
use super::events::MailboxEvent;
use super::signaling::{CallSnapshot, CallSubscription, SignalingChannel};
use crate::store::{RecordStore, Unsubscribe};
use crate::transport::TransportFactory;
use log::{debug, info, warn};
use signalbox_core::{CallId, CallRecord, CallStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast};

/// Whether the local participant currently takes calls.
pub trait CallAvailability: Send + Sync {
    fn calls_disabled(&self) -> bool;
}

impl CallAvailability for AtomicBool {
    fn calls_disabled(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MailboxState {
    pending: Option<CallRecord>,
    last_auto_rejected: Option<CallId>,
    subscription: Option<Unsubscribe>,
}

/// Surfaces ringing calls addressed to `identity` and routes the user's
/// decision.
pub struct IncomingCallMailbox {
    identity: String,
    store: Arc<dyn RecordStore>,
    channel: SignalingChannel,
    availability: Arc<dyn CallAvailability>,
    config: CoordinatorConfig,
    state: Mutex<MailboxState>,
    events: broadcast::Sender<MailboxEvent>,
}

impl IncomingCallMailbox {
    /// Create an idle mailbox. Subscribe to its events, then [`start`](Self::start) it.
    pub fn new(
        store: Arc<dyn RecordStore>,
        identity: impl Into<String>,
        availability: Arc<dyn CallAvailability>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            identity: identity.into(),
            channel: SignalingChannel::new(store.clone()),
            store,
            availability,
            config,
            state: Mutex::new(MailboxState::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    /// Begin watching `calls/{identity}`. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        let mut state = self.state.lock().await;
        if state.subscription.is_some() {
            return Ok(());
        }
        let calls = self
            .channel
            .subscribe_call(&self.identity)
            .await
            .map_err(CallError::Store)?;
        state.subscription = Some(calls.handle());
        self.spawn_pump(calls);
        debug!("Mailbox for {} started", self.identity);
        Ok(())
    }

    /// Stop watching. Any pending call is forgotten without being answered.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.subscription.take() {
            handle.cancel();
            debug!("Mailbox for {} stopped", self.identity);
        }
        state.pending = None;
    }

    pub async fn pending(&self) -> Option<CallRecord> {
        self.state.lock().await.pending.clone()
    }

    /// Answer the pending call with a receiver-role coordinator.
    pub async fn accept(
        &self,
        factory: &dyn TransportFactory,
    ) -> Result<Arc<CallCoordinator>, CallError> {
        let record = self
            .state
            .lock()
            .await
            .pending
            .take()
            .ok_or(CallError::NoPendingCall)?;
        info!("Answering call {} from {}", record.id, record.caller_id);
        let coordinator =
            CallCoordinator::answer(self.store.clone(), factory, record, self.config.clone())
                .await?;
        coordinator.accept().await?;
        Ok(coordinator)
    }

    /// Decline the pending call without setting up media.
    pub async fn reject(&self) -> Result<(), CallError> {
        let record = self
            .state
            .lock()
            .await
            .pending
            .take()
            .ok_or(CallError::NoPendingCall)?;
        info!("Declining call {} from {}", record.id, record.caller_id);
        self.channel
            .reject_call(&self.identity, &record.id)
            .await
            .map(|_| ())
            .map_err(CallError::SignalingWrite)
    }

    fn spawn_pump(self: &Arc<Self>, mut calls: CallSubscription) {
        let mailbox = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(snapshot) = calls.next().await {
                let Some(mailbox) = mailbox.upgrade() else {
                    break;
                };
                mailbox.on_snapshot(snapshot).await;
            }
        });
    }

    async fn on_snapshot(&self, snapshot: CallSnapshot) {
        let mut state = self.state.lock().await;
        let ringing = match snapshot {
            CallSnapshot::Present(record)
                if record.status == CallStatus::Ringing && record.caller_id != self.identity =>
            {
                Some(record)
            }
            _ => None,
        };

        // Anything but the pending call still ringing dismisses it.
        if let Some(pending) = &state.pending {
            let still_pending = ringing.as_ref().is_some_and(|r| r.id == pending.id);
            if still_pending {
                return;
            }
            info!("Call {} went away before it was answered", pending.id);
            let call_id = pending.id.clone();
            state.pending = None;
            let _ = self.events.send(MailboxEvent::Dismissed { call_id });
        }

        let Some(record) = ringing else {
            return;
        };
        if state.last_auto_rejected.as_ref() == Some(&record.id) {
            return;
        }

        if self.availability.calls_disabled() {
            info!(
                "Calls disabled for {}, declining call {} from {}",
                self.identity, record.id, record.caller_id
            );
            if let Err(e) = self.channel.reject_call(&self.identity, &record.id).await {
                warn!("Failed to decline call {}: {}", record.id, e);
            }
            state.last_auto_rejected = Some(record.id.clone());
            let _ = self.events.send(MailboxEvent::AutoRejected(record));
            return;
        }

        info!(
            "Incoming {} call {} from {}",
            record.call_type.as_str(),
            record.id,
            record.caller_name
        );
        state.pending = Some(record.clone());
        let _ = self.events.send(MailboxEvent::Incoming(record));
    }
}

impl Drop for IncomingCallMailbox {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().subscription.take() {
            handle.cancel();
        }
    }
}
