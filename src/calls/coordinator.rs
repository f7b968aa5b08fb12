//! Per-participant driver of one call attempt.

use super::error::CallError;
use super::events::CallEvent;
use super::session::CallSession;
use super::signaling::{CallSnapshot, CallSubscription, CandidateSubscription, SignalingChannel};
use crate::store::RecordStore;
use crate::transport::{
    OutputProfile, TransportConfig, TransportError, TransportEvent, TransportEvents,
    TransportFactory, TransportSession,
};
use log::{debug, info, warn};
use serde::Deserialize;
use signalbox_core::store::StoreError;
use signalbox_core::{
    CallId, CallRecord, CallRole, CallStatus, CallType, CallUpdate, CallerProfile, EndReason,
    IceCandidate, LocalCallStatus, SessionDescription, StatusTransition,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{self, Instant};

/// Configuration for a call coordinator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub transport: TransportConfig,
    pub speaker_profile: OutputProfile,
    pub earpiece_profile: OutputProfile,
    /// Whether calls start on the loudspeaker.
    pub speaker_on_start: bool,
    /// Period of the duration counter in milliseconds.
    pub duration_tick_ms: u64,
    /// Refuse to dial a receiver whose key already holds a live call.
    pub refuse_busy_receiver: bool,
    /// Capacity of the UI event channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            speaker_profile: OutputProfile::SPEAKER,
            earpiece_profile: OutputProfile::EARPIECE,
            speaker_on_start: true,
            duration_tick_ms: 1000,
            refuse_busy_receiver: false,
            event_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn output_profile(&self, speaker: bool) -> OutputProfile {
        if speaker {
            self.speaker_profile
        } else {
            self.earpiece_profile
        }
    }

    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms.max(1))
    }
}

/// Drives one participant through one call attempt.
///
/// All handling (user actions, record and candidate notifications, transport
/// events) is serialized behind a single lock. Notification pumps hold weak
/// references, so dropping the last handle releases the call.
pub struct CallCoordinator {
    role: CallRole,
    record: CallRecord,
    channel: SignalingChannel,
    config: CoordinatorConfig,
    session: Mutex<CallSession>,
    events: broadcast::Sender<CallEvent>,
    status_tx: watch::Sender<LocalCallStatus>,
    duration: Arc<AtomicU64>,
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("role", &self.role)
            .field("call_id", &self.record.id)
            .field("receiver_id", &self.record.receiver_id)
            .field("status", &self.status().as_str())
            .finish()
    }
}

impl CallCoordinator {
    fn new(
        role: CallRole,
        record: CallRecord,
        store: Arc<dyn RecordStore>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let session = CallSession::new(config.speaker_on_start);
        let (status_tx, _) = watch::channel(session.status.clone());
        Arc::new(Self {
            role,
            record,
            channel: SignalingChannel::new(store),
            config,
            session: Mutex::new(session),
            events,
            status_tx,
            duration: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Place a call from `caller` to `receiver_id`.
    ///
    /// Returns once the record with the offer is published; the call then
    /// stays `ringing` until the receiver answers or declines. On error no
    /// record is left behind.
    pub async fn dial(
        store: Arc<dyn RecordStore>,
        factory: &dyn TransportFactory,
        caller: &CallerProfile,
        receiver_id: &str,
        call_type: CallType,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>, CallError> {
        let record = CallRecord::ringing(CallId::generate(), caller, receiver_id, call_type);
        let coordinator = Self::new(CallRole::Caller, record, store, config);

        if coordinator.config.refuse_busy_receiver {
            coordinator.ensure_receiver_free().await?;
        }

        coordinator.start_caller(factory).await?;
        Ok(coordinator)
    }

    /// Join an incoming call as the receiver. The call stays `ringing` until
    /// [`accept`](Self::accept) or [`reject`](Self::reject).
    pub async fn answer(
        store: Arc<dyn RecordStore>,
        factory: &dyn TransportFactory,
        seed: CallRecord,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>, CallError> {
        let coordinator = Self::new(CallRole::Receiver, seed, store, config);
        coordinator.start_receiver(factory).await?;
        Ok(coordinator)
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn call_id(&self) -> &CallId {
        &self.record.id
    }

    /// The record this call was started from.
    pub fn record(&self) -> &CallRecord {
        &self.record
    }

    pub fn status(&self) -> LocalCallStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch the local status. The receiver always sees the latest value.
    pub fn status_watch(&self) -> watch::Receiver<LocalCallStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration.load(Ordering::Relaxed)
    }

    pub async fn is_muted(&self) -> bool {
        self.session.lock().await.muted
    }

    pub async fn is_speaker(&self) -> bool {
        self.session.lock().await.speaker
    }

    /// Accept the incoming call: answer, publish it and go active.
    pub async fn accept(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        self.ensure_pending_receiver(&session, "accept")?;
        let Some(transport) = session.transport.clone() else {
            return Err(CallError::InvalidState {
                state: session.status.as_str(),
                action: "accept",
            });
        };
        session.answered = true;

        match self.channel.fetch_call(&self.record.receiver_id).await {
            Ok(Some(current))
                if current.id == self.record.id && current.status == CallStatus::Ringing => {}
            Ok(_) => {
                info!("Call {} is no longer ringing, cannot accept", self.record.id);
                self.finish(&mut session, EndReason::RemoteHangup);
                return Err(CallError::InvalidState {
                    state: "ended",
                    action: "accept",
                });
            }
            Err(e) => {
                warn!("Failed to read call {} before accepting: {}", self.record.id, e);
                self.finish(&mut session, EndReason::SignalingFailed);
                return Err(CallError::Store(e));
            }
        }

        let negotiated = async {
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            Ok::<_, TransportError>(answer)
        }
        .await;
        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to answer call {}: {}", self.record.id, e);
                self.finish(&mut session, EndReason::NegotiationFailed);
                self.reject_best_effort().await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .channel
            .update_call(&self.record.receiver_id, &CallUpdate::accepted(answer))
            .await
        {
            warn!("Failed to publish answer for call {}: {}", self.record.id, e);
            self.finish(&mut session, EndReason::SignalingFailed);
            self.reject_best_effort().await;
            return Err(CallError::SignalingWrite(e));
        }
        // A hangup that landed after the ringing check turns the merge into a
        // partial record with nobody behind it.
        match self.channel.clear_fragment(&self.record.receiver_id).await {
            Ok(false) => {}
            Ok(true) => {
                info!("Call {} was removed while answering", self.record.id);
                self.finish(&mut session, EndReason::RemoteHangup);
                return Err(CallError::InvalidState {
                    state: "ended",
                    action: "accept",
                });
            }
            Err(e) => warn!("Failed to verify answer for call {}: {}", self.record.id, e),
        }

        session.status.apply(StatusTransition::LocalAccepted)?;
        self.publish_status(&session.status);
        self.start_ticker(&mut session);
        info!("Accepted call {} from {}", self.record.id, self.record.caller_id);
        Ok(())
    }

    /// Decline the incoming call.
    pub async fn reject(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        self.ensure_pending_receiver(&session, "reject")?;
        let published = self.publish_rejection().await;
        self.finish(&mut session, EndReason::LocalRejected);
        published.map_err(CallError::SignalingWrite)
    }

    /// Hang up. Deletes the record and candidates best-effort; calling it on
    /// an ended call does nothing.
    pub async fn end(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if session.status.is_ended() {
            debug!("Call {} already ended", self.record.id);
            return Ok(());
        }
        self.finish(&mut session, EndReason::LocalHangup);
        self.discard_call().await;
        Ok(())
    }

    pub async fn set_muted(&self, muted: bool) {
        let mut session = self.session.lock().await;
        session.muted = muted;
        if let Some(transport) = &session.transport {
            transport.set_audio_enabled(!muted);
        }
        debug!("Call {} muted: {}", self.record.id, muted);
    }

    pub async fn set_speaker(&self, speaker: bool) {
        let mut session = self.session.lock().await;
        session.speaker = speaker;
        if let Some(transport) = &session.transport {
            transport.set_output(self.config.output_profile(speaker));
        }
        debug!("Call {} speaker: {}", self.record.id, speaker);
    }

    async fn ensure_receiver_free(&self) -> Result<(), CallError> {
        let receiver = &self.record.receiver_id;
        match self.channel.fetch_call(receiver).await {
            Ok(Some(existing)) if existing.status.is_live() => {
                info!(
                    "Receiver {} busy with call {} ({})",
                    receiver, existing.id, existing.status
                );
                Err(CallError::ReceiverBusy(receiver.clone()))
            }
            Ok(_) => Ok(()),
            Err(StoreError::Serialization(e)) => {
                debug!("Ignoring undecodable record for {}: {}", receiver, e);
                Ok(())
            }
            Err(e) => Err(CallError::Store(e)),
        }
    }

    async fn start_caller(
        self: &Arc<Self>,
        factory: &dyn TransportFactory,
    ) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        let transport = match self.open_transport(&mut session, factory).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Cannot place call {}: {}", self.record.id, e);
                self.finish(&mut session, EndReason::MediaUnavailable);
                return Err(e.into());
            }
        };

        let negotiated = async {
            let offer = transport.create_offer().await?;
            transport.set_local_description(offer.clone()).await?;
            Ok::<_, TransportError>(offer)
        }
        .await;
        let offer = match negotiated {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Failed to create offer for call {}: {}", self.record.id, e);
                self.finish(&mut session, EndReason::NegotiationFailed);
                return Err(e.into());
            }
        };

        let record = self.record.clone().with_offer(offer);
        if let Err(e) = self.channel.publish_call(&record).await {
            warn!("Failed to publish call {}: {}", self.record.id, e);
            self.finish(&mut session, EndReason::SignalingFailed);
            self.remove_candidates_best_effort().await;
            return Err(CallError::SignalingWrite(e));
        }

        if let Err(e) = self.watch_remote(&mut session).await {
            warn!("Failed to watch call {}: {}", self.record.id, e);
            self.finish(&mut session, EndReason::SignalingFailed);
            self.discard_call().await;
            return Err(CallError::Store(e));
        }

        info!(
            "Calling {} ({} call {})",
            self.record.receiver_id,
            record.call_type.as_str(),
            self.record.id
        );
        Ok(())
    }

    async fn start_receiver(
        self: &Arc<Self>,
        factory: &dyn TransportFactory,
    ) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        let transport = match self.open_transport(&mut session, factory).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Cannot join call {}: {}", self.record.id, e);
                self.finish(&mut session, EndReason::MediaUnavailable);
                self.reject_best_effort().await;
                return Err(e.into());
            }
        };

        let Some(offer) = self.record.offer.clone() else {
            warn!("Call {} carries no offer", self.record.id);
            self.finish(&mut session, EndReason::NegotiationFailed);
            self.reject_best_effort().await;
            return Err(CallError::Negotiation("call record has no offer".to_string()));
        };
        if let Err(e) = transport.set_remote_description(offer).await {
            warn!("Failed to apply offer for call {}: {}", self.record.id, e);
            self.finish(&mut session, EndReason::NegotiationFailed);
            self.reject_best_effort().await;
            return Err(e.into());
        }

        if let Err(e) = self.watch_remote(&mut session).await {
            warn!("Failed to watch call {}: {}", self.record.id, e);
            self.finish(&mut session, EndReason::SignalingFailed);
            self.reject_best_effort().await;
            return Err(CallError::Store(e));
        }

        info!(
            "Incoming call {} from {} ({})",
            self.record.id, self.record.caller_id, self.record.caller_name
        );
        Ok(())
    }

    fn ensure_pending_receiver(
        &self,
        session: &CallSession,
        action: &'static str,
    ) -> Result<(), CallError> {
        if self.role == CallRole::Receiver && session.status.is_ringing() && !session.answered {
            return Ok(());
        }
        Err(CallError::InvalidState {
            state: if session.answered && session.status.is_ringing() {
                "answering"
            } else {
                session.status.as_str()
            },
            action,
        })
    }

    async fn open_transport(
        self: &Arc<Self>,
        session: &mut CallSession,
        factory: &dyn TransportFactory,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let (transport, events) = factory.open(&self.config.transport).await?;
        transport.set_output(self.config.output_profile(session.speaker));
        session.transport = Some(transport.clone());
        self.spawn_transport_pump(events);
        Ok(transport)
    }

    /// Subscribe to the record and to the other side's candidates.
    async fn watch_remote(self: &Arc<Self>, session: &mut CallSession) -> Result<(), StoreError> {
        let calls = self
            .channel
            .subscribe_call(&self.record.receiver_id)
            .await?;
        let candidates = self
            .channel
            .subscribe_candidates(&self.record.id, self.role.remote())
            .await?;
        session.subscriptions.push(calls.handle());
        session.subscriptions.push(candidates.handle());
        self.spawn_record_pump(calls);
        self.spawn_candidate_pump(candidates);
        Ok(())
    }

    fn spawn_record_pump(self: &Arc<Self>, mut calls: CallSubscription) {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(snapshot) = calls.next().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.on_record_change(snapshot).await;
            }
        });
    }

    fn spawn_candidate_pump(self: &Arc<Self>, mut candidates: CandidateSubscription) {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(candidate) = candidates.next().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.on_remote_candidate(candidate).await;
            }
        });
    }

    fn spawn_transport_pump(self: &Arc<Self>, mut events: TransportEvents) {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.on_transport_event(event).await;
            }
        });
    }

    async fn on_record_change(&self, snapshot: CallSnapshot) {
        let mut session = self.session.lock().await;
        if session.status.is_ended() {
            debug!("Ignoring record change for ended call {}", self.record.id);
            return;
        }

        let record = match snapshot {
            CallSnapshot::Absent => {
                info!("Call {} was removed by the other side", self.record.id);
                self.finish(&mut session, EndReason::RemoteHangup);
                return;
            }
            CallSnapshot::Present(record) => record,
        };

        if record.id != self.record.id {
            info!(
                "Call {} was replaced by call {} from {}",
                self.record.id, record.id, record.caller_id
            );
            self.finish(&mut session, EndReason::RemoteHangup);
            return;
        }

        match record.status {
            CallStatus::Ringing => debug!("Call {} is ringing", self.record.id),
            CallStatus::Accepted => match self.role {
                CallRole::Caller => self.apply_answer(&mut session, record.answer).await,
                CallRole::Receiver => {
                    debug!("Ignoring accepted notification for call {}", self.record.id)
                }
            },
            CallStatus::Rejected => {
                info!("Call {} was declined", self.record.id);
                self.finish(&mut session, EndReason::RemoteRejected);
                self.discard_call().await;
            }
            CallStatus::Ended => {
                info!("Call {} was ended by the other side", self.record.id);
                self.finish(&mut session, EndReason::RemoteHangup);
                self.discard_call().await;
            }
        }
    }

    async fn apply_answer(&self, session: &mut CallSession, answer: Option<SessionDescription>) {
        let Some(answer) = answer else {
            debug!("Call {} accepted without an answer yet", self.record.id);
            return;
        };
        let Some(transport) = session.transport.clone() else {
            return;
        };
        if transport.has_remote_description() {
            debug!("Answer for call {} already applied", self.record.id);
            return;
        }
        if let Err(e) = session.status.apply(StatusTransition::RemoteAnswerReceived) {
            debug!("Ignoring answer for call {}: {}", self.record.id, e);
            return;
        }
        self.publish_status(&session.status);

        if let Err(e) = transport.set_remote_description(answer).await {
            warn!("Failed to apply answer for call {}: {}", self.record.id, e);
            self.finish(session, EndReason::NegotiationFailed);
            self.discard_call().await;
            return;
        }
        self.flush_candidates(session, transport.as_ref()).await;
        if let Err(e) = session.status.apply(StatusTransition::RemoteAnswerApplied) {
            debug!("Call {} left connecting early: {}", self.record.id, e);
            return;
        }
        self.publish_status(&session.status);
        self.start_ticker(session);
        info!("Call {} connected to {}", self.record.id, self.record.receiver_id);
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let mut session = self.session.lock().await;
        if session.status.is_ended() {
            debug!("Dropping candidate for ended call {}", self.record.id);
            return;
        }
        let Some(transport) = session.transport.clone() else {
            return;
        };
        if !transport.has_remote_description() {
            debug!(
                "Queueing candidate for call {} until the answer is applied",
                self.record.id
            );
            session.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Failed to add candidate for call {}: {}", self.record.id, e);
        }
    }

    async fn flush_candidates(&self, session: &mut CallSession, transport: &dyn TransportSession) {
        let queued = std::mem::take(&mut session.pending_candidates);
        if queued.is_empty() {
            return;
        }
        debug!(
            "Applying {} queued candidate(s) for call {}",
            queued.len(),
            self.record.id
        );
        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Failed to add candidate for call {}: {}", self.record.id, e);
            }
        }
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        let session = self.session.lock().await;
        if session.status.is_ended() {
            debug!("Dropping transport event for ended call {}", self.record.id);
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .channel
                    .append_candidate(&self.record.id, self.role, &candidate)
                    .await
                {
                    warn!("Failed to relay candidate for call {}: {}", self.record.id, e);
                }
            }
            TransportEvent::RemoteTrack(track) => {
                if let Some(transport) = &session.transport {
                    let profile = self.config.output_profile(session.speaker);
                    transport.attach_remote_track(&track, profile);
                }
                debug!("Remote {:?} track {} on call {}", track.kind, track.id, self.record.id);
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
        }
    }

    fn start_ticker(&self, session: &mut CallSession) {
        if session.ticker.is_some() {
            return;
        }
        let duration = self.duration.clone();
        let events = self.events.clone();
        let tick = self.config.duration_tick();
        session.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + tick, tick);
            loop {
                interval.tick().await;
                let secs = duration.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = events.send(CallEvent::Duration(secs));
            }
        }));
    }

    /// Move to `ended` and release local resources. No store writes.
    fn finish(&self, session: &mut CallSession, reason: EndReason) {
        if let Err(e) = session
            .status
            .apply(StatusTransition::Terminated { reason })
        {
            debug!("Call {} not ended again: {}", self.record.id, e);
            return;
        }
        session.teardown();
        info!("Call {} ended: {}", self.record.id, reason);
        self.publish_status(&session.status);
    }

    fn publish_status(&self, status: &LocalCallStatus) {
        self.status_tx.send_replace(status.clone());
        let _ = self.events.send(CallEvent::Status(status.clone()));
    }

    async fn publish_rejection(&self) -> Result<(), StoreError> {
        self.channel
            .reject_call(&self.record.receiver_id, &self.record.id)
            .await
            .map(|_| ())
    }

    async fn reject_best_effort(&self) {
        if let Err(e) = self.publish_rejection().await {
            warn!("Failed to reject call {}: {}", self.record.id, e);
        }
    }

    async fn remove_candidates_best_effort(&self) {
        if let Err(e) = self.channel.remove_candidates(&self.record.id).await {
            debug!("Failed to remove candidates of call {}: {}", self.record.id, e);
        }
    }

    /// Delete the record and both candidate partitions, logging failures.
    async fn discard_call(&self) {
        if let Err(e) = self
            .channel
            .delete_call_if_current(&self.record.receiver_id, &self.record.id)
            .await
        {
            warn!("Failed to delete call {}: {}", self.record.id, e);
        }
        self.remove_candidates_best_effort().await;
    }
}

impl Drop for CallCoordinator {
    fn drop(&mut self) {
        self.session.get_mut().teardown();
    }
}
