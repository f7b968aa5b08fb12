//! In-process transport used by tests and the demo binary.
//!
//! Sessions negotiate with placeholder SDP, emit a scripted number of host
//! candidates when the local description is set and one remote audio track
//! when the remote description is set. Everything applied to a session is
//! recorded for inspection.

use super::{
    OutputProfile, RemoteTrack, TrackKind, TransportConfig, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportSession,
};
use async_trait::async_trait;
use log::{debug, warn};
use signalbox_core::{IceCandidate, SdpType, SessionDescription};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Builds [`MockTransportSession`]s and keeps every one it opened.
pub struct MockTransportFactory {
    label: String,
    candidates_per_session: AtomicUsize,
    deny_media: AtomicBool,
    fail_remote_description: AtomicBool,
    opened: Mutex<Vec<Arc<MockTransportSession>>>,
}

impl MockTransportFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            candidates_per_session: AtomicUsize::new(2),
            deny_media: AtomicBool::new(false),
            fail_remote_description: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Number of local candidates each session gathers.
    pub fn with_candidates(self, count: usize) -> Self {
        self.candidates_per_session.store(count, Ordering::SeqCst);
        self
    }

    /// Make `open` fail as if capture permission was refused.
    pub fn deny_media(&self, deny: bool) {
        self.deny_media.store(deny, Ordering::SeqCst);
    }

    /// Make `set_remote_description` fail on sessions opened from now on.
    pub fn fail_remote_description(&self, fail: bool) {
        self.fail_remote_description.store(fail, Ordering::SeqCst);
    }

    pub fn last_session(&self) -> Option<Arc<MockTransportSession>> {
        lock(&self.opened).last().cloned()
    }

    pub fn opened_count(&self) -> usize {
        lock(&self.opened).len()
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn TransportSession>, TransportEvents), TransportError> {
        if self.deny_media.load(Ordering::SeqCst) {
            return Err(TransportError::MediaAcquisition(
                "microphone permission denied".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let index = self.opened_count() + 1;
        let session = Arc::new(MockTransportSession {
            name: format!("{}-{}", self.label, index),
            candidates_per_session: self.candidates_per_session.load(Ordering::SeqCst),
            fail_remote_description: self.fail_remote_description.load(Ordering::SeqCst),
            events: Mutex::new(Some(tx)),
            state: Mutex::new(MockState::default()),
        });
        debug!(
            "Opened mock transport {} with {} ICE server(s)",
            session.name,
            config.ice_servers.len()
        );
        lock(&self.opened).push(session.clone());
        Ok((session, rx))
    }
}

#[derive(Debug)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_description_sets: usize,
    candidates: Vec<IceCandidate>,
    audio_enabled: bool,
    output: OutputProfile,
    attached: Vec<(RemoteTrack, OutputProfile)>,
    close_calls: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            remote_description_sets: 0,
            candidates: Vec::new(),
            audio_enabled: true,
            output: OutputProfile::default(),
            attached: Vec::new(),
            close_calls: 0,
        }
    }
}

/// A recorded, scriptable transport session.
pub struct MockTransportSession {
    name: String,
    candidates_per_session: usize,
    fail_remote_description: bool,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    state: Mutex<MockState>,
}

impl MockTransportSession {
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state().remote.clone()
    }

    /// How many times a remote description was applied.
    pub fn remote_description_sets(&self) -> usize {
        self.state().remote_description_sets
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state().candidates.clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.state().audio_enabled
    }

    pub fn output(&self) -> OutputProfile {
        self.state().output
    }

    pub fn attached_tracks(&self) -> Vec<(RemoteTrack, OutputProfile)> {
        self.state().attached.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().close_calls > 0
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Push an event as if the transport produced it. Returns false once the
    /// session is closed.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let guard = lock(&self.events);
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("Mock transport {} dropped event: {}", self.name, e);
                false
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn host_candidate(&self, n: usize) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{n} 1 UDP 2130706431 10.0.0.{} {} typ host",
            n + 1,
            50_000 + n
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
    }
}

#[async_trait]
impl TransportSession for MockTransportSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=- {} 1 IN IP4 0.0.0.0\r\ns=offer\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.name
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        match self.state().remote.as_ref() {
            Some(remote) if remote.sdp_type == SdpType::Offer => {}
            _ => {
                return Err(TransportError::Negotiation(
                    "no remote offer to answer".to_string(),
                ));
            }
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=- {} 1 IN IP4 0.0.0.0\r\ns=answer\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.name
        )))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state().local = Some(desc);
        for n in 0..self.candidates_per_session {
            self.emit(TransportEvent::LocalCandidate(self.host_candidate(n)));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.fail_remote_description {
            return Err(TransportError::Negotiation(format!(
                "could not apply remote {:?}",
                desc.sdp_type
            )));
        }
        let first = {
            let mut state = self.state();
            state.remote = Some(desc);
            state.remote_description_sets += 1;
            state.remote_description_sets == 1
        };
        if first {
            self.emit(TransportEvent::RemoteTrack(RemoteTrack {
                id: format!("{}-remote-audio", self.name),
                kind: TrackKind::Audio,
            }));
        }
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(TransportError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        if candidate.candidate_type().is_none() {
            return Err(TransportError::Candidate(format!(
                "unparseable candidate {:?}",
                candidate.candidate
            )));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.state().audio_enabled = enabled;
    }

    fn set_output(&self, profile: OutputProfile) {
        self.state().output = profile;
    }

    fn attach_remote_track(&self, track: &RemoteTrack, profile: OutputProfile) {
        let mut state = self.state();
        state.output = profile;
        state.attached.push((track.clone(), profile));
    }

    fn close(&self) {
        self.state().close_calls += 1;
        lock(&self.events).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
