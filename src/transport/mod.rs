//! Seam to the local media/transport session.
//!
//! The signaling core never touches media. A [`TransportFactory`] acquires
//! local capture and builds a [`TransportSession`]; the session reports
//! locally discovered candidates and incoming remote tracks on its event
//! channel.

pub mod mock;

use async_trait::async_trait;
use serde::Deserialize;
use signalbox_core::{IceCandidate, SessionDescription};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("local media unavailable: {0}")]
    MediaAcquisition(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("transport closed")]
    Closed,
}

/// Media kind of a remote track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A track received from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Events emitted by a transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A candidate was discovered locally and should reach the peer.
    LocalCandidate(IceCandidate),
    /// The peer's media arrived.
    RemoteTrack(RemoteTrack),
}

/// Event stream of one transport session. Ends when the session closes.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Playback level for remote audio: element volume and boost gain.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct OutputProfile {
    pub volume: f32,
    pub gain: f32,
}

impl OutputProfile {
    pub const SPEAKER: Self = Self {
        volume: 1.0,
        gain: 2.5,
    };

    pub const EARPIECE: Self = Self {
        volume: 0.6,
        gain: 1.5,
    };
}

impl Default for OutputProfile {
    fn default() -> Self {
        Self::SPEAKER
    }
}

/// A STUN/TURN server handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// What the transport should capture and which servers it may use.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
    pub audio: bool,
    pub video: bool,
    /// Capacity of the event channel returned by [`TransportFactory::open`].
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            audio: true,
            video: false,
            event_capacity: 64,
        }
    }
}

/// One local peer connection plus its captured media.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Enable or disable the captured audio tracks.
    fn set_audio_enabled(&self, enabled: bool);

    fn set_output(&self, profile: OutputProfile);

    /// Route a remote track to playback.
    fn attach_remote_track(&self, track: &RemoteTrack, profile: OutputProfile);

    /// Stop local capture and release the connection. Must tolerate being
    /// called more than once.
    fn close(&self);
}

/// Builds transport sessions.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Acquire local media and create a session, along with its event stream.
    /// Fails with [`TransportError::MediaAcquisition`] when capture is denied.
    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn TransportSession>, TransportEvents), TransportError>;
}
