use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::MediaMode,
    protocol::{CandidatePayload, SessionDescription},
};
use thiserror::Error;
use tokio::sync::broadcast;

/// Fixed public STUN endpoints used during connectivity-candidate gathering.
/// No TURN relay is configured, so calls succeed only on networks where
/// direct or STUN-assisted connectivity is possible.
pub const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub stun_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: STUN_SERVERS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// Handle to an acquired local capture stream. Audio mode holds the
/// microphone only; video mode holds microphone and camera together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub mode: MediaMode,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture permission denied for {mode:?}")]
    PermissionDenied { mode: MediaMode },
    #[error("no capture device available for {mode:?}")]
    DeviceUnavailable { mode: MediaMode },
    #[error("media backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, mode: MediaMode) -> Result<LocalMedia, MediaError>;
    /// Idempotent under repeated release of the same handle.
    async fn release(&self, media: &LocalMedia);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> anyhow::Result<()>;
    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> anyhow::Result<()>;
    /// Attach `media` as the outgoing source. Replaces the current video
    /// track when one exists, adds one otherwise; the audio track and the
    /// underlying transport are left untouched.
    async fn attach_local_media(&self, media: &LocalMedia) -> anyhow::Result<()>;
    async fn close(&self);
    /// Locally gathered connectivity candidates, ready to relay to the peer.
    fn subscribe_candidates(&self) -> broadcast::Receiver<CandidatePayload>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, config: RtcConfig) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn acquire(&self, mode: MediaMode) -> Result<LocalMedia, MediaError> {
        Err(MediaError::DeviceUnavailable { mode })
    }

    async fn release(&self, _media: &LocalMedia) {}
}

pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn connect(&self, _config: RtcConfig) -> anyhow::Result<Arc<dyn PeerConnection>> {
        Err(anyhow!("peer connection backend is unavailable"))
    }
}
