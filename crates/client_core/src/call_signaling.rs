use std::sync::Arc;

use anyhow::{anyhow, Result};
use channel::EventChannel;
use chrono::{DateTime, Utc};
use media_session::{LocalMedia, MediaDevices, MediaError, PeerConnection, PeerConnector, RtcConfig};
use shared::{
    domain::{CallDirection, MediaMode, UserId},
    protocol::{CandidatePayload, ClientEmit, SdpKind, SessionDescription, SignalPayload},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::CoreEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Outgoing,
    Incoming,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    HungUp,
    RemoteEnded,
    Rejected,
    RemoteRejected,
    SetupFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub peer_id: Option<UserId>,
    pub direction: Option<CallDirection>,
    pub mode: Option<MediaMode>,
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: CallPhase::Idle,
            peer_id: None,
            direction: None,
            mode: None,
            started_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CallSetupError {
    #[error("another call is already active")]
    CallInProgress,
    #[error("no incoming call to answer")]
    NoIncomingCall,
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("media acquisition failed: {0}")]
    Media(MediaError),
    #[error("peer connection setup failed: {0}")]
    Connect(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("signaling channel failed: {0}")]
    Channel(String),
    #[error("call ended during setup")]
    Ended,
}

struct ActiveCall {
    /// Monotonic identity used to fence work started for an earlier call;
    /// a null peer-connection check is not a sufficient guard.
    session: u64,
    peer_id: UserId,
    direction: CallDirection,
    mode: MediaMode,
    phase: CallPhase,
    started_at: Option<DateTime<Utc>>,
    pending_offer: Option<SessionDescription>,
    local_media: Option<LocalMedia>,
    connection: Option<Arc<dyn PeerConnection>>,
    remote_description_set: bool,
    /// Candidates that arrived before the description that makes them valid.
    pending_candidates: Vec<CandidatePayload>,
    candidate_task: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(
        session: u64,
        peer_id: UserId,
        direction: CallDirection,
        mode: MediaMode,
        phase: CallPhase,
    ) -> Self {
        Self {
            session,
            peer_id,
            direction,
            mode,
            phase,
            started_at: None,
            pending_offer: None,
            local_media: None,
            connection: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            candidate_task: None,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase,
            peer_id: Some(self.peer_id),
            direction: Some(self.direction),
            mode: Some(self.mode),
            started_at: self.started_at,
        }
    }
}

struct CallSlot {
    next_session: u64,
    active: Option<ActiveCall>,
}

/// Drives exactly one call session through its lifecycle and keeps local
/// signaling state consistent with the remote peer over a channel with no
/// cross-event-name ordering guarantee.
pub struct CallSignaling {
    local_user: UserId,
    channel: Arc<dyn EventChannel>,
    media: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    events: broadcast::Sender<CoreEvent>,
    inner: Mutex<CallSlot>,
}

impl CallSignaling {
    pub(crate) fn new(
        local_user: UserId,
        channel: Arc<dyn EventChannel>,
        media: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        events: broadcast::Sender<CoreEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_user,
            channel,
            media,
            connector,
            events,
            inner: Mutex::new(CallSlot {
                next_session: 0,
                active: None,
            }),
        })
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let guard = self.inner.lock().await;
        match guard.active.as_ref() {
            Some(call) => call.snapshot(),
            None => CallSnapshot::idle(),
        }
    }

    /// Idle -> Outgoing: acquire local media, build an offer, emit call_user.
    pub async fn place_call(
        self: &Arc<Self>,
        peer_id: UserId,
        mode: MediaMode,
    ) -> Result<(), CallSetupError> {
        let session = {
            let mut guard = self.inner.lock().await;
            if guard.active.is_some() {
                return Err(CallSetupError::CallInProgress);
            }
            guard.next_session += 1;
            let session = guard.next_session;
            guard.active = Some(ActiveCall::new(
                session,
                peer_id,
                CallDirection::Outgoing,
                mode,
                CallPhase::Outgoing,
            ));
            session
        };
        self.publish_state().await;
        info!(
            peer_id = peer_id.0,
            caller = self.local_user.0,
            mode = ?mode,
            "call: placing outgoing call"
        );

        let local_media = match self.media.acquire(mode).await {
            Ok(media) => media,
            Err(err) => {
                self.teardown(CallEndReason::SetupFailed).await;
                return Err(setup_error_from_media(err));
            }
        };
        let media_handle = local_media.clone();
        if !self.store_media(session, local_media).await {
            return Err(CallSetupError::Ended);
        }

        let connection = match self.connector.connect(RtcConfig::default()).await {
            Ok(connection) => connection,
            Err(err) => {
                self.teardown(CallEndReason::SetupFailed).await;
                return Err(CallSetupError::Connect(err.to_string()));
            }
        };
        if !self.store_connection(session, &connection).await {
            connection.close().await;
            return Err(CallSetupError::Ended);
        }

        if let Err(err) = connection.attach_local_media(&media_handle).await {
            self.teardown(CallEndReason::SetupFailed).await;
            return Err(CallSetupError::Negotiation(err.to_string()));
        }
        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.teardown(CallEndReason::SetupFailed).await;
                return Err(CallSetupError::Negotiation(err.to_string()));
            }
        };

        self.spawn_candidate_relay(session, peer_id, &connection)
            .await;

        if let Err(err) = self
            .channel
            .emit(ClientEmit::CallUser {
                peer_id,
                mode,
                offer,
            })
            .await
        {
            self.teardown(CallEndReason::SetupFailed).await;
            return Err(CallSetupError::Channel(err.to_string()));
        }
        Ok(())
    }

    /// Remote incoming_call: Idle -> Incoming, or an immediate busy-reject
    /// that leaves the active session untouched.
    pub(crate) async fn handle_incoming(
        &self,
        peer_id: UserId,
        mode: MediaMode,
        offer: SessionDescription,
    ) {
        {
            let mut guard = self.inner.lock().await;
            if guard.active.is_some() {
                drop(guard);
                info!(
                    peer_id = peer_id.0,
                    "call: busy; rejecting second incoming call"
                );
                if let Err(err) = self.channel.emit(ClientEmit::RejectCall { peer_id }).await {
                    warn!(peer_id = peer_id.0, "call: busy-reject emit failed: {err}");
                }
                return;
            }
            guard.next_session += 1;
            let session = guard.next_session;
            let mut call = ActiveCall::new(
                session,
                peer_id,
                CallDirection::Incoming,
                mode,
                CallPhase::Incoming,
            );
            // Local media stays unacquired until accept so a rejected call
            // never triggers a device permission prompt.
            call.pending_offer = Some(offer);
            guard.active = Some(call);
        }
        self.publish_state().await;
    }

    /// Incoming -> Connected: acquire media, apply the stored offer, answer.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallSetupError> {
        let (session, peer_id, mode, offer) = {
            let guard = self.inner.lock().await;
            match guard.active.as_ref() {
                Some(call) if call.phase == CallPhase::Incoming => {
                    let offer = call.pending_offer.clone().ok_or(CallSetupError::Ended)?;
                    (call.session, call.peer_id, call.mode, offer)
                }
                _ => return Err(CallSetupError::NoIncomingCall),
            }
        };

        let local_media = match self.media.acquire(mode).await {
            Ok(media) => media,
            Err(err) => {
                let _ = self.channel.emit(ClientEmit::RejectCall { peer_id }).await;
                self.teardown(CallEndReason::SetupFailed).await;
                return Err(setup_error_from_media(err));
            }
        };
        let media_handle = local_media.clone();
        if !self.store_media(session, local_media).await {
            return Err(CallSetupError::Ended);
        }

        let connection = match self.connector.connect(RtcConfig::default()).await {
            Ok(connection) => connection,
            Err(err) => {
                self.teardown(CallEndReason::SetupFailed).await;
                return Err(CallSetupError::Connect(err.to_string()));
            }
        };
        if !self.store_connection(session, &connection).await {
            connection.close().await;
            return Err(CallSetupError::Ended);
        }

        if let Err(err) = connection.attach_local_media(&media_handle).await {
            self.teardown(CallEndReason::SetupFailed).await;
            return Err(CallSetupError::Negotiation(err.to_string()));
        }
        if let Err(err) = connection.set_remote_description(offer).await {
            self.teardown(CallEndReason::SetupFailed).await;
            return Err(CallSetupError::Negotiation(err.to_string()));
        }
        self.flush_pending_candidates(session, &connection).await;

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.teardown(CallEndReason::SetupFailed).await;
                return Err(CallSetupError::Negotiation(err.to_string()));
            }
        };

        self.spawn_candidate_relay(session, peer_id, &connection)
            .await;

        if let Err(err) = self
            .channel
            .emit(ClientEmit::AcceptCall { peer_id, answer })
            .await
        {
            self.teardown(CallEndReason::SetupFailed).await;
            return Err(CallSetupError::Channel(err.to_string()));
        }

        {
            let mut guard = self.inner.lock().await;
            if let Some(call) = guard.active.as_mut() {
                if call.session == session {
                    call.phase = CallPhase::Connected;
                    call.started_at = Some(Utc::now());
                    call.pending_offer = None;
                }
            }
        }
        self.publish_state().await;
        info!(peer_id = peer_id.0, "call: incoming call accepted");
        Ok(())
    }

    /// Incoming -> Ended. No media was ever acquired on this path.
    pub async fn reject_call(&self) -> Result<(), CallSetupError> {
        let peer_id = {
            let guard = self.inner.lock().await;
            match guard.active.as_ref() {
                Some(call) if call.phase == CallPhase::Incoming => call.peer_id,
                _ => return Err(CallSetupError::NoIncomingCall),
            }
        };
        if let Err(err) = self.channel.emit(ClientEmit::RejectCall { peer_id }).await {
            warn!(peer_id = peer_id.0, "call: reject emit failed: {err}");
        }
        self.teardown(CallEndReason::Rejected).await;
        Ok(())
    }

    /// Connected|Outgoing|Incoming -> Ended. No-op when idle.
    pub async fn end_call(&self) {
        let peer_id = {
            let guard = self.inner.lock().await;
            match guard.active.as_ref() {
                Some(call) => call.peer_id,
                None => return,
            }
        };
        if let Err(err) = self.channel.emit(ClientEmit::EndCall { peer_id }).await {
            warn!(peer_id = peer_id.0, "call: end emit failed: {err}");
        }
        self.teardown(CallEndReason::HungUp).await;
    }

    /// Outgoing -> Connected once the callee picked up. The description and
    /// candidate exchange completes asynchronously over call_signal.
    pub(crate) async fn handle_remote_accepted(&self) {
        let updated = {
            let mut guard = self.inner.lock().await;
            match guard.active.as_mut() {
                Some(call) if call.phase == CallPhase::Outgoing => {
                    call.phase = CallPhase::Connected;
                    call.started_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.publish_state().await;
        } else {
            warn!("call: call_accepted without an outgoing call; ignored");
        }
    }

    pub(crate) async fn handle_remote_rejected(&self) {
        if self.has_active().await {
            self.teardown(CallEndReason::RemoteRejected).await;
        }
    }

    pub(crate) async fn handle_remote_ended(&self) {
        if self.has_active().await {
            self.teardown(CallEndReason::RemoteEnded).await;
        }
    }

    /// Relay dispatch by payload shape. Candidates may legitimately arrive
    /// before the description that makes them valid; they are buffered, not
    /// dropped. Failures stop at this boundary and leave the call state
    /// unchanged.
    pub(crate) async fn handle_signal(&self, peer_id: UserId, signal: SignalPayload) {
        let result = match signal {
            SignalPayload::Description(description) => match description.kind {
                SdpKind::Offer => self.apply_remote_offer(peer_id, description).await,
                SdpKind::Answer => self.apply_remote_answer(peer_id, description).await,
            },
            SignalPayload::Candidate(candidate) => {
                self.apply_remote_candidate(peer_id, candidate).await
            }
        };
        if let Err(err) = result {
            warn!(peer_id = peer_id.0, "call: signal dispatch failed: {err}");
        }
    }

    /// Connected media-mode switch: re-acquire for the new mode and replace
    /// the outgoing video track in place. The audio track and the transport
    /// stay up throughout.
    pub async fn switch_media_mode(&self, mode: MediaMode) -> Result<()> {
        let (session, peer_id, connection, previous) = {
            let guard = self.inner.lock().await;
            let call = guard
                .active
                .as_ref()
                .filter(|call| call.phase == CallPhase::Connected)
                .ok_or_else(|| anyhow!("no connected call to switch"))?;
            if call.mode == mode {
                return Ok(());
            }
            let connection = call
                .connection
                .clone()
                .ok_or_else(|| anyhow!("connected call has no peer connection"))?;
            (call.session, call.peer_id, connection, call.local_media.clone())
        };

        // A switch failure leaves the call running on its previous media.
        let replacement = self
            .media
            .acquire(mode)
            .await
            .map_err(|err| anyhow!("media reacquire failed: {err}"))?;
        if let Err(err) = connection.attach_local_media(&replacement).await {
            self.media.release(&replacement).await;
            return Err(anyhow!("track replacement failed: {err}"));
        }

        {
            let mut guard = self.inner.lock().await;
            let Some(call) = guard
                .active
                .as_mut()
                .filter(|call| call.session == session)
            else {
                drop(guard);
                self.media.release(&replacement).await;
                return Err(anyhow!("call ended during media switch"));
            };
            call.local_media = Some(replacement);
            call.mode = mode;
        }
        if let Some(previous) = previous {
            self.media.release(&previous).await;
        }

        // The added/replaced track needs a renegotiation round; the remote
        // side answers it through the signal relay.
        let offer = connection.create_offer().await?;
        self.channel
            .emit(ClientEmit::CallSignal {
                peer_id,
                signal: SignalPayload::Description(offer),
            })
            .await?;

        self.publish_state().await;
        info!(peer_id = peer_id.0, mode = ?mode, "call: media mode switched");
        Ok(())
    }

    async fn apply_remote_offer(
        &self,
        peer_id: UserId,
        offer: SessionDescription,
    ) -> Result<()> {
        let (session, connection) = self.connection_for(peer_id).await?;
        connection.set_remote_description(offer).await?;
        self.flush_pending_candidates(session, &connection).await;
        let answer = connection.create_answer().await?;
        self.channel
            .emit(ClientEmit::CallSignal {
                peer_id,
                signal: SignalPayload::Description(answer),
            })
            .await
            .map_err(|err| anyhow!("answer relay failed: {err}"))
    }

    async fn apply_remote_answer(
        &self,
        peer_id: UserId,
        answer: SessionDescription,
    ) -> Result<()> {
        let (session, connection) = self.connection_for(peer_id).await?;
        connection.set_remote_description(answer).await?;
        self.flush_pending_candidates(session, &connection).await;
        Ok(())
    }

    async fn apply_remote_candidate(
        &self,
        peer_id: UserId,
        candidate: CandidatePayload,
    ) -> Result<()> {
        let connection = {
            let mut guard = self.inner.lock().await;
            let call = guard
                .active
                .as_mut()
                .ok_or_else(|| anyhow!("candidate without an active call"))?;
            if call.peer_id != peer_id {
                return Err(anyhow!(
                    "candidate from non-participant peer {}",
                    peer_id.0
                ));
            }
            match call.connection.clone() {
                Some(connection) if call.remote_description_set => connection,
                _ => {
                    call.pending_candidates.push(candidate);
                    return Ok(());
                }
            }
        };
        connection.add_remote_candidate(candidate).await
    }

    async fn connection_for(
        &self,
        peer_id: UserId,
    ) -> Result<(u64, Arc<dyn PeerConnection>)> {
        let guard = self.inner.lock().await;
        let call = guard
            .active
            .as_ref()
            .ok_or_else(|| anyhow!("signal without an active call"))?;
        if call.peer_id != peer_id {
            return Err(anyhow!("signal from non-participant peer {}", peer_id.0));
        }
        let connection = call
            .connection
            .clone()
            .ok_or_else(|| anyhow!("no peer connection for call yet"))?;
        Ok((call.session, connection))
    }

    /// Mark the remote description applied and drain candidates that were
    /// buffered while it was missing.
    async fn flush_pending_candidates(
        &self,
        session: u64,
        connection: &Arc<dyn PeerConnection>,
    ) {
        let queued = {
            let mut guard = self.inner.lock().await;
            match guard
                .active
                .as_mut()
                .filter(|call| call.session == session)
            {
                Some(call) => {
                    call.remote_description_set = true;
                    std::mem::take(&mut call.pending_candidates)
                }
                None => return,
            }
        };
        for candidate in queued {
            if let Err(err) = connection.add_remote_candidate(candidate).await {
                warn!("call: buffered candidate apply failed: {err}");
            }
        }
    }

    /// At most one relay loop runs per call. Candidates gathered after the
    /// session ended are fenced out by the session check, not by nullness of
    /// the peer-connection handle.
    async fn spawn_candidate_relay(
        self: &Arc<Self>,
        session: u64,
        peer_id: UserId,
        connection: &Arc<dyn PeerConnection>,
    ) {
        let mut candidates = connection.subscribe_candidates();
        let signaling = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Ok(candidate) = candidates.recv().await {
                let still_active = {
                    let guard = signaling.inner.lock().await;
                    guard.active.as_ref().map(|call| call.session) == Some(session)
                };
                if !still_active {
                    break;
                }
                if let Err(err) = signaling
                    .channel
                    .emit(ClientEmit::CallSignal {
                        peer_id,
                        signal: SignalPayload::Candidate(candidate),
                    })
                    .await
                {
                    warn!(peer_id = peer_id.0, "call: candidate relay failed: {err}");
                }
            }
        });

        let mut guard = self.inner.lock().await;
        match guard.active.as_mut() {
            Some(call) if call.session == session => {
                if let Some(previous) = call.candidate_task.replace(task) {
                    previous.abort();
                }
            }
            // The call ended while the relay was being set up.
            _ => task.abort(),
        }
    }

    async fn store_media(&self, session: u64, media: LocalMedia) -> bool {
        {
            let mut guard = self.inner.lock().await;
            if let Some(call) = guard.active.as_mut() {
                if call.session == session {
                    call.local_media = Some(media);
                    return true;
                }
            }
        }
        // The call this media was acquired for is gone; do not leak it.
        self.media.release(&media).await;
        false
    }

    async fn store_connection(&self, session: u64, connection: &Arc<dyn PeerConnection>) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.active.as_mut() {
            Some(call) if call.session == session => {
                call.connection = Some(Arc::clone(connection));
                true
            }
            _ => false,
        }
    }

    async fn has_active(&self) -> bool {
        self.inner.lock().await.active.is_some()
    }

    /// The single terminal transition. Every path into Ended funnels here so
    /// no acquired device or open connection can survive a call.
    async fn teardown(&self, reason: CallEndReason) {
        let call = {
            let mut guard = self.inner.lock().await;
            match guard.active.take() {
                Some(call) => call,
                None => return,
            }
        };
        if let Some(task) = call.candidate_task {
            task.abort();
        }
        if let Some(media) = call.local_media {
            self.media.release(&media).await;
        }
        if let Some(connection) = call.connection {
            connection.close().await;
        }
        info!(
            peer_id = call.peer_id.0,
            reason = ?reason,
            "call: session ended"
        );
        let _ = self.events.send(CoreEvent::CallEnded {
            peer_id: call.peer_id,
            reason,
        });
        // Ended is not observable; the machine collapses straight to Idle.
        let _ = self
            .events
            .send(CoreEvent::CallStateChanged(CallSnapshot::idle()));
    }

    async fn publish_state(&self) {
        let snapshot = self.snapshot().await;
        let _ = self.events.send(CoreEvent::CallStateChanged(snapshot));
    }
}

fn setup_error_from_media(err: MediaError) -> CallSetupError {
    match err {
        MediaError::PermissionDenied { .. } => CallSetupError::PermissionDenied,
        other => CallSetupError::Media(other),
    }
}

#[cfg(test)]
#[path = "tests/call_signaling_tests.rs"]
mod tests;
