use super::*;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use channel::{ChannelError, ChannelNotice};
use tokio::time::timeout;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct RecordingChannel {
    emitted: Mutex<Vec<ClientEmit>>,
    notices: broadcast::Sender<ChannelNotice>,
}

impl RecordingChannel {
    fn new() -> Arc<Self> {
        let (notices, _) = broadcast::channel(64);
        Arc::new(Self {
            emitted: Mutex::new(Vec::new()),
            notices,
        })
    }

    async fn emitted(&self) -> Vec<ClientEmit> {
        self.emitted.lock().await.clone()
    }

    async fn candidate_relays(&self) -> usize {
        self.emitted
            .lock()
            .await
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ClientEmit::CallSignal {
                        signal: SignalPayload::Candidate(_),
                        ..
                    }
                )
            })
            .count()
    }
}

#[async_trait]
impl EventChannel for RecordingChannel {
    async fn emit(&self, event: ClientEmit) -> Result<(), ChannelError> {
        self.emitted.lock().await.push(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct CountingMedia {
    acquired: AtomicU32,
    released: AtomicU32,
    deny: AtomicBool,
}

impl CountingMedia {
    fn live(&self) -> i64 {
        i64::from(self.acquired.load(Ordering::SeqCst))
            - i64::from(self.released.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl MediaDevices for CountingMedia {
    async fn acquire(&self, mode: MediaMode) -> Result<LocalMedia, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied { mode });
        }
        let serial = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia {
            stream_id: format!("stream-{serial}"),
            mode,
        })
    }

    async fn release(&self, _media: &LocalMedia) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeConnection {
    remote: Mutex<Vec<SessionDescription>>,
    added: Mutex<Vec<CandidatePayload>>,
    attached: Mutex<Vec<LocalMedia>>,
    closed: AtomicBool,
    candidates: broadcast::Sender<CandidatePayload>,
}

impl FakeConnection {
    fn new() -> Arc<Self> {
        let (candidates, _) = broadcast::channel(64);
        Arc::new(Self {
            remote: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            candidates,
        })
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer("local-sdp-offer"))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer("local-sdp-answer"))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> anyhow::Result<()> {
        self.remote.lock().await.push(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> anyhow::Result<()> {
        self.added.lock().await.push(candidate);
        Ok(())
    }

    async fn attach_local_media(&self, media: &LocalMedia) -> anyhow::Result<()> {
        self.attached.lock().await.push(media.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn subscribe_candidates(&self) -> broadcast::Receiver<CandidatePayload> {
        self.candidates.subscribe()
    }
}

struct FakeConnector {
    connection: Arc<FakeConnection>,
    fail: AtomicBool,
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, _config: RtcConfig) -> anyhow::Result<Arc<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("ice gathering backend offline"));
        }
        Ok(Arc::clone(&self.connection) as Arc<dyn PeerConnection>)
    }
}

struct CallHarness {
    signaling: Arc<CallSignaling>,
    channel: Arc<RecordingChannel>,
    media: Arc<CountingMedia>,
    connection: Arc<FakeConnection>,
    connector: Arc<FakeConnector>,
    events: broadcast::Sender<CoreEvent>,
}

fn harness() -> CallHarness {
    let channel = RecordingChannel::new();
    let media = Arc::new(CountingMedia::default());
    let connection = FakeConnection::new();
    let connector = Arc::new(FakeConnector {
        connection: Arc::clone(&connection),
        fail: AtomicBool::new(false),
    });
    let (events, _) = broadcast::channel(256);
    let signaling = CallSignaling::new(
        UserId(1),
        channel.clone(),
        media.clone(),
        connector.clone(),
        events.clone(),
    );
    CallHarness {
        signaling,
        channel,
        media,
        connection,
        connector,
        events,
    }
}

fn candidate(tag: &str) -> CandidatePayload {
    CandidatePayload {
        candidate: format!("candidate:{tag} 1 udp 2122260223 192.0.2.1 54400 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

#[tokio::test]
async fn place_call_emits_offer_and_connects_on_remote_accept() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");

    let snapshot = h.signaling.snapshot().await;
    assert_eq!(snapshot.phase, CallPhase::Outgoing);
    assert_eq!(snapshot.peer_id, Some(UserId(9)));
    assert_eq!(snapshot.direction, Some(CallDirection::Outgoing));
    assert_eq!(snapshot.mode, Some(MediaMode::Audio));
    assert!(snapshot.started_at.is_none());

    match h.channel.emitted().await.last() {
        Some(ClientEmit::CallUser {
            peer_id,
            mode,
            offer,
        }) => {
            assert_eq!(*peer_id, UserId(9));
            assert_eq!(*mode, MediaMode::Audio);
            assert_eq!(offer.kind, SdpKind::Offer);
        }
        other => panic!("unexpected emit: {other:?}"),
    }
    assert_eq!(h.media.live(), 1);
    assert_eq!(h.connection.attached.lock().await.len(), 1);

    h.signaling.handle_remote_accepted().await;
    let snapshot = h.signaling.snapshot().await;
    assert_eq!(snapshot.phase, CallPhase::Connected);
    assert!(snapshot.started_at.is_some());
}

#[tokio::test]
async fn second_place_call_is_refused_while_active() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");
    match h.signaling.place_call(UserId(4), MediaMode::Audio).await {
        Err(CallSetupError::CallInProgress) => {}
        other => panic!("unexpected place result: {other:?}"),
    }
}

#[tokio::test]
async fn peer_rejection_tears_down_completely() {
    let h = harness();
    let mut events = h.events.subscribe();
    h.signaling
        .place_call(UserId(9), MediaMode::Video)
        .await
        .expect("place");

    h.signaling.handle_remote_rejected().await;

    assert_eq!(h.signaling.snapshot().await, CallSnapshot::idle());
    assert_eq!(h.media.live(), 0);
    assert!(h.connection.closed.load(Ordering::SeqCst));

    let reason = loop {
        match events.recv().await.expect("event") {
            CoreEvent::CallEnded { reason, peer_id } => {
                assert_eq!(peer_id, UserId(9));
                break reason;
            }
            _ => continue,
        }
    };
    assert_eq!(reason, CallEndReason::RemoteRejected);
}

#[tokio::test]
async fn incoming_call_defers_media_until_accept() {
    let h = harness();
    h.signaling
        .handle_incoming(
            UserId(5),
            MediaMode::Video,
            SessionDescription::offer("remote-offer"),
        )
        .await;

    let snapshot = h.signaling.snapshot().await;
    assert_eq!(snapshot.phase, CallPhase::Incoming);
    assert_eq!(snapshot.direction, Some(CallDirection::Incoming));
    assert_eq!(h.media.acquired.load(Ordering::SeqCst), 0);

    h.signaling.accept_call().await.expect("accept");

    assert_eq!(h.media.live(), 1);
    assert_eq!(
        h.connection.remote.lock().await.clone(),
        vec![SessionDescription::offer("remote-offer")]
    );
    match h.channel.emitted().await.last() {
        Some(ClientEmit::AcceptCall { peer_id, answer }) => {
            assert_eq!(*peer_id, UserId(5));
            assert_eq!(answer.kind, SdpKind::Answer);
        }
        other => panic!("unexpected emit: {other:?}"),
    }
    let snapshot = h.signaling.snapshot().await;
    assert_eq!(snapshot.phase, CallPhase::Connected);
    assert!(snapshot.started_at.is_some());
}

#[tokio::test]
async fn reject_never_touches_capture_devices() {
    let h = harness();
    h.signaling
        .handle_incoming(
            UserId(5),
            MediaMode::Audio,
            SessionDescription::offer("remote-offer"),
        )
        .await;

    h.signaling.reject_call().await.expect("reject");

    assert!(h
        .channel
        .emitted()
        .await
        .iter()
        .any(|e| matches!(e, ClientEmit::RejectCall { peer_id: UserId(5) })));
    assert_eq!(h.media.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(h.media.released.load(Ordering::SeqCst), 0);
    assert_eq!(h.signaling.snapshot().await, CallSnapshot::idle());
}

#[tokio::test]
async fn second_incoming_call_is_rejected_without_disturbing_the_active_one() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");
    let before = h.signaling.snapshot().await;

    h.signaling
        .handle_incoming(
            UserId(5),
            MediaMode::Audio,
            SessionDescription::offer("remote-offer"),
        )
        .await;

    assert!(h
        .channel
        .emitted()
        .await
        .iter()
        .any(|e| matches!(e, ClientEmit::RejectCall { peer_id: UserId(5) })));
    assert_eq!(h.signaling.snapshot().await, before);
    assert_eq!(h.media.live(), 1);
}

#[tokio::test]
async fn early_candidates_are_buffered_until_the_description_lands() {
    let h = harness();
    h.signaling
        .handle_incoming(
            UserId(5),
            MediaMode::Audio,
            SessionDescription::offer("remote-offer"),
        )
        .await;

    // The candidate legitimately outruns the accept; it must be buffered,
    // not dropped and not treated as an error.
    h.signaling
        .handle_signal(UserId(5), SignalPayload::Candidate(candidate("early")))
        .await;
    assert!(h.connection.added.lock().await.is_empty());

    h.signaling.accept_call().await.expect("accept");
    assert_eq!(
        h.connection.added.lock().await.clone(),
        vec![candidate("early")]
    );

    // After the remote description is set, candidates apply immediately.
    h.signaling
        .handle_signal(UserId(5), SignalPayload::Candidate(candidate("late")))
        .await;
    assert_eq!(h.connection.added.lock().await.len(), 2);
}

#[tokio::test]
async fn answer_signal_sets_remote_description_only() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");
    let emits_before = h.channel.emitted().await.len();

    h.signaling
        .handle_signal(
            UserId(9),
            SignalPayload::Description(SessionDescription::answer("remote-answer")),
        )
        .await;

    assert_eq!(
        h.connection.remote.lock().await.clone(),
        vec![SessionDescription::answer("remote-answer")]
    );
    assert_eq!(h.channel.emitted().await.len(), emits_before);
}

#[tokio::test]
async fn offer_signal_mid_call_triggers_an_answer() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");
    h.signaling.handle_remote_accepted().await;

    h.signaling
        .handle_signal(
            UserId(9),
            SignalPayload::Description(SessionDescription::offer("renegotiation")),
        )
        .await;

    assert!(h
        .connection
        .remote
        .lock()
        .await
        .contains(&SessionDescription::offer("renegotiation")));
    match h.channel.emitted().await.last() {
        Some(ClientEmit::CallSignal {
            peer_id,
            signal: SignalPayload::Description(description),
        }) => {
            assert_eq!(*peer_id, UserId(9));
            assert_eq!(description.kind, SdpKind::Answer);
        }
        other => panic!("unexpected emit: {other:?}"),
    }
}

#[tokio::test]
async fn signals_from_non_participants_are_ignored() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");
    let before = h.signaling.snapshot().await;

    h.signaling
        .handle_signal(
            UserId(7),
            SignalPayload::Description(SessionDescription::answer("interloper")),
        )
        .await;

    assert!(h.connection.remote.lock().await.is_empty());
    assert_eq!(h.signaling.snapshot().await, before);
}

#[tokio::test]
async fn permission_denied_on_accept_rejects_and_surfaces() {
    let h = harness();
    h.media.deny.store(true, Ordering::SeqCst);
    h.signaling
        .handle_incoming(
            UserId(5),
            MediaMode::Video,
            SessionDescription::offer("remote-offer"),
        )
        .await;

    match h.signaling.accept_call().await {
        Err(CallSetupError::PermissionDenied) => {}
        other => panic!("unexpected accept result: {other:?}"),
    }

    assert!(h
        .channel
        .emitted()
        .await
        .iter()
        .any(|e| matches!(e, ClientEmit::RejectCall { peer_id: UserId(5) })));
    assert_eq!(h.signaling.snapshot().await, CallSnapshot::idle());
    assert_eq!(h.media.live(), 0);
}

#[tokio::test]
async fn permission_denied_on_place_ends_cleanly() {
    let h = harness();
    h.media.deny.store(true, Ordering::SeqCst);

    match h.signaling.place_call(UserId(9), MediaMode::Audio).await {
        Err(CallSetupError::PermissionDenied) => {}
        other => panic!("unexpected place result: {other:?}"),
    }
    assert_eq!(h.signaling.snapshot().await, CallSnapshot::idle());
    assert_eq!(h.media.live(), 0);
}

#[tokio::test]
async fn connector_failure_tears_down_acquired_media() {
    let h = harness();
    h.connector.fail.store(true, Ordering::SeqCst);

    match h.signaling.place_call(UserId(9), MediaMode::Audio).await {
        Err(CallSetupError::Connect(_)) => {}
        other => panic!("unexpected place result: {other:?}"),
    }
    assert_eq!(h.signaling.snapshot().await, CallSnapshot::idle());
    assert_eq!(h.media.live(), 0);
}

#[tokio::test]
async fn media_switch_replaces_the_track_without_restarting() {
    let h = harness();
    h.signaling
        .handle_incoming(
            UserId(5),
            MediaMode::Audio,
            SessionDescription::offer("remote-offer"),
        )
        .await;
    h.signaling.accept_call().await.expect("accept");

    h.signaling
        .switch_media_mode(MediaMode::Video)
        .await
        .expect("switch");

    assert_eq!(h.media.acquired.load(Ordering::SeqCst), 2);
    assert_eq!(h.media.released.load(Ordering::SeqCst), 1);
    assert_eq!(h.media.live(), 1);
    {
        let attached = h.connection.attached.lock().await;
        assert_eq!(attached.len(), 2);
        assert_eq!(attached.last().expect("attached").mode, MediaMode::Video);
    }
    assert!(!h.connection.closed.load(Ordering::SeqCst));

    let snapshot = h.signaling.snapshot().await;
    assert_eq!(snapshot.phase, CallPhase::Connected);
    assert_eq!(snapshot.mode, Some(MediaMode::Video));

    // The track change is renegotiated over the signal relay.
    match h.channel.emitted().await.last() {
        Some(ClientEmit::CallSignal {
            peer_id,
            signal: SignalPayload::Description(description),
        }) => {
            assert_eq!(*peer_id, UserId(5));
            assert_eq!(description.kind, SdpKind::Offer);
        }
        other => panic!("unexpected emit: {other:?}"),
    }
}

#[tokio::test]
async fn end_call_notifies_peer_and_releases_everything() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");
    h.signaling.handle_remote_accepted().await;

    h.signaling.end_call().await;

    assert!(h
        .channel
        .emitted()
        .await
        .iter()
        .any(|e| matches!(e, ClientEmit::EndCall { peer_id: UserId(9) })));
    assert_eq!(h.signaling.snapshot().await, CallSnapshot::idle());
    assert_eq!(h.media.live(), 0);
    assert!(h.connection.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn local_candidates_relay_while_active_and_stop_after_teardown() {
    let h = harness();
    h.signaling
        .place_call(UserId(9), MediaMode::Audio)
        .await
        .expect("place");

    let _ = h.connection.candidates.send(candidate("gathered"));
    timeout(WAIT_TIMEOUT, async {
        loop {
            if h.channel.candidate_relays().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("candidate relayed while active");

    h.signaling.handle_remote_ended().await;

    // Candidates generated after the session ended must never be emitted.
    let _ = h.connection.candidates.send(candidate("stale"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.channel.candidate_relays().await, 1);
}

#[tokio::test]
async fn accept_without_an_incoming_call_is_refused() {
    let h = harness();
    match h.signaling.accept_call().await {
        Err(CallSetupError::NoIncomingCall) => {}
        other => panic!("unexpected accept result: {other:?}"),
    }
    match h.signaling.reject_call().await {
        Err(CallSetupError::NoIncomingCall) => {}
        other => panic!("unexpected reject result: {other:?}"),
    }
    // Ending with no active call is a quiet no-op.
    h.signaling.end_call().await;
    assert!(h.channel.emitted().await.is_empty());
}
