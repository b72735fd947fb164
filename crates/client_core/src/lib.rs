use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use channel::{ChannelNotice, EventChannel};
use chrono::{DateTime, Utc};
use media_session::{MediaDevices, PeerConnector};
use serde::Serialize;
use shared::{
    domain::{ClientId, ConversationId, DeliveryState, MediaMode, MessageId, MessageKind, UserId},
    protocol::{ClientEmit, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

mod call_signaling;
pub use call_signaling::{CallEndReason, CallPhase, CallSetupError, CallSignaling, CallSnapshot};

/// How long an optimistic send may stay pending before it is marked failed.
const SEND_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
/// Inactivity window after the last keystroke before stop_typing fires.
const TYPING_STOP_DELAY: Duration = Duration::from_secs(2);
/// Local expiry for a remote typing indicator whose stop event never arrives.
/// The expiry is the source of truth; the stop event is an optimization.
const TYPING_TTL: Duration = Duration::from_secs(6);

const EVENT_BUFFER: usize = 1024;

/// Authenticated identity for this client session, passed in at construction
/// rather than read from ambient storage.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: UserId,
    pub display_name: String,
}

impl SessionContext {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// External history/read-state backend for conversations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn fetch_history(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>>;
    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()>;
    async fn delete_messages(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
    ) -> Result<()>;
}

pub struct MissingConversationStore;

#[async_trait]
impl ConversationStore for MissingConversationStore {
    async fn fetch_history(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        Err(anyhow!(
            "conversation store unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        Err(anyhow!(
            "conversation store unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn delete_messages(
        &self,
        conversation_id: ConversationId,
        _ids: &[MessageId],
    ) -> Result<()> {
        Err(anyhow!(
            "conversation store unavailable for conversation {}",
            conversation_id.0
        ))
    }
}

/// Side-effect sink for messages arriving in conversations that are not
/// currently open (unread counters, notification sounds).
pub trait Notifier: Send + Sync {
    fn message_received(&self, message: &MessagePayload);
}

pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn message_received(&self, _message: &MessagePayload) {}
}

/// Displayed identity of a message: the correlation token until the server
/// confirms, the server id afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRef {
    Local(ClientId),
    Server(MessageId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageRef,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    /// Retained after confirmation so duplicate confirmations stay no-ops.
    pub client_id: Option<ClientId>,
}

impl Message {
    fn from_confirmed(payload: MessagePayload) -> Self {
        Self {
            id: MessageRef::Server(payload.message_id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            body: payload.body,
            kind: payload.kind,
            created_at: payload.sent_at,
            delivery: DeliveryState::Confirmed,
            client_id: payload.client_id,
        }
    }
}

/// Observable state changes for the UI layer.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ConversationRefreshed {
        conversation_id: ConversationId,
    },
    MessageAppended {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        typing: bool,
    },
    CallStateChanged(CallSnapshot),
    CallEnded {
        peer_id: UserId,
        reason: CallEndReason,
    },
    Error(String),
}

struct SyncState {
    open_conversation: Option<ConversationId>,
    /// Bumped on every open; a history response whose epoch no longer
    /// matches is discarded instead of being applied to the wrong list.
    fetch_epoch: u64,
    messages: Vec<Message>,
    watchdogs: HashMap<ClientId, JoinHandle<()>>,
    typing_active: bool,
    typing_task: Option<JoinHandle<()>>,
    typing_peers: HashMap<(ConversationId, UserId), JoinHandle<()>>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            open_conversation: None,
            fetch_epoch: 0,
            messages: Vec::new(),
            watchdogs: HashMap::new(),
            typing_active: false,
            typing_task: None,
            typing_peers: HashMap::new(),
        }
    }
}

/// Client core for one logged-in user: the message sync engine plus the call
/// signaling machine, both fed from a single channel event pump.
pub struct MessengerClient {
    ctx: SessionContext,
    channel: Arc<dyn EventChannel>,
    store: Arc<dyn ConversationStore>,
    notifier: Arc<dyn Notifier>,
    call: Arc<CallSignaling>,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<CoreEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MessengerClient {
    pub fn new(
        ctx: SessionContext,
        channel: Arc<dyn EventChannel>,
        store: Arc<dyn ConversationStore>,
        media: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let call = CallSignaling::new(
            ctx.user_id,
            Arc::clone(&channel),
            media,
            connector,
            events.clone(),
        );
        Arc::new(Self {
            ctx,
            channel,
            store,
            notifier,
            call,
            inner: Mutex::new(SyncState::new()),
            events,
            pump: Mutex::new(None),
        })
    }

    pub fn with_defaults(ctx: SessionContext, channel: Arc<dyn EventChannel>) -> Arc<Self> {
        Self::new(
            ctx,
            channel,
            Arc::new(MissingConversationStore),
            Arc::new(media_session::MissingMediaDevices),
            Arc::new(media_session::MissingPeerConnector),
            Arc::new(SilentNotifier),
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionContext {
        &self.ctx
    }

    /// Snapshot of the open conversation's ordered message list.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn call_snapshot(&self) -> CallSnapshot {
        self.call.snapshot().await
    }

    /// Start draining channel notices into the sync engine and signaling
    /// machine. Idempotent; a previous pump is replaced.
    pub async fn start(self: &Arc<Self>) {
        let mut notices = self.channel.subscribe();
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match notices.recv().await {
                    Ok(notice) => client.handle_notice(notice).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "core: event pump lagged behind the channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(task) {
            previous.abort();
        }
    }

    async fn handle_notice(self: &Arc<Self>, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Connected => {
                let open = { self.inner.lock().await.open_conversation };
                if let Some(conversation_id) = open {
                    if let Err(err) = self
                        .channel
                        .emit(ClientEmit::JoinRoom { conversation_id })
                        .await
                    {
                        warn!(
                            conversation_id = conversation_id.0,
                            "core: room rejoin after reconnect failed: {err}"
                        );
                    }
                }
            }
            ChannelNotice::Disconnected => {
                info!("core: channel disconnected");
            }
            ChannelNotice::Event(event) => self.handle_server_event(event).await,
        }
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::ReceiveMessage { message } => self.apply_remote_message(message).await,
            ServerEvent::Typing {
                conversation_id,
                user_id,
            } => self.apply_remote_typing(conversation_id, user_id, true).await,
            ServerEvent::StopTyping {
                conversation_id,
                user_id,
            } => {
                self.apply_remote_typing(conversation_id, user_id, false)
                    .await
            }
            ServerEvent::IncomingCall {
                peer_id,
                mode,
                offer,
            } => self.call.handle_incoming(peer_id, mode, offer).await,
            ServerEvent::CallAccepted {} => self.call.handle_remote_accepted().await,
            ServerEvent::CallRejected {} => self.call.handle_remote_rejected().await,
            ServerEvent::CallEnded {} => self.call.handle_remote_ended().await,
            ServerEvent::CallSignal { peer_id, signal } => {
                self.call.handle_signal(peer_id, signal).await
            }
            ServerEvent::Error(err) => {
                let _ = self
                    .events
                    .send(CoreEvent::Error(format!("{:?}: {}", err.code, err.message)));
            }
        }
    }

    /// Open `conversation_id`: join its room, replace the message list with
    /// fetched history, mark it read. Safe to call repeatedly; a history
    /// response that arrives after another open has superseded it is
    /// discarded, never applied to the wrong conversation's list.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let epoch = {
            let mut guard = self.inner.lock().await;
            guard.fetch_epoch += 1;
            guard.open_conversation = Some(conversation_id);
            guard.messages.clear();
            for (_, task) in guard.typing_peers.drain() {
                task.abort();
            }
            guard.typing_active = false;
            if let Some(task) = guard.typing_task.take() {
                task.abort();
            }
            guard.fetch_epoch
        };

        if let Err(err) = self
            .channel
            .emit(ClientEmit::JoinRoom { conversation_id })
            .await
        {
            // The reconnect handler re-joins once the channel comes back.
            warn!(
                conversation_id = conversation_id.0,
                "sync: join_room emit failed: {err}"
            );
        }

        let history = self.store.fetch_history(conversation_id).await?;

        {
            let mut guard = self.inner.lock().await;
            if guard.fetch_epoch != epoch {
                info!(
                    conversation_id = conversation_id.0,
                    "sync: discarding stale history response"
                );
                return Ok(());
            }
            guard.messages = history.into_iter().map(Message::from_confirmed).collect();
        }

        let _ = self
            .events
            .send(CoreEvent::ConversationRefreshed { conversation_id });

        self.mark_read(conversation_id, false).await
    }

    /// Append an optimistic entry and emit the send. Returns the correlation
    /// token immediately; confirmation arrives through the event pump.
    pub async fn send_message(
        self: &Arc<Self>,
        body: impl Into<String>,
        kind: MessageKind,
    ) -> Result<ClientId> {
        let body = body.into();
        let conversation_id = self
            .inner
            .lock()
            .await
            .open_conversation
            .ok_or_else(|| anyhow!("no conversation is open"))?;

        let client_id = ClientId::fresh();
        let message = Message {
            id: MessageRef::Local(client_id),
            conversation_id,
            sender_id: self.ctx.user_id,
            body: body.clone(),
            kind,
            created_at: Utc::now(),
            delivery: DeliveryState::Pending,
            client_id: Some(client_id),
        };

        self.inner.lock().await.messages.push(message.clone());
        let _ = self.events.send(CoreEvent::MessageAppended { message });

        self.stop_typing(true).await;

        match self
            .channel
            .emit(ClientEmit::SendMessage {
                conversation_id,
                client_id,
                body,
                kind,
            })
            .await
        {
            Ok(()) => self.arm_send_watchdog(client_id).await,
            Err(err) => {
                warn!(conversation_id = conversation_id.0, "sync: send emit failed: {err}");
                self.fail_pending(client_id).await;
            }
        }

        Ok(client_id)
    }

    /// Re-emit a failed send under its original correlation token.
    pub async fn retry_message(self: &Arc<Self>, client_id: ClientId) -> Result<()> {
        let (conversation_id, body, kind) = {
            let mut guard = self.inner.lock().await;
            let entry = guard
                .messages
                .iter_mut()
                .find(|m| m.client_id == Some(client_id) && m.delivery == DeliveryState::Failed)
                .ok_or_else(|| anyhow!("no failed message for client id {}", client_id.0))?;
            entry.delivery = DeliveryState::Pending;
            let message = entry.clone();
            drop(guard);
            let _ = self.events.send(CoreEvent::MessageUpdated {
                message: message.clone(),
            });
            (message.conversation_id, message.body, message.kind)
        };

        match self
            .channel
            .emit(ClientEmit::SendMessage {
                conversation_id,
                client_id,
                body,
                kind,
            })
            .await
        {
            Ok(()) => {
                self.arm_send_watchdog(client_id).await;
                Ok(())
            }
            Err(err) => {
                self.fail_pending(client_id).await;
                Err(err.into())
            }
        }
    }

    async fn arm_send_watchdog(self: &Arc<Self>, client_id: ClientId) {
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(SEND_CONFIRM_TIMEOUT).await;
            client.fail_pending(client_id).await;
        });
        if let Some(previous) = self.inner.lock().await.watchdogs.insert(client_id, task) {
            previous.abort();
        }
    }

    async fn fail_pending(&self, client_id: ClientId) {
        let updated = {
            let mut guard = self.inner.lock().await;
            guard.watchdogs.remove(&client_id);
            guard
                .messages
                .iter_mut()
                .find(|m| m.client_id == Some(client_id) && m.delivery == DeliveryState::Pending)
                .map(|entry| {
                    entry.delivery = DeliveryState::Failed;
                    entry.clone()
                })
        };
        if let Some(message) = updated {
            warn!(
                client_id = %client_id.0,
                "sync: send unconfirmed within timeout; marked failed"
            );
            let _ = self.events.send(CoreEvent::MessageUpdated { message });
        }
    }

    /// Reconcile an inbound confirmed message against the local list.
    /// Match-by-client-id wins over append; duplicate ids are no-ops; an
    /// unmatched confirmation is appended rather than dropped.
    async fn apply_remote_message(&self, payload: MessagePayload) {
        let mut guard = self.inner.lock().await;
        if guard.open_conversation != Some(payload.conversation_id) {
            drop(guard);
            self.notifier.message_received(&payload);
            return;
        }

        if let Some(client_id) = payload.client_id {
            if let Some(entry) = guard
                .messages
                .iter_mut()
                .find(|m| m.client_id == Some(client_id))
            {
                if entry.delivery == DeliveryState::Confirmed {
                    return;
                }
                entry.id = MessageRef::Server(payload.message_id);
                entry.delivery = DeliveryState::Confirmed;
                entry.created_at = payload.sent_at;
                let message = entry.clone();
                if let Some(watchdog) = guard.watchdogs.remove(&client_id) {
                    watchdog.abort();
                }
                drop(guard);
                let _ = self.events.send(CoreEvent::MessageUpdated { message });
                return;
            }
        }

        if guard
            .messages
            .iter()
            .any(|m| m.id == MessageRef::Server(payload.message_id))
        {
            return;
        }

        let message = Message::from_confirmed(payload);
        guard.messages.push(message.clone());
        drop(guard);
        let _ = self.events.send(CoreEvent::MessageAppended { message });
    }

    /// Notify the store that `conversation_id` was read. Suppressed for
    /// conversations other than the open one unless `force` is set.
    pub async fn mark_read(&self, conversation_id: ConversationId, force: bool) -> Result<()> {
        let open = { self.inner.lock().await.open_conversation };
        if open != Some(conversation_id) && !force {
            return Ok(());
        }
        self.store.mark_read(conversation_id).await
    }

    pub async fn delete_messages(&self, ids: Vec<MessageId>) -> Result<()> {
        let conversation_id = self
            .inner
            .lock()
            .await
            .open_conversation
            .ok_or_else(|| anyhow!("no conversation is open"))?;
        self.store.delete_messages(conversation_id, &ids).await?;
        {
            let mut guard = self.inner.lock().await;
            guard.messages.retain(|m| match m.id {
                MessageRef::Server(id) => !ids.contains(&id),
                MessageRef::Local(_) => true,
            });
        }
        let _ = self
            .events
            .send(CoreEvent::ConversationRefreshed { conversation_id });
        Ok(())
    }

    /// Emit a typing signal for the open conversation, at most once per
    /// keystroke burst; stop_typing fires automatically after inactivity.
    pub async fn notify_typing(self: &Arc<Self>) -> Result<()> {
        let (conversation_id, first_of_burst) = {
            let mut guard = self.inner.lock().await;
            let Some(conversation_id) = guard.open_conversation else {
                return Ok(());
            };
            let first = !guard.typing_active;
            guard.typing_active = true;
            if let Some(task) = guard.typing_task.take() {
                task.abort();
            }
            (conversation_id, first)
        };

        if first_of_burst {
            self.channel
                .emit(ClientEmit::Typing { conversation_id })
                .await?;
        }

        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(TYPING_STOP_DELAY).await;
            client.stop_typing(false).await;
        });
        self.inner.lock().await.typing_task = Some(task);
        Ok(())
    }

    pub async fn notify_stop_typing(&self) {
        self.stop_typing(true).await;
    }

    async fn stop_typing(&self, abort_scheduled: bool) {
        let conversation_id = {
            let mut guard = self.inner.lock().await;
            if !guard.typing_active {
                return;
            }
            guard.typing_active = false;
            // The debounce task reaches here through its own handle; it must
            // drop rather than abort it.
            let task = guard.typing_task.take();
            if abort_scheduled {
                if let Some(task) = task {
                    task.abort();
                }
            }
            guard.open_conversation
        };
        let Some(conversation_id) = conversation_id else {
            return;
        };
        if let Err(err) = self
            .channel
            .emit(ClientEmit::StopTyping { conversation_id })
            .await
        {
            warn!(
                conversation_id = conversation_id.0,
                "sync: stop_typing emit failed: {err}"
            );
        }
    }

    async fn apply_remote_typing(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        user_id: UserId,
        typing: bool,
    ) {
        let relevant = {
            self.inner.lock().await.open_conversation == Some(conversation_id)
        };
        if !relevant {
            return;
        }

        if typing {
            let client = Arc::clone(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(TYPING_TTL).await;
                client.expire_typing(conversation_id, user_id).await;
            });
            let fresh = {
                let mut guard = self.inner.lock().await;
                match guard.typing_peers.insert((conversation_id, user_id), task) {
                    Some(previous) => {
                        previous.abort();
                        false
                    }
                    None => true,
                }
            };
            if fresh {
                let _ = self.events.send(CoreEvent::TypingChanged {
                    conversation_id,
                    user_id,
                    typing: true,
                });
            }
        } else {
            let removed = {
                self.inner
                    .lock()
                    .await
                    .typing_peers
                    .remove(&(conversation_id, user_id))
            };
            if let Some(task) = removed {
                task.abort();
                let _ = self.events.send(CoreEvent::TypingChanged {
                    conversation_id,
                    user_id,
                    typing: false,
                });
            }
        }
    }

    async fn expire_typing(&self, conversation_id: ConversationId, user_id: UserId) {
        let removed = {
            self.inner
                .lock()
                .await
                .typing_peers
                .remove(&(conversation_id, user_id))
        };
        if removed.is_some() {
            info!(
                conversation_id = conversation_id.0,
                user_id = user_id.0,
                "sync: typing indicator expired locally"
            );
            let _ = self.events.send(CoreEvent::TypingChanged {
                conversation_id,
                user_id,
                typing: false,
            });
        }
    }

    pub async fn place_call(&self, peer_id: UserId, mode: MediaMode) -> Result<(), CallSetupError> {
        self.call.place_call(peer_id, mode).await
    }

    pub async fn accept_call(&self) -> Result<(), CallSetupError> {
        self.call.accept_call().await
    }

    pub async fn reject_call(&self) -> Result<(), CallSetupError> {
        self.call.reject_call().await
    }

    pub async fn end_call(&self) {
        self.call.end_call().await;
    }

    pub async fn switch_media_mode(&self, mode: MediaMode) -> Result<()> {
        self.call.switch_media_mode(mode).await
    }
}

#[derive(Serialize)]
struct HistoryQuery {
    user_id: i64,
    limit: u32,
}

#[derive(Serialize)]
struct DeleteMessagesRequest {
    user_id: i64,
    message_ids: Vec<i64>,
}

const HISTORY_FETCH_LIMIT: u32 = 100;

/// REST-backed [`ConversationStore`].
pub struct HttpConversationStore {
    http: reqwest::Client,
    server_url: String,
    user_id: UserId,
}

impl HttpConversationStore {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
            user_id,
        }
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn fetch_history(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        let messages = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id.0
            ))
            .query(&HistoryQuery {
                user_id: self.user_id.0,
                limit: HISTORY_FETCH_LIMIT,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.http
            .post(format!(
                "{}/conversations/{}/read",
                self.server_url, conversation_id.0
            ))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_messages(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
    ) -> Result<()> {
        self.http
            .post(format!(
                "{}/conversations/{}/messages/delete",
                self.server_url, conversation_id.0
            ))
            .json(&DeleteMessagesRequest {
                user_id: self.user_id.0,
                message_ids: ids.iter().map(|id| id.0).collect(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
