use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientEmit, ServerEvent},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

const NOTICE_BUFFER: usize = 1024;
const OUTBOUND_BUFFER: usize = 256;
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// What a subscriber observes on the channel: connection lifecycle edges
/// and decoded server events.
#[derive(Debug, Clone)]
pub enum ChannelNotice {
    Connected,
    Disconnected,
    Event(ServerEvent),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("event channel is not connected")]
    NotConnected,
    #[error("invalid channel endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to encode outbound event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event channel closed")]
    Closed,
}

/// Persistent bidirectional event connection. Events of the same name are
/// delivered in emission order per peer; nothing is guaranteed across
/// distinct event names.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn emit(&self, event: ClientEmit) -> Result<(), ChannelError>;
    fn subscribe(&self) -> broadcast::Receiver<ChannelNotice>;
    fn is_connected(&self) -> bool;
}

/// Null object for constructing a client without a live connection.
pub struct MissingEventChannel {
    notices: broadcast::Sender<ChannelNotice>,
}

impl Default for MissingEventChannel {
    fn default() -> Self {
        let (notices, _) = broadcast::channel(1);
        Self { notices }
    }
}

#[async_trait]
impl EventChannel for MissingEventChannel {
    async fn emit(&self, _event: ClientEmit) -> Result<(), ChannelError> {
        Err(ChannelError::NotConnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    fn is_connected(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub server_url: String,
    pub user_id: UserId,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl ChannelConfig {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            user_id,
            reconnect_initial: RECONNECT_INITIAL,
            reconnect_max: RECONNECT_MAX,
        }
    }

    fn endpoint(&self) -> Result<Url, ChannelError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|err| ChannelError::InvalidEndpoint(err.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChannelError::InvalidEndpoint(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| ChannelError::InvalidEndpoint("scheme rewrite failed".to_string()))?;
        url.set_path("/events");
        url.set_query(Some(&format!("user_id={}", self.user_id.0)));
        Ok(url)
    }
}

/// WebSocket-backed [`EventChannel`] with automatic reconnection. One pump
/// task owns the socket; subscribers observe `Connected`/`Disconnected`
/// edges so they can re-join rooms after a reconnect.
pub struct WebSocketChannel {
    outbound: mpsc::Sender<String>,
    notices: broadcast::Sender<ChannelNotice>,
    connected: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl WebSocketChannel {
    pub fn connect(config: ChannelConfig) -> Result<Arc<Self>, ChannelError> {
        let endpoint = config.endpoint()?;
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(run_pump(
            endpoint,
            config.reconnect_initial,
            config.reconnect_max,
            Arc::clone(&connected),
            notices.clone(),
            outbound_rx,
        ));

        Ok(Arc::new(Self {
            outbound,
            notices,
            connected,
            pump,
        }))
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl EventChannel for WebSocketChannel {
    async fn emit(&self, event: ClientEmit) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        let frame = serde_json::to_string(&event)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn run_pump(
    endpoint: Url,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    connected: Arc<AtomicBool>,
    notices: broadcast::Sender<ChannelNotice>,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut backoff = reconnect_initial;
    loop {
        match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => {
                backoff = reconnect_initial;
                connected.store(true, Ordering::SeqCst);
                let _ = notices.send(ChannelNotice::Connected);
                info!(endpoint = %endpoint, "channel: connected");

                let (mut sink, mut reader) = stream.split();
                loop {
                    tokio::select! {
                        frame = outbound.recv() => match frame {
                            Some(text) => {
                                if let Err(err) = sink.send(Message::Text(text)).await {
                                    warn!("channel: send failed: {err}");
                                    break;
                                }
                            }
                            // All channel handles dropped; shut the pump down.
                            None => {
                                connected.store(false, Ordering::SeqCst);
                                let _ = notices.send(ChannelNotice::Disconnected);
                                return;
                            }
                        },
                        msg = reader.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        let _ = notices.send(ChannelNotice::Event(event));
                                    }
                                    Err(err) => warn!("channel: invalid server event: {err}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!("channel: receive failed: {err}");
                                break;
                            }
                        },
                    }
                }

                connected.store(false, Ordering::SeqCst);
                let _ = notices.send(ChannelNotice::Disconnected);
                warn!(endpoint = %endpoint, "channel: disconnected");
            }
            Err(err) => {
                warn!("channel: connect failed: {err}");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(reconnect_max);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
