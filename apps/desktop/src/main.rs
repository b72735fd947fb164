use anyhow::Result;
use channel::{ChannelConfig, WebSocketChannel};
use clap::Parser;
use client_core::{
    CoreEvent, HttpConversationStore, MessengerClient, SessionContext, SilentNotifier,
};
use media_session::{MissingMediaDevices, MissingPeerConnector};
use shared::domain::{ConversationId, MessageKind, UserId};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    conversation: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let user_id = UserId(args.user_id);
    let channel = WebSocketChannel::connect(ChannelConfig::new(args.server_url.clone(), user_id))?;
    let store = Arc::new(HttpConversationStore::new(args.server_url, user_id));
    let client = MessengerClient::new(
        SessionContext::new(user_id, args.display_name),
        channel,
        store,
        Arc::new(MissingMediaDevices),
        Arc::new(MissingPeerConnector),
        Arc::new(SilentNotifier),
    );
    client.start().await;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CoreEvent::MessageAppended { message } => {
                    println!("[{}] {}", message.sender_id.0, message.body);
                }
                CoreEvent::MessageUpdated { message } => {
                    println!("[{}] {} ({:?})", message.sender_id.0, message.body, message.delivery);
                }
                CoreEvent::TypingChanged {
                    user_id, typing, ..
                } => {
                    if typing {
                        println!("-- user {} is typing --", user_id.0);
                    }
                }
                CoreEvent::Error(message) => eprintln!("error: {message}"),
                _ => {}
            }
        }
    });

    client.open_conversation(ConversationId(args.conversation)).await?;
    println!("conversation {} open; type to send, ctrl-d to quit", args.conversation);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        client.send_message(line, MessageKind::Text).await?;
    }

    Ok(())
}
