use std::{collections::HashSet, sync::Arc};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ClientEvent, ClientSettings, DeliveryState, MessagingClient, SendStatus,
    TimelineEntry,
};
use shared::{
    domain::{ConversationId, UserId},
    protocol::MessageBody,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "picsta-chat", about = "Picsta direct messages from the terminal")]
struct Args {
    /// REST API origin, e.g. https://picsta.example.com
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Socket endpoint; derived from the API origin when omitted.
    #[arg(long, global = true)]
    socket_url: Option<String>,
    /// Raw `Cookie` header value of an authenticated session.
    #[arg(long, global = true)]
    session_cookie: Option<String>,
    /// Id of the signed-in user, used to attribute local sends.
    #[arg(long, global = true, default_value = "me")]
    user_id: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a conversation until Ctrl-C.
    Watch { conversation: String },
    /// Send one text message and report its delivery state.
    Send { conversation: String, text: String },
    /// Print unread counts.
    Unread,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = apply_overrides(load_settings(), &args);
    let client = MessagingClient::new(settings, UserId::from(args.user_id.as_str()))?;

    match args.command {
        Command::Watch { conversation } => {
            watch(&client, ConversationId::from(conversation)).await
        }
        Command::Send { conversation, text } => {
            send(&client, ConversationId::from(conversation), text).await
        }
        Command::Unread => unread(&client).await,
    }
}

fn apply_overrides(mut settings: ClientSettings, args: &Args) -> ClientSettings {
    if let Some(api_url) = &args.api_url {
        settings.api_base_url = api_url.clone();
    }
    if let Some(socket_url) = &args.socket_url {
        settings.socket_url = Some(socket_url.clone());
    }
    if let Some(cookie) = &args.session_cookie {
        settings.session_cookie = Some(cookie.clone());
    }
    settings
}

async fn watch(
    client: &Arc<MessagingClient>,
    conversation_id: ConversationId,
) -> Result<()> {
    let mut events = BroadcastStream::new(client.subscribe_events());
    client.start().await;
    client.open_conversation(&conversation_id).await?;

    let mut printed = HashSet::new();
    print_new_entries(client, &conversation_id, &mut printed).await;
    info!(conversation_id = %conversation_id, "watching, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(Ok(ClientEvent::TimelineChanged { conversation_id: changed }))
                    if changed == conversation_id =>
                {
                    print_new_entries(client, &conversation_id, &mut printed).await;
                }
                Some(Ok(ClientEvent::SendFailed { temp_id, reason, .. })) => {
                    println!("! {temp_id} failed: {reason}");
                }
                Some(Ok(ClientEvent::UnreadChanged { total, .. })) => {
                    println!("* unread: {total}");
                }
                Some(Ok(ClientEvent::NotificationReceived(notification))) => {
                    println!("* {:?} from {}", notification.kind, notification.actor_id);
                }
                Some(Ok(ClientEvent::ConnectionChanged(state))) => {
                    info!(?state, "connection state changed");
                }
                Some(Ok(ClientEvent::Error(message))) => warn!("server error: {message}"),
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!("event stream lagged: {err}"),
                None => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn send(
    client: &Arc<MessagingClient>,
    conversation_id: ConversationId,
    text: String,
) -> Result<()> {
    let temp_id = client.send_text(&conversation_id, text).await;
    match client.delivery_status(&temp_id).await {
        Some(SendStatus::Sent(message_id)) => {
            println!("sent {message_id}");
            Ok(())
        }
        Some(SendStatus::Failed(reason)) => bail!("send failed: {reason}"),
        Some(SendStatus::Pending) | None => bail!("send did not settle"),
    }
}

async fn unread(client: &Arc<MessagingClient>) -> Result<()> {
    client.poll_once().await?;
    let conversations = client.refresh_inbox().await?;
    println!("total: {}", client.unread_total().await);
    println!("notifications: {}", client.notification_unread().await);
    for conversation in conversations {
        let count = client.unread_count(&conversation.id).await;
        if count > 0 {
            println!("{}: {count}", conversation.id);
        }
    }
    Ok(())
}

async fn print_new_entries(
    client: &MessagingClient,
    conversation_id: &ConversationId,
    printed: &mut HashSet<String>,
) {
    for entry in client.timeline(conversation_id).await {
        // Local sends keep their temp id after confirmation.
        let key = match (&entry.temp_id, &entry.id) {
            (Some(temp_id), _) => temp_id.to_string(),
            (None, Some(id)) => id.to_string(),
            (None, None) => continue,
        };
        if printed.insert(key) {
            println!("{}", render(&entry));
        }
    }
}

fn render(entry: &TimelineEntry) -> String {
    let body = match &entry.body {
        MessageBody::Text { text } => text.clone(),
        MessageBody::SharedPost { post_id, caption } => match caption {
            Some(caption) => format!("[post {post_id}] {caption}"),
            None => format!("[post {post_id}]"),
        },
    };
    let marker = match &entry.state {
        DeliveryState::Sent => "",
        DeliveryState::Pending => " (sending)",
        DeliveryState::Failed { .. } => " (failed)",
    };
    format!(
        "[{}] {}: {body}{marker}",
        entry.created_at.format("%H:%M"),
        entry.sender_id
    )
}
