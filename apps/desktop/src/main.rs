use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{
    load_settings, ClientEvent, ClientHandle, HttpMessagingApi, MessagingClient, SendOutcome,
};
use shared::{
    domain::{MessageId, UserId},
    protocol::ChatMessage,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    /// REST base url; the real-time endpoint is derived from it.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    /// Session bearer token for the REST collaborator.
    #[arg(long)]
    token: Option<String>,
    /// Conversation to open on start.
    #[arg(long)]
    peer: Option<String>,
}

fn render(message: &ChatMessage) -> String {
    let body = match (&message.content, &message.image_url) {
        (Some(content), Some(image)) => format!("{content} [{image}]"),
        (Some(content), None) => content.clone(),
        (None, Some(image)) => format!("[{image}]"),
        (None, None) => String::new(),
    };
    let marker = if message.is_temporary() { " (sending)" } else { "" };
    format!("[{}] {}: {body}{marker}", message.id, message.sender_id)
}

async fn print_conversation(client: &Arc<MessagingClient>, peer: &UserId) {
    for message in client.messages(peer).await {
        println!("{}", render(&message));
    }
}

async fn handle_command(client: &Arc<MessagingClient>, peer: &mut Option<UserId>, line: &str) -> Result<()> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("/open") => {
            let Some(next) = words.next() else {
                bail!("usage: /open <user-id>");
            };
            let next = UserId::from(next);
            client.open_conversation(&next).await?;
            print_conversation(client, &next).await;
            *peer = Some(next);
        }
        Some("/close") => {
            client.close_conversation().await;
            *peer = None;
        }
        Some("/threads") => {
            for thread in client.threads().await? {
                let name = thread.user.username.as_deref().unwrap_or(thread.user.id.as_str());
                println!("{name} ({} unread)", thread.unread_count);
            }
        }
        Some("/react") => {
            let (Some(id), Some(reaction)) = (words.next(), words.next()) else {
                bail!("usage: /react <message-id> <reaction>");
            };
            let change = client.react(&MessageId::from(id), reaction).await?;
            println!("{change:?}");
        }
        Some("/archive") => {
            let Some(current) = peer.take() else {
                bail!("no open conversation");
            };
            client.close_conversation().await;
            client.archive_thread(&current).await?;
            println!("archived conversation with {current}");
        }
        Some(command) if command.starts_with('/') => bail!("unknown command {command}"),
        _ => {
            let Some(current) = peer.as_ref() else {
                bail!("open a conversation first with /open <user-id>");
            };
            if let SendOutcome::Confirmed(message) = client.send_message(current, line).await? {
                println!("{}", render(&message));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let api = Arc::new(HttpMessagingApi::new(settings.server_url.clone(), args.token));
    let client = MessagingClient::new(settings, api, UserId::new(args.user_id));
    let mut events = client.subscribe_events();

    if let Err(err) = client.connect().await {
        warn!(error = %err, "real-time channel unavailable; continuing over REST");
    }

    let mut peer = None;
    if let Some(initial) = args.peer {
        handle_command(&client, &mut peer, &format!("/open {initial}")).await?;
    }

    let printer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::ConversationUpdated { peer }) => {
                        if client.active_peer().await.as_ref() == Some(&peer) {
                            if let Some(last) = client.messages(&peer).await.last() {
                                println!("{}", render(last));
                            }
                        }
                    }
                    Ok(ClientEvent::PeerTyping { peer, typing: true }) => {
                        println!("{peer} is typing...");
                    }
                    Ok(ClientEvent::ConnectionStateChanged(state)) => println!("* {state}"),
                    Ok(ClientEvent::PresenceChanged { user_id, is_online }) => {
                        println!("* {user_id} is {}", if is_online { "online" } else { "offline" });
                    }
                    Ok(ClientEvent::SendFailed { reason, .. }) => println!("! not sent: {reason}"),
                    Ok(ClientEvent::Error(message)) => println!("! {message}"),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(err) = handle_command(&client, &mut peer, line).await {
            println!("! {err:#}");
        }
    }

    client.shutdown().await;
    printer.abort();
    Ok(())
}
