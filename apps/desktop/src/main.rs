use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ClientError, ClientEvent, ClientHandle, Message, RealtimeClient};
use shared::domain::{MessageKind, RoomId};
use storage::{KeyValueStore, Storage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long)]
    room: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let storage = Storage::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open local store at {}", settings.database_url))?;
    storage.health_check().await?;
    let store: Arc<dyn KeyValueStore> = Arc::new(storage);

    let client = RealtimeClient::new(&settings, store)?;
    let identity = client.sign_in(&args.username).await?;
    println!("Signed in as user_id={}", identity.user_id.0);

    let room_id = RoomId(args.room);
    client.join_room(room_id).await?;
    if let Some(page) = client.cached_progress().await {
        println!("Last read page (local): {page}");
    }
    match client.refresh_progress().await {
        Ok(Some(record)) => println!("Last read page (server): {}", record.page),
        Ok(None) => {}
        Err(err) => warn!("desktop: progress refresh failed: {err}"),
    }

    spawn_printers(&client);
    println!("Type a message and press enter. /older loads history, /page <n> saves progress, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "/quit" => break,
            "/older" => match client.load_older().await {
                Ok(added) => println!("Loaded {added} older messages"),
                Err(err) => println!("Could not load older messages: {err}"),
            },
            "/resume" => client.notify_foreground(Duration::from_secs(60)).await,
            _ if line.starts_with("/page ") => match line["/page ".len()..].trim().parse() {
                Ok(page) => {
                    if let Err(err) = client.save_progress(page, None).await {
                        println!("Could not save progress: {err}");
                    }
                }
                Err(_) => println!("Usage: /page <number>"),
            },
            _ => match client.send(line).await {
                Ok(_) => {}
                Err(ClientError::EmptyDraft) => {}
                Err(err) => println!(
                    "Send failed ({err}); draft kept: {}",
                    err.draft().unwrap_or(line)
                ),
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

fn spawn_printers(client: &Arc<RealtimeClient>) {
    let mut messages = client.subscribe_messages();
    tokio::spawn(async move {
        let mut printed = 0usize;
        while messages.changed().await.is_ok() {
            let snapshot = messages.borrow_and_update().clone();
            if snapshot.len() < printed {
                printed = 0;
            }
            for message in &snapshot[printed..] {
                println!("{}", render(message));
            }
            printed = snapshot.len();
        }
    });

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::StatusChanged(status) if status.is_degraded() => {
                    println!("[{status:?}]");
                }
                ClientEvent::RosterUpdated { members, .. } => {
                    println!("[{} members online]", members.len());
                }
                ClientEvent::SendFailed { draft } => println!("[not sent] {draft}"),
                ClientEvent::Error(message) => println!("[error] {message}"),
                _ => {}
            }
        }
    });
}

fn render(message: &Message) -> String {
    let marker = if message.is_pending() { "…" } else { " " };
    let body = match message.kind {
        MessageKind::Survey => format!(
            "<survey {}>",
            message.survey_ref.map(|id| id.0).unwrap_or_default()
        ),
        MessageKind::Text => message.body.clone(),
    };
    format!(
        "{marker} {} {}: {body}",
        message.sent_at.format("%H:%M:%S"),
        message.sender_name
    )
}
