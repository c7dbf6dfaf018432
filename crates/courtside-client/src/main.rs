//! Courtside chat binary.
//!
//! Opens one conversation, prints it as it changes, and sends every stdin
//! line as a message. The line `/reconnect` retries a stopped connection.
//!
//! # Usage
//!
//! ```bash
//! COURTSIDE_TOKEN=... courtside-chat --user-id 7 --counterpart 12
//!
//! # Local server, also following a facility feed
//! courtside-chat --socket-url ws://127.0.0.1:3000/ws --api-url http://127.0.0.1:3000/api \
//!     --user-id 7 --counterpart 12 --facility 3 --token dev
//! ```

use std::{collections::HashSet, io::Write, time::Duration};

use clap::Parser;
use courtside_app::{ChatError, ConnectionStatus, Runtime, RuntimeConfig, ViewConfig, ViewSnapshot};
use courtside_client::{HttpStore, SystemEnv, WsTransport};
use courtside_core::SharedCredential;
use courtside_proto::{FacilityId, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Courtside conversation client
#[derive(Parser, Debug)]
#[command(name = "courtside-chat")]
#[command(about = "Courtside real-time conversation client")]
#[command(version)]
struct Args {
    /// WebSocket endpoint of the conversation server
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    socket_url: String,

    /// Base URL of the durable message API
    #[arg(long, default_value = "http://127.0.0.1:3000/api")]
    api_url: String,

    /// Signed-in user
    #[arg(long)]
    user_id: u64,

    /// Conversation partner
    #[arg(long)]
    counterpart: u64,

    /// Bearer token
    #[arg(long, env = "COURTSIDE_TOKEN", hide_env_values = true)]
    token: String,

    /// Facility feeds to follow (repeatable)
    #[arg(long)]
    facility: Vec<u64>,

    /// Seconds between conversation reloads (0 disables polling)
    #[arg(long, default_value = "15")]
    poll_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // stdout carries the conversation
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    let local = UserId(args.user_id);
    let credentials = SharedCredential::new(Some(args.token));
    let store = HttpStore::new(args.api_url.as_str(), credentials.clone())?;
    let transport = WsTransport::new(args.socket_url.as_str());

    let poll_interval = (args.poll_secs > 0).then(|| Duration::from_secs(args.poll_secs));
    let config = RuntimeConfig { view: ViewConfig { poll_interval }, ..Default::default() };

    tracing::info!(user = %local, socket = %args.socket_url, api = %args.api_url, "courtside-chat starting");

    let (runtime, handle) = Runtime::new(transport, store, SystemEnv::new(), credentials, local, config);
    let runtime = tokio::spawn(runtime.run());

    for facility in args.facility {
        handle.subscribe_facility(FacilityId(facility)).await?;
    }

    let view = handle.open_conversation(Some(UserId(args.counterpart))).await?;
    let mut updates = handle.watch_conversation(view).await?;
    let mut status = handle.status();
    let mut printed = HashSet::new();
    let mut shown_error = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                print_new(&snapshot, local, &mut printed, &mut shown_error)?;
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                report_status(&current);
            },
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/reconnect" => {
                    if let Err(err) = handle.reconnect().await {
                        tracing::error!(error = %err, "reconnect refused");
                    }
                },
                Some(line) => match handle.send(view, line).await {
                    Ok(message) => tracing::debug!(id = %message.id, "message stored"),
                    Err(ChatError::EmptyContent) => {},
                    Err(err) => tracing::error!(error = %err, "message not sent"),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    runtime.await?;

    Ok(())
}

fn print_new(
    snapshot: &ViewSnapshot,
    local: UserId,
    printed: &mut HashSet<MessageId>,
    shown_error: &mut Option<String>,
) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    for message in &snapshot.messages {
        if !printed.insert(message.id) {
            continue;
        }
        let at = message.sent_at().map(|t| t.format("%H:%M").to_string()).unwrap_or_default();
        let who = if message.sender_id == local { "me".to_owned() } else { message.sender_id.to_string() };
        writeln!(out, "[{at}] {who}: {}", message.content)?;
    }
    if snapshot.last_error != *shown_error {
        if let Some(error) = &snapshot.last_error {
            writeln!(out, "! {error}")?;
        }
        shown_error.clone_from(&snapshot.last_error);
    }
    out.flush()
}

fn report_status(status: &ConnectionStatus) {
    match &status.failure {
        Some(failure) => tracing::error!(error = %failure, "connection stopped, type /reconnect to retry"),
        None => tracing::info!(
            state = ?status.state,
            authenticated = status.authenticated,
            attempt = status.reconnect_attempt,
            "connection status"
        ),
    }
}
