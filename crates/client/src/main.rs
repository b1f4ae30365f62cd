//! `tether`: watch a session or send it a prompt.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_protocol::{SubscriptionLevel, TurnStage};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether_client::{ClientConfig, ClientEvent, ClientHandle, SeqStore, StreamClient};

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Tether session stream client")]
struct Cli {
    /// Server base URL, e.g. http://127.0.0.1:4300
    #[arg(long, global = true)]
    url: Option<String>,

    /// Bearer token for the server
    #[arg(long, global = true, env = "TETHER_AUTH_TOKEN")]
    token: Option<String>,

    /// Data directory (client.toml, last-seen.json). Defaults to ~/.tether
    #[arg(long, global = true, env = "TETHER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Stream a session's events to stdout
    Watch {
        session_id: String,
        /// Only notification-class events
        #[arg(long)]
        notifications: bool,
    },
    /// Send a prompt and wait for it to complete
    Prompt { session_id: String, message: String },
}

fn init_logging() -> anyhow::Result<()> {
    let filter = std::env::var("TETHER_LOG")
        .ok()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let data_dir = tether_client::config::resolve_data_dir(cli.data_dir.as_deref())?;
    let mut config = ClientConfig::load(&data_dir)?.with_token(cli.token);
    if let Some(url) = cli.url {
        config.server_url = url;
    }
    let store = SeqStore::load(config.seq_store_path());
    let (client, mut events) = StreamClient::connect(config, store);

    let result = match cli.command {
        Cmd::Watch {
            session_id,
            notifications,
        } => {
            let level = if notifications {
                SubscriptionLevel::Notifications
            } else {
                SubscriptionLevel::Full
            };
            client.subscribe(&session_id, level).await?;
            watch(&client, &mut events).await
        }
        Cmd::Prompt {
            session_id,
            message,
        } => prompt(&client, &mut events, &session_id, &message).await,
    };

    client.shutdown().await.ok();
    result
}

async fn watch(
    client: &ClientHandle,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                print_event(&event)?;
                if let ClientEvent::Connection(status) = &event {
                    if status.phase == tether_client::SyncPhase::Failed {
                        eprintln!("disconnected; retrying");
                        client.reconnect_now().await?;
                    }
                }
            }
        }
    }
}

async fn prompt(
    client: &ClientHandle,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
    session_id: &str,
    message: &str,
) -> anyhow::Result<()> {
    client.subscribe(session_id, SubscriptionLevel::Full).await?;
    let turn_id = client.prompt(session_id, message).await?;
    while let Some(event) = events.recv().await {
        match &event {
            ClientEvent::TurnAck {
                client_turn_id,
                stage: TurnStage::Completed,
                ..
            } if *client_turn_id == turn_id => return Ok(()),
            ClientEvent::Error { code, message, .. }
                if code == "turn_conflict" || code == "unknown_session" =>
            {
                anyhow::bail!("{code}: {message}");
            }
            _ => print_event(&event)?,
        }
    }
    anyhow::bail!("client stopped before the turn completed")
}

fn print_event(event: &ClientEvent) -> anyhow::Result<()> {
    match event {
        ClientEvent::Durable(event) => {
            println!(
                "{}",
                serde_json::to_string(event).context("encoding event")?
            );
        }
        ClientEvent::Ephemeral(batch) => {
            for event in batch {
                if let Some(delta) = event.payload.get("delta").and_then(|d| d.as_str()) {
                    print!("{delta}");
                }
            }
        }
        ClientEvent::Resynced(snapshot) => {
            eprintln!(
                "[resynced {} at seq {}]",
                snapshot.session_id, snapshot.current_seq
            );
        }
        ClientEvent::TurnAck {
            client_turn_id,
            stage,
            duplicate,
            ..
        } => {
            eprintln!("[turn {client_turn_id} {stage:?}{}]", if *duplicate { " (dup)" } else { "" });
        }
        ClientEvent::Error { code, message, .. } => eprintln!("[error {code}: {message}]"),
        ClientEvent::Connection(status) => {
            eprintln!("[{:?} / {:?}]", status.state, status.phase);
        }
    }
    Ok(())
}
