//! Tether Server
//!
//! Serves the session stream over WebSocket with a loopback echo agent.

use std::time::Duration;

use clap::Parser;
use tracing::info;

use tether_server::config::{load_stream_config, ServerArgs};
use tether_server::{build_app, logging, paths};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    let data_dir = paths::init_data_dir(args.data_dir.as_deref())?;
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&paths::log_dir())?;

    let config = load_stream_config(args.config.as_deref(), &paths::config_path())?;
    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        auth = args.auth_token.is_some(),
        session_ring_capacity = config.session_ring_capacity,
        owner_ring_capacity = config.owner_ring_capacity,
        "Starting Tether server"
    );

    let (app, _owner) = build_app(
        config,
        args.auth_token.clone(),
        Duration::from_millis(args.echo_delay_ms),
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %listener.local_addr()?,
        "Listening"
    );
    axum::serve(listener, app).await?;

    drop(logging);
    Ok(())
}
