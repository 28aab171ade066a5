use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use glint_server::auth::NoAuth;
use glint_server::config::Config;
use glint_server::hub::Hub;
use glint_server::relay;
use glint_server::server::{self, AppState};

#[derive(Parser)]
#[command(name = "glint-server", version, about = "WebRTC screen-share signaling server")]
struct Args {
    /// HTTP listen address; overrides GLINT_SERVER_ADDRESS.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    glint_common::init_tracing_with_default(&args.log_level);

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.server_address = listen;
    }

    // fail now, not on the first session, if no public address is set
    let provider = config.ip_provider();
    provider.get().context("checking public address")?;

    let relay = relay::start(&config, provider.clone())
        .await
        .context("starting TURN relay")?;

    let (hub, handle) = Hub::new(config.clone(), provider, relay.issuer());
    tokio::spawn(hub.run());

    let state = AppState {
        hub: handle,
        users: Arc::new(NoAuth),
        config: Arc::new(config.clone()),
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(config.server_address)
        .await
        .with_context(|| format!("binding {}", config.server_address))?;
    info!(addr = %config.server_address, "signaling server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving HTTP")?;

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
