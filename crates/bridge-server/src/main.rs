use std::sync::Arc;

use bridge_core::metrics::BridgeMetrics;
use bridge_server::config::StaticConfigSource;
use bridge_server::state::{default_driver_factory, AppState, PortAllocator};
use bridge_server::{esl, router};
use clap::Parser;
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "bridge-server", about = "WebSocket/ESL host process for the voice-AI bridge")]
struct Args {
    #[arg(long, env = "BRIDGE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "BRIDGE_PORT", default_value_t = 8085)]
    port: u16,

    /// Port range for the per-transfer b-leg audio listeners.
    #[arg(long, env = "BRIDGE_B_LEG_PORT_MIN", default_value_t = 8100)]
    b_leg_port_min: u16,

    #[arg(long, env = "BRIDGE_B_LEG_PORT_MAX", default_value_t = 8199)]
    b_leg_port_max: u16,

    /// Base URL the switch dials back to for WS audio streams, e.g.
    /// `ws://10.0.0.5:8085`. Defaults to `ws://127.0.0.1:{port}`, which only
    /// works when FreeSWITCH and bridge-server share a host.
    #[arg(long, env = "BRIDGE_PUBLIC_WS_BASE")]
    public_ws_base: Option<String>,

    #[arg(long, env = "BRIDGE_TENANTS_FILE", default_value = "tenants.json")]
    tenants_file: String,

    #[arg(long, env = "FREESWITCH_ESL_ADDR", default_value = "127.0.0.1:8021")]
    esl_addr: String,

    #[arg(long, env = "FREESWITCH_ESL_PASSWORD", default_value = "ClueCon")]
    esl_password: String,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| "info".into()))
        .init();

    let source = StaticConfigSource::load_from_file(&args.tenants_file)?;
    let config_loader = Arc::new(bridge_core::config::ConfigLoader::new(Box::new(source)));
    let metrics = Arc::new(BridgeMetrics::new()?);

    tracing::info!(esl_addr = %args.esl_addr, "connecting to freeswitch event socket");
    let switch = esl::EslClient::connect(&args.esl_addr, &args.esl_password).await?;

    let public_ws_base = args
        .public_ws_base
        .clone()
        .unwrap_or_else(|| format!("ws://127.0.0.1:{}", args.port));
    let state = AppState::new(
        config_loader,
        metrics,
        switch,
        default_driver_factory(),
        public_ws_base,
        args.host.clone(),
        Some(PortAllocator::new(args.b_leg_port_min, args.b_leg_port_max)),
    );

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "bridge-server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}
