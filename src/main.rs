//! CLI entry point for shock-hub.
//!
//! Startup order: parse CLI, initialize tracing, load settings, spawn the
//! link actor, wire the application state and its background tasks, dispatch
//! an initial controller connect attempt, then serve until ctrl-c.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shock_hub::app::ShockApp;
use shock_hub::config::Settings;
use shock_hub::link::{LinkHandle, TokioPortOpener};
use shock_hub::server;

#[derive(Parser)]
#[command(name = "shock-hub")]
#[command(about = "Coordination server for a serial-attached shock controller", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "shock-hub.toml")]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<String>,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("shock_hub={}", cli.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = Settings::load_from(&cli.config)?;
    if let Some(listen) = cli.listen {
        settings.server.listen = listen;
        settings.validate()?;
    }

    let opener = Arc::new(TokioPortOpener::new(settings.serial.clone()));
    let settle = Duration::from_millis(settings.serial.connect_settle_ms);
    let link = LinkHandle::spawn(opener, settle);

    let app = ShockApp::new(settings, link);
    app.spawn_background();

    // Try to reach the controller right away; clients can retrigger this
    // through the admin surface.
    {
        let link = app.link.clone();
        tokio::spawn(async move {
            if let Err(e) = link.connect().await {
                warn!(error = %e, "initial controller connect failed");
            }
        });
    }

    let addr: SocketAddr = app.settings.server.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server listening");

    let router = server::build_router(app);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await?;

    Ok(())
}
