mod args;
mod config;
mod deployer;
mod handlers;
mod launcher;
mod monitor;
mod project;
mod state;
mod store;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::MasterConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info")),
        )
        .init();

    let config = MasterConfig::from_env();
    info!("config: {:?}", config);
    let state = AppState::new(config.clone());

    // router HTTP
    let app = handlers::build_router(state.clone());

    // backends que nunca reportan UP
    if let Some(timeout) = config.up_timeout {
        let monitor_state = state.clone();
        tokio::spawn(async move {
            monitor::monitor_up_timeouts(monitor_state, timeout).await;
        });
    }

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
