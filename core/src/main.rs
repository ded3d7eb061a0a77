/// Inbox sync demo server - engine over the in-memory remote, exposed via HTTP
use inbox_sync::api::{start_api, ApiState};
use inbox_sync::memory::Seed;
use inbox_sync::types::Identity;
use inbox_sync::{Collaborators, Config, MemoryRemote, SyncEngine};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let remote = match &config.seed_path {
        Some(path) => {
            let seed = Seed::load(path)
                .map_err(|e| anyhow::anyhow!("Seed error ({}): {}", path.display(), e))?;
            info!(
                "Loaded seed: {} profiles, {} conversations, {} messages",
                seed.profiles.len(),
                seed.conversations.len(),
                seed.messages.len()
            );
            MemoryRemote::from_seed(seed)
        }
        None => MemoryRemote::new(),
    };
    let remote = Arc::new(remote);
    if let Some(id) = &config.identity {
        remote.set_session(Some(Identity::new(id.as_str()))).await;
    }

    info!("🚀 Starting inbox sync engine");
    let engine = SyncEngine::spawn(&config, Collaborators::from_remote(remote.clone()));
    let state = ApiState {
        engine: engine.clone(),
        dev: Some(remote),
    };

    let api_addr = config.api_addr;
    tokio::select! {
        result = start_api(state, api_addr) => {
            result.map_err(|e| anyhow::anyhow!("API error: {}", e))?;
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping engine...");
        }
    }

    if engine.shutdown().is_err() {
        warn!("Engine already stopped");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
