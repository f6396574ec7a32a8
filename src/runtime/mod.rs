//! # Runtime
//!
//! - `initialization`: process setup and the reconcile context
//! - `watch_loop`: watch-to-queue wiring and the per-kind worker pools

pub mod initialization;
pub mod watch_loop;

pub use initialization::{init_tracing, initialize, InitializationResult};
pub use watch_loop::{ControllerSet, GenerationFilter, Queues};

use crate::controller::server::ServerState;
use std::sync::Arc;
use tracing::info;

/// Run the controllers until SIGINT/SIGTERM, then drain in-flight reconciles
///
/// # Errors
///
/// Returns an error if the shutdown signal handler cannot be installed.
pub async fn run(result: InitializationResult) -> anyhow::Result<()> {
    let InitializationResult { ctx, server_state } = result;
    let controllers = ControllerSet::start(&ctx);
    server_state.set_ready(true);

    shutdown_signal(&server_state).await?;
    controllers.shutdown().await;
    info!("Controller stopped gracefully");
    Ok(())
}

async fn shutdown_signal(server_state: &Arc<ServerState>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal, waiting for in-flight reconciliations to complete...");
    server_state.set_ready(false);
    Ok(())
}
