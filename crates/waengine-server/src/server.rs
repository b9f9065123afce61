use anyhow::{Context, Result};
use libwaengine::{
    BridgeConfig, BridgeFactory, Dispatcher, FsCredentialStore, HttpReporter, Services,
    SessionManager, Timeouts, ViewerHub,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::routes;

/// Wire the engine's collaborators from configuration.
pub fn build_manager(config: &ServerConfig) -> Result<SessionManager> {
    let store = FsCredentialStore::new(&config.auth_dir);
    store
        .ensure_root()
        .with_context(|| format!("failed to create auth dir {}", config.auth_dir.display()))?;

    let reporter = HttpReporter::new(&config.backend_url, config.report_timeout())
        .context("failed to build backend client")?;
    info!(endpoint = reporter.endpoint(), "backend reporter configured");

    let dispatcher = Dispatcher::new(Arc::new(ViewerHub::new()), Arc::new(reporter))
        .with_terminal_qr(config.print_pairing_qr);

    let factory = BridgeFactory::new(BridgeConfig {
        command: config.bridge_command.clone(),
        args: config.bridge_args.clone(),
        auth_dir: config.auth_dir.clone(),
        request_timeout: config.send_timeout(),
    });

    Ok(SessionManager::new(Services {
        factory: Arc::new(factory),
        credentials: Arc::new(store),
        dispatcher,
        timeouts: Timeouts {
            startup: config.startup_timeout(),
            destroy: config.destroy_timeout(),
        },
    }))
}

/// Reconcile saved sessions, then serve until ctrl-c. Live clients are
/// destroyed on the way out.
pub async fn run(config: ServerConfig) -> Result<()> {
    let manager = Arc::new(build_manager(&config)?);

    let reconciled = manager
        .reconcile()
        .await
        .context("failed to reconcile saved sessions")?;
    info!(reconciled, "startup reconcile complete");

    let cors = routes::build_cors(&config.allow_origins)?;
    let app = routes::router(Arc::clone(&manager), cors);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    info!("waengine listening on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
