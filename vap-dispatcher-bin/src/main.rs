//! Binary runner for the VAP dispatcher.
//!
//! Loads config and the identity pool, starts the credential proxy on
//! loopback, then runs the dispatcher (reconcile → poll / lifetime /
//! routing loops) until SIGINT or SIGTERM. Fatal startup failures exit 1;
//! a signalled shutdown retires every container and exits 0.

use std::sync::Arc;

use vap_dispatcher_lib::{ContainerManager, Dispatcher};
use vap_proxy_api::{ProxyState, TokenRegistry, UpstreamConfig};
use vap_runtime::{identity, DispatcherConfig, DispatcherError};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    setup_log();

    if let Err(e) = run().await {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DispatcherError> {
    let config = Arc::new(DispatcherConfig::from_env()?);
    let identities = identity::load_pool(&config)?;
    tracing::info!(
        identities = identities.len(),
        ports = config.port_pool_size(),
        "dispatcher starting"
    );

    // ── 1. Credential proxy ──────────────────────────────────────────────
    let registry = Arc::new(TokenRegistry::new());
    let proxy_state = Arc::new(ProxyState::new(
        registry.clone(),
        UpstreamConfig {
            llm_base: config.llm_api_base.clone(),
            llm_key: config.llm_api_key.clone(),
            embeddings_base: config.embeddings_api_base.clone(),
            embeddings_key: config.embeddings_api_key.clone(),
        },
        config.proxy_rate_limit,
    ));
    let proxy_task = vap_proxy_api::serve(proxy_state, config.proxy_port).await?;

    // ── 2. Dispatcher ────────────────────────────────────────────────────
    let containers = Arc::new(ContainerManager::new(config.clone(), registry));
    let dispatcher = Dispatcher::new(config, identities, containers)?;

    dispatcher.run_until(shutdown_signal()).await;

    proxy_task.abort();
    tracing::info!("dispatcher stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
