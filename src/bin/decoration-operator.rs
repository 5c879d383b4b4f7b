// Decoration operator binary
use std::sync::Arc;

use anyhow::Result;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use decoration_rs::operator::strategy::ApiInstanceRegistry;
use decoration_rs::operator::{run_decoration_controller, Context, StrategyCache};
use decoration_rs::OperatorConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,decoration_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting decoration operator");

    let config = OperatorConfig::load(std::env::var("DECORATION_CONFIG_FILE").ok().as_deref())?;
    let client = Client::try_default().await?;

    info!("connected to Kubernetes cluster");

    let cache = Arc::new(StrategyCache::new());
    let cancel = CancellationToken::new();

    // Warm the strategy cache alongside the controller; the sweep may need a
    // reconcile to catch a Decoration's observedGeneration up before it can
    // publish that manager. Consumers gate on wait_ready instead.
    let sweep_cache = cache.clone();
    let sweep_client = client.clone();
    let sweep_cancel = cancel.clone();
    tokio::spawn(async move {
        let registry = ApiInstanceRegistry::new(sweep_client.clone());
        match sweep_cache.start(sweep_client, &registry, &sweep_cancel).await {
            Ok(()) => info!("strategy cache ready"),
            Err(err) => error!(%err, "strategy cache startup sweep failed"),
        }
    });

    let ctx = Arc::new(Context::new(client, cache, config));
    if let Err(err) = run_decoration_controller(ctx).await {
        error!(%err, "controller error");
        std::process::exit(1);
    }

    Ok(())
}
