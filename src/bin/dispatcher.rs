use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rsky_dispatcher::config::DispatcherConfig;
use rsky_dispatcher::redis_adapter::channel::RedisChannelAdapter;
use rsky_dispatcher::redis_adapter::kv::RedisKvStore;
use rsky_dispatcher::state::DispatcherState;
use rsky_dispatcher::validation::Validators;
use rsky_dispatcher::{dispatcher, metrics};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warp::Filter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatcher=info,rsky_dispatcher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rsky-dispatcher");

    let config = DispatcherConfig::parse();
    info!("Configuration: {:?}", config);

    spawn_metrics_server(config.metrics_port);

    let client = redis::Client::open(config.redis_url.clone())?;
    let kv = Arc::new(RedisKvStore::new(&client).await?);
    let channel_adapter = RedisChannelAdapter::new(client, &config.prefix).await?;
    let validators = Validators::new(HashMap::new(), None)?;

    let state = DispatcherState::new(config, channel_adapter.clone(), kv, validators);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("Received shutdown signal");
        shutdown_signal.cancel();
    });

    dispatcher::run(state, channel_adapter, shutdown).await;

    info!("rsky-dispatcher exiting");
    Ok(())
}

fn spawn_metrics_server(metrics_port: u16) {
    tokio::spawn(async move {
        let metrics_route = warp::path!("metrics").map(|| match metrics::encode_metrics() {
            Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
            Err(e) => {
                error!("Failed to encode metrics: {:?}", e);
                warp::reply::with_status(
                    format!("Error: {e}"),
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
        });

        info!("Metrics server starting on port {}", metrics_port);
        warp::serve(metrics_route).run(([0, 0, 0, 0], metrics_port)).await;
    });
}
