use anyhow::{Context, Result};
use clap::Parser;
use query_api::auth::{ApiKeyAuthority, RateLimiter};
use query_api::{cli, config, hub, openapi, routes, state};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telemetry_core::store::{ensure_schema, TsStore};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::CorsLayer;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind query-api listener on {addr}: port already in use. Stop the other service or re-run with --port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind query-api listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ApiConfig::from_env()?;
    let store = TsStore::connect(
        &config.database_url,
        config.read_pool_size,
        config.write_pool_size,
    )
    .await
    .context("failed to connect to the time-series store")?;
    ensure_schema(&store).await?;

    let cancel = CancellationToken::new();
    let keys = Arc::new(ApiKeyAuthority::new(
        store.read_pool().clone(),
        Duration::from_secs(config.key_cache_ttl_secs),
    ));
    let limiter = Arc::new(RateLimiter::default());
    limiter.clone().start_sweeper(cancel.clone());

    let ws_hub = Arc::new(hub::WsHub::default());
    hub::start_mqtt_bridge(&config, ws_hub.clone(), cancel.clone());

    let state = state::AppState {
        config: config.clone(),
        store,
        keys,
        limiter,
        hub: ws_hub,
    };

    // Coarse write-path governor ahead of the per-key buckets.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(60)
            .methods(vec![
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::PATCH,
                axum::http::Method::DELETE,
            ])
            .use_headers()
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    let app = routes::router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "query-api listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    cancel.cancel();
    Ok(())
}
