use anyhow::Result;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;

mod bootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sea_orm=warn".into()),
        )
        .init();

    let boot = bootstrap::bootstrap().await?;
    let router_state = poolgate_router::RouterState {
        executor: boot.executor.clone(),
        selector: boot.selector.clone(),
    };

    let app = Router::new()
        .merge(poolgate_router::proxy_router(router_state.clone()))
        .merge(poolgate_router::hub_router(router_state))
        .route("/healthz", get(|| async { StatusCode::NO_CONTENT }));

    let bind = format!("{}:{}", boot.global.host, boot.global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");

    let shutdown = boot.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            let _ = shutdown.send(true);
        })
        .await?;

    // Background loops observe the same signal; give the log sink a beat to
    // drain before the process exits.
    let _ = boot.shutdown.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    Ok(())
}
