use anyhow::Context;
use roomcast::{app, db, logging, sweeper, AppState, Config};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env()?;

    // no degraded mode without a store
    let db_pool = db::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("message store unavailable at {}", config.database_url))?;

    let app_state = AppState::new(db_pool.clone(), &config);
    let sweeper = sweeper::spawn(app_state.gateway.clone(), config.sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("could not bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "roomcast listening");

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    db_pool.close().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
