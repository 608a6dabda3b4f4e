mod bootstrap;
mod health;
mod routes;
mod sweeps;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;

use caseflow_core::config::LoadOptions;

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).compact().init();

    let app = bootstrap::bootstrap(LoadOptions::default()).await?;

    let router = Router::new()
        .merge(routes::router(Arc::clone(&app.engine)))
        .merge(health::router(app.db_pool.clone()));

    let sweep_handles = sweeps::spawn(Arc::clone(&app.engine));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "caseflow-server started"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "caseflow-server stopping"
    );
    for handle in sweep_handles {
        handle.abort();
    }

    Ok(())
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
