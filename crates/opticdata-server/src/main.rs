use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use opticdata_server::{app, dns, scheduler, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise structured JSON logging. Level controlled via RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("opticdata=info".parse()?),
        )
        .json()
        .init();

    let cfg = opticdata_core::config::Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    // Ensure data directory exists before opening DuckDB.
    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/opticdata.db", cfg.data_dir);
    let db = opticdata_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    let resolver = Arc::new(dns::HickoryDnsResolver::new());
    let state = Arc::new(AppState::new(db, cfg.clone(), resolver));

    // Spawn the daily attribution scheduler.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            scheduler::run_scheduler_loop(state).await;
        });
    }

    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = app::build_app(Arc::clone(&state));

    info!(port = cfg.port, "OpticData listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
