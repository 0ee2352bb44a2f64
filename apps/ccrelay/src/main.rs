use anyhow::Context;
use ccrelay_pool::OAuthStateStore;
use clap::Parser;
use std::sync::Arc;

mod cli;
mod routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = cli::CliArgs::parse();
    let config = args.into_config().context("merge CLI/ENV config")?;

    let engine = Arc::new(ccrelay_core::build_engine(&config).context("build proxy engine")?);
    let state = routes::AppState { engine, oauth: Arc::new(OAuthStateStore::new()) };

    let app = routes::router(state);
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
