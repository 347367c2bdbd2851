use std::sync::Arc;

use tracing::info;

use encore::compactor::run_compactor;
use encore::config::Config;
use encore::engine::Engine;
use encore::seed::SeedFile;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    encore::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let wal_path = config.wal_path();
    let engine = Arc::new(Engine::new(wal_path.clone())?);
    info!("encore started");
    info!("  wal: {}", wal_path.display());
    info!("  compact threshold: {} appends", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    if let Some(seed_path) = std::env::args().nth(1) {
        let json = std::fs::read_to_string(&seed_path)?;
        let seed = SeedFile::parse(&json)?;
        seed.load_into(&engine).await?;
        info!("seeded from {seed_path}");
    }

    let compactor = tokio::spawn(run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received");
    compactor.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("encore stopped");
    Ok(())
}
