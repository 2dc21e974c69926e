use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use venuebook::config::Config;
use venuebook::engine::{Engine, EngineConfig};
use venuebook::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    venuebook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::with_config(
        config.wal_path(),
        notify,
        EngineConfig {
            op_timeout: config.op_timeout,
            ..EngineConfig::default()
        },
    )?);

    let compactor = tokio::spawn(venuebook::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    info!("venuebook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  op_timeout: {:?}", config.op_timeout);
    info!("  preview_ttl: {:?}", config.preview_ttl);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Run until SIGTERM/ctrl-c, then compact once so the next start replays
    // a short log.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    compactor.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("venuebook stopped");
    Ok(())
}
