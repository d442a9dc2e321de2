use std::time::Duration;

use tracing::info;

use castslot::backend::Backend;
use castslot::compactor;
use castslot::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    castslot::observability::init(config.metrics_port)?;

    let backend = Backend::open(&config).await?;
    let compactor = tokio::spawn(compactor::run_compactor(
        backend.store.clone(),
        config.compact_threshold,
        Duration::from_secs(5),
    ));

    let horizon = config.calendar.horizon;
    info!("castslot running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  horizon: {} ~ {} ({}s slots, capacity {})", horizon.start, horizon.end, config.calendar.slot_secs, config.calendar.capacity);
    info!("  admission: {}", config.admission);
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    compactor.abort();
    if compactor::compact_if_due(&backend.store, config.compact_threshold).await {
        info!("final compaction done");
    }
    info!("castslot stopped");
    Ok(())
}
