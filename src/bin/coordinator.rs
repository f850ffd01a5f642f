use std::sync::Arc;

use finance_fabric::bus::{Bus, EventBus};
use finance_fabric::config::CoordinatorConfig;
use finance_fabric::detection_engine::DetectionEngine;
use finance_fabric::metrics::init_metrics;
use finance_fabric::snapshot::coordinator::SnapshotCoordinator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    finance_fabric::init_tracing();
    init_metrics();

    tracing::info!("starting finance-coordinator v{}", env!("CARGO_PKG_VERSION"));

    let config = CoordinatorConfig::from_env()?;
    let bus: Arc<dyn Bus> = Arc::new(EventBus::connect(&config.broker_host).await);

    let engine = DetectionEngine::new(config.containment_addrs.clone());
    let snapshot_coordinator = Arc::new(SnapshotCoordinator::new(config, bus.clone()));

    let engine_handle = tokio::spawn(engine.run(bus.clone()));
    let snapshot_handle = tokio::spawn(snapshot_coordinator.run());

    let _ = tokio::join!(engine_handle, snapshot_handle);
    Ok(())
}
