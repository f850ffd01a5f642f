use finance_fabric::config::NodeConfig;
use finance_fabric::controller::Controller;
use finance_fabric::metrics::{init_metrics, update_system_metrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    finance_fabric::init_tracing();

    init_metrics();
    tracing::info!("starting finance-node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env()?;
    tracing::info!(node_id = %config.client_id, monitor_dir = %config.monitor_dir, "node config loaded");

    tokio::spawn(async {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            update_system_metrics();
        }
    });

    let controller = Controller::bootstrap(config).await;
    controller.run().await;

    Ok(())
}
