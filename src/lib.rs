pub mod api;
pub mod bus;
pub mod config;
pub mod containment;
pub mod controller;
pub mod detection_engine;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod mutator;
pub mod node_state;
pub mod replication;
pub mod snapshot;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .event_format(tracing_subscriber::fmt::format::json())
        .init();
}
