//! Prometheus metrics for the fabric node and coordinator.
//!
//! Covers replication ACK latency, snapshot round duration, lockdown events,
//! the entropy histogram, and write-gate closed duration.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, TextEncoder,
};

lazy_static! {
    pub static ref METRICS_REGISTRY: prometheus::Registry = {
        let registry = prometheus::Registry::new();

        registry.register(Box::new(FILE_EVENTS_TOTAL.clone())).unwrap();
        registry.register(Box::new(ENTROPY_SAMPLE.clone())).unwrap();
        registry.register(Box::new(REPLICATION_ACK_LATENCY_SECONDS.clone())).unwrap();
        registry.register(Box::new(REPLICATION_OPS_TOTAL.clone())).unwrap();
        registry.register(Box::new(SNAPSHOT_ROUND_DURATION_SECONDS.clone())).unwrap();
        registry.register(Box::new(SNAPSHOT_ROUNDS_TOTAL.clone())).unwrap();
        registry.register(Box::new(LOCKDOWN_EVENTS_TOTAL.clone())).unwrap();
        registry.register(Box::new(WRITE_GATE_CLOSED_SECONDS.clone())).unwrap();
        registry.register(Box::new(SYSTEM_MEMORY_USAGE_BYTES.clone())).unwrap();
        registry.register(Box::new(SYSTEM_CPU_USAGE_PERCENT.clone())).unwrap();

        registry
    };

    pub static ref FILE_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fabric_file_events_total", "Total file events emitted by the detector"),
        &["node_id", "event_kind"]
    ).unwrap();

    pub static ref ENTROPY_SAMPLE: Histogram = Histogram::with_opts(
        HistogramOpts::new("fabric_entropy_sample", "Shannon entropy of sampled file blocks")
            .buckets(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 6.5, 7.0, 7.5, 7.9, 8.0])
    ).unwrap();

    pub static ref REPLICATION_ACK_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("fabric_replication_ack_latency_seconds", "Time to collect replication ACK quorum")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();

    pub static ref REPLICATION_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fabric_replication_ops_total", "Replication operations broadcast or applied"),
        &["node_id", "op", "outcome"]
    ).unwrap();

    pub static ref SNAPSHOT_ROUND_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("fabric_snapshot_round_duration_seconds", "Duration of a coordinator snapshot round")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0])
    ).unwrap();

    pub static ref SNAPSHOT_ROUNDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fabric_snapshot_rounds_total", "Completed snapshot rounds"),
        &["outcome"]
    ).unwrap();

    pub static ref LOCKDOWN_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fabric_lockdown_events_total", "Lockdown triggers and releases"),
        &["node_id", "action"]
    ).unwrap();

    pub static ref WRITE_GATE_CLOSED_SECONDS: Gauge = Gauge::new(
        "fabric_write_gate_closed_seconds",
        "Seconds the write gate has been continuously closed, 0 when open"
    ).unwrap();

    pub static ref SYSTEM_MEMORY_USAGE_BYTES: Gauge = Gauge::new(
        "fabric_system_memory_usage_bytes",
        "Current process memory usage in bytes"
    ).unwrap();

    pub static ref SYSTEM_CPU_USAGE_PERCENT: Gauge = Gauge::new(
        "fabric_system_cpu_usage_percent",
        "Current CPU usage percentage"
    ).unwrap();

    pub static ref SYSTEM_NETWORK_CONNECTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fabric_system_network_connections", "Active network connections"),
        &["protocol", "state"]
    ).unwrap();
}

pub struct MetricsServer {
    encoder: TextEncoder,
}

impl MetricsServer {
    pub fn new() -> Self {
        Self {
            encoder: TextEncoder::new(),
        }
    }

    pub fn encode_metrics(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let mut buffer = Vec::new();
        self.encoder.encode(&METRICS_REGISTRY.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsServer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn init_metrics() {
    WRITE_GATE_CLOSED_SECONDS.set(0.0);
}

pub fn update_system_metrics() {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_all();

    let used_memory = sys.used_memory() as f64 * 1024.0;
    SYSTEM_MEMORY_USAGE_BYTES.set(used_memory);

    let cpu_usage = sys.global_cpu_info().cpu_usage() as f64;
    SYSTEM_CPU_USAGE_PERCENT.set(cpu_usage);
}
