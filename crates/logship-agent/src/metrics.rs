//! Audit metrics for the instance engine.
//!
//! Prometheus counters mirroring the agent's audit events: heartbeats,
//! instance add/delete against store and memory, and sink failures. All
//! counters carry `[group_id, stream_id]` labels so downstream dashboards
//! can slice per data stream.

use lazy_static::lazy_static;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};

lazy_static! {
    static ref MANAGER_HEARTBEAT: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_manager_heartbeat_total",
            "Instance manager core loop heartbeats"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref INSTANCE_HEARTBEAT: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_instance_heartbeat_total",
            "Instance run loop idle heartbeats"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref INSTANCE_ADDED_DB: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_instance_added_db_total",
            "Instance profiles persisted to the state store"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref INSTANCE_ADDED_MEM: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_instance_added_mem_total",
            "Instances added to memory and started"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref INSTANCE_ADD_FAILED: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_instance_add_failed_total",
            "Instances that failed to initialize"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref INSTANCE_DELETED_DB: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_instance_deleted_db_total",
            "Instance profiles deleted from the state store"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref INSTANCE_DELETED_MEM: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_instance_deleted_mem_total",
            "Instances destroyed and removed from memory"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref INSTANCE_UNUSUAL_DELETE: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_instance_unusual_delete_total",
            "Stale in-memory instances destroyed before a re-add"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref SINK_FAIL: CounterVec = CounterVec::new(
        Opts::new(
            "logship_agent_sink_fail_total",
            "Messages the sink accepted but did not forward"
        ),
        &["group_id", "stream_id"]
    )
    .unwrap();

    static ref LIVE_INSTANCES: GaugeVec = GaugeVec::new(
        Opts::new(
            "logship_agent_live_instances",
            "Live instances per task"
        ),
        &["task_id"]
    )
    .unwrap();

    static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry.register(Box::new(MANAGER_HEARTBEAT.clone())).unwrap();
        registry.register(Box::new(INSTANCE_HEARTBEAT.clone())).unwrap();
        registry.register(Box::new(INSTANCE_ADDED_DB.clone())).unwrap();
        registry.register(Box::new(INSTANCE_ADDED_MEM.clone())).unwrap();
        registry.register(Box::new(INSTANCE_ADD_FAILED.clone())).unwrap();
        registry.register(Box::new(INSTANCE_DELETED_DB.clone())).unwrap();
        registry.register(Box::new(INSTANCE_DELETED_MEM.clone())).unwrap();
        registry.register(Box::new(INSTANCE_UNUSUAL_DELETE.clone())).unwrap();
        registry.register(Box::new(SINK_FAIL.clone())).unwrap();
        registry.register(Box::new(LIVE_INSTANCES.clone())).unwrap();
        registry
    };
}

/// The agent metrics registry, for scrapers hosted by the embedding
/// process.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn record_manager_heartbeat(group_id: &str, stream_id: &str) {
    MANAGER_HEARTBEAT.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_instance_heartbeat(group_id: &str, stream_id: &str) {
    INSTANCE_HEARTBEAT.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_instance_added_db(group_id: &str, stream_id: &str) {
    INSTANCE_ADDED_DB.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_instance_added_mem(group_id: &str, stream_id: &str) {
    INSTANCE_ADDED_MEM.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_instance_add_failed(group_id: &str, stream_id: &str) {
    INSTANCE_ADD_FAILED.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_instance_deleted_db(group_id: &str, stream_id: &str) {
    INSTANCE_DELETED_DB.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_instance_deleted_mem(group_id: &str, stream_id: &str) {
    INSTANCE_DELETED_MEM.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_instance_unusual_delete(group_id: &str, stream_id: &str) {
    INSTANCE_UNUSUAL_DELETE.with_label_values(&[group_id, stream_id]).inc();
}

pub fn record_sink_fail(group_id: &str, stream_id: &str) {
    SINK_FAIL.with_label_values(&[group_id, stream_id]).inc();
}

pub fn set_live_instances(task_id: &str, count: usize) {
    LIVE_INSTANCES.with_label_values(&[task_id]).set(count as f64);
}
