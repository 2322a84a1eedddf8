//! Configuration for the instance engine.

use std::time::Duration;

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Global in-flight bytes budget shared by every sink.
    pub writer_permit_bytes: usize,
    pub manager: ManagerConfig,
    pub pipeline: PipelineConfig,
    pub instance: InstanceConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            writer_permit_bytes: 256 * 1024 * 1024, // 256MB
            manager: ManagerConfig::default(),
            pipeline: PipelineConfig::default(),
            instance: InstanceConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Configuration for the per-task instance manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Max live instances per task.
    pub instance_limit: usize,
    /// Capacity of the supervisor action queue.
    pub action_queue_capacity: usize,
    /// Core loop tick.
    pub core_tick: Duration,
    /// Minimum interval between expiry sweeps of the instance store.
    pub db_clean_interval: Duration,
    /// Expiry threshold in cycle units.
    pub expire_cycle_count: u32,
    /// Max records deleted per expiry sweep.
    pub clean_once_limit: usize,
    /// Fraction of the instance limit at which the manager reports full.
    pub reserve_coefficient: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            instance_limit: 100,
            action_queue_capacity: 100,
            core_tick: Duration::from_millis(1000),
            db_clean_interval: Duration::from_millis(10_000),
            expire_cycle_count: 3,
            clean_once_limit: 10,
            reserve_coefficient: 0.8,
        }
    }
}

/// Configuration for the sink pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Flush period of the per-stream batch buffer.
    pub batch_flush_interval: Duration,
    /// Offset checkpoint period.
    pub save_offset_interval: Duration,
    /// Max records per batch handed to the transport.
    pub batch_max_records: usize,
    /// Max bytes per batch handed to the transport.
    pub batch_max_bytes: usize,
    /// Backoff while a write waits for a permit or queue space.
    pub write_retry_wait: Duration,
    /// Poll interval while destroy waits for the background loops.
    pub destroy_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_flush_interval: Duration::from_millis(100),
            save_offset_interval: Duration::from_millis(1000),
            batch_max_records: 500,
            batch_max_bytes: 512 * 1024, // 512KB
            write_retry_wait: Duration::from_millis(10),
            destroy_poll_interval: Duration::from_millis(10),
        }
    }
}

/// Configuration for a single instance run loop.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Sleep when the source has nothing to read.
    pub idle_sleep: Duration,
    /// Consecutive empty-and-finished probes required before FINISH.
    pub check_finish_at_least_count: u32,
    /// Poll interval while destroy waits for the run loop.
    pub destroy_poll_interval: Duration,
    /// Backoff between attempts to submit an action to a full queue.
    pub action_retry_wait: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_secs(1),
            check_finish_at_least_count: 5,
            destroy_poll_interval: Duration::from_millis(10),
            action_retry_wait: Duration::from_secs(1),
        }
    }
}
