//! Shared fixtures: a scripted source, a gateable transport, and an
//! engine harness wiring them through the adapter registry.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use logship_common::cycle::CycleUnit;
use logship_common::store::{InMemoryStateStore, StateStore};
use logship_common::types::{
    header, InstanceProfile, InstanceState, Message, TaskProfile, TaskState,
};
use logship_common::Result;
use logship_agent::adapter::{AdapterRegistry, SourceAdapter};
use logship_agent::config::{InstanceConfig, ManagerConfig, PipelineConfig};
use logship_agent::memory::{MemoryBudget, AGENT_GLOBAL_WRITER_PERMIT};
use logship_agent::pipeline::{SinkPipeline, StreamBatch, Transport};
use logship_common::Error;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

pub const SOURCE_TAG: &str = "scripted";
pub const SINK_TAG: &str = "pipeline";

/// Shared control handle for a scripted source. Tests push messages and
/// flip liveness; the adapter half reads them out.
#[derive(Clone, Default)]
pub struct SourceScript {
    inner: Arc<SourceScriptInner>,
}

#[derive(Default)]
struct SourceScriptInner {
    queue: Mutex<VecDeque<Message>>,
    exists: AtomicBool,
    finished: AtomicBool,
}

impl SourceScript {
    pub fn new() -> Self {
        let script = Self::default();
        script.inner.exists.store(true, Ordering::Release);
        script
    }

    pub fn push(&self, offset: &str, body: &[u8]) {
        let mut headers = HashMap::new();
        headers.insert(header::OFFSET.to_string(), offset.to_string());
        headers.insert(header::STREAM_ID.to_string(), "s1".to_string());
        self.inner
            .queue
            .lock()
            .push_back(Message::new(Bytes::copy_from_slice(body), headers));
    }

    pub fn set_exists(&self, exists: bool) {
        self.inner.exists.store(exists, Ordering::Release);
    }

    /// Mark that no more data will ever come.
    pub fn set_finished(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }
}

/// Source adapter bound to its script at init time, keyed by the
/// profile's instance id.
pub struct ScriptedSource {
    scripts: Arc<Mutex<HashMap<String, SourceScript>>>,
    script: SourceScript,
}

impl ScriptedSource {
    pub fn new(scripts: Arc<Mutex<HashMap<String, SourceScript>>>) -> Self {
        Self {
            scripts,
            script: SourceScript::new(),
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    async fn init(&mut self, profile: &InstanceProfile) -> Result<()> {
        if let Some(script) = self.scripts.lock().get(&profile.instance_id) {
            self.script = script.clone();
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<Message>> {
        Ok(self.script.inner.queue.lock().pop_front())
    }

    async fn exists(&self) -> bool {
        self.script.inner.exists.load(Ordering::Acquire)
    }

    async fn finished(&self) -> bool {
        self.script.inner.finished.load(Ordering::Acquire)
            && self.script.inner.queue.lock().is_empty()
    }

    async fn destroy(&self) {}
}

/// Transport whose sends pass a permit gate, so tests can stall
/// acknowledgements batch by batch. `stop` unblocks waiters with an error.
pub struct GateTransport {
    sent: Mutex<Vec<StreamBatch>>,
    gate: Semaphore,
    closed: AtomicBool,
}

impl GateTransport {
    /// Every send passes immediately.
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            gate: Semaphore::new(1 << 30),
            closed: AtomicBool::new(false),
        })
    }

    /// Sends block until [`GateTransport::allow`] grants them.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn allow(&self, batches: usize) {
        self.gate.add_permits(batches);
    }

    pub fn sent_records(&self) -> usize {
        self.sent.lock().iter().map(|b| b.records.len()).sum()
    }

    pub fn sent_batches(&self) -> Vec<String> {
        self.sent.lock().iter().map(|b| b.stream_key.clone()).collect()
    }
}

#[async_trait]
impl Transport for GateTransport {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, batch: StreamBatch) -> Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::TransportClosed("gate closed".into()))?;
        permit.forget();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed("transport stopped".into()));
        }
        self.sent.lock().push(batch);
        Ok(())
    }

    async fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        self.gate.add_permits(1024);
    }
}

pub fn instance_profile(task_id: &str, instance_id: &str) -> InstanceProfile {
    InstanceProfile {
        task_id: task_id.to_string(),
        instance_id: instance_id.to_string(),
        source_tag: SOURCE_TAG.to_string(),
        sink_tag: SINK_TAG.to_string(),
        group_id: "g1".to_string(),
        stream_id: "s1".to_string(),
        file_update_time: 100,
        source_data_time: 100,
        sink_data_time: 100,
        inode: "65021".to_string(),
        field_splitter: "|".to_string(),
        extras: HashMap::new(),
        state: InstanceState::Default,
        modify_time: 100,
    }
}

pub fn task_profile(task_id: &str, cycle_unit: CycleUnit) -> TaskProfile {
    TaskProfile {
        task_id: task_id.to_string(),
        group_id: "g1".to_string(),
        stream_id: "s1".to_string(),
        cycle_unit,
        retry: false,
        state: TaskState::Running,
    }
}

/// Timings tight enough for tests without busy-waiting.
pub fn fast_manager_config(instance_limit: usize) -> ManagerConfig {
    ManagerConfig {
        instance_limit,
        core_tick: Duration::from_millis(20),
        db_clean_interval: Duration::from_millis(100),
        ..ManagerConfig::default()
    }
}

pub fn fast_instance_config() -> InstanceConfig {
    InstanceConfig {
        idle_sleep: Duration::from_millis(10),
        destroy_poll_interval: Duration::from_millis(5),
        action_retry_wait: Duration::from_millis(20),
        ..InstanceConfig::default()
    }
}

pub fn fast_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        batch_flush_interval: Duration::from_millis(10),
        save_offset_interval: Duration::from_millis(10),
        write_retry_wait: Duration::from_millis(5),
        destroy_poll_interval: Duration::from_millis(5),
        ..PipelineConfig::default()
    }
}

/// Registry with a scripted source per instance id and the real sink
/// pipeline in front of `transport`.
pub fn build_registry(
    scripts: HashMap<String, SourceScript>,
    transport: Arc<GateTransport>,
    budget: Arc<MemoryBudget>,
    store: Arc<dyn StateStore>,
    pipeline_config: PipelineConfig,
) -> Arc<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    let scripts = Arc::new(Mutex::new(scripts));
    let handout = scripts.clone();
    registry.register_source(SOURCE_TAG, move || {
        Box::new(ScriptedSource::new(handout.clone()))
    });
    registry.register_sink(SINK_TAG, move || {
        Box::new(SinkPipeline::new(
            pipeline_config.clone(),
            transport.clone(),
            budget.clone(),
            store.clone(),
        ))
    });
    Arc::new(registry)
}

pub fn new_budget(capacity: usize) -> Arc<MemoryBudget> {
    let budget = Arc::new(MemoryBudget::new());
    budget.register(AGENT_GLOBAL_WRITER_PERMIT, capacity);
    budget
}

pub fn new_store() -> Arc<InMemoryStateStore> {
    Arc::new(InMemoryStateStore::new())
}

/// Poll `cond` until true or the deadline passes.
pub async fn wait_for<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
