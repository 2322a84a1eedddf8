//! Sink pipeline: a bounded, stream-grouped, flush-on-timer buffer in
//! front of the downstream transport, driving the ack tracker and the
//! offset checkpoint.

use crate::ack::{AckHandle, AckTracker};
use crate::adapter::SinkAdapter;
use crate::config::PipelineConfig;
use crate::memory::{MemoryBudget, AGENT_GLOBAL_WRITER_PERMIT};
use crate::metrics;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use logship_common::store::StateStore;
use logship_common::types::{header, InstanceProfile, Message};
use logship_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// One batch handed to the transport. Records come from a single stream
/// key and stay in enqueue order.
#[derive(Debug)]
pub struct StreamBatch {
    pub group_id: String,
    pub stream_key: String,
    pub data_time: i64,
    pub records: Vec<Bytes>,
    pub total_bytes: usize,
}

/// Downstream transport (the dataproxy client). `send` retries internally
/// and returns `Ok` only once the batch is accepted downstream; it errors
/// only when the transport has been shut down with work still in flight.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn send(&self, batch: StreamBatch) -> Result<()>;

    async fn stop(&self);
}

struct QueuedMessage {
    body: Bytes,
    handle: AckHandle,
}

struct PipelineInner {
    profile: InstanceProfile,
    field_splitter: Vec<u8>,
    config: PipelineConfig,
    transport: Arc<dyn Transport>,
    budget: Arc<MemoryBudget>,
    store: Arc<dyn StateStore>,
    tracker: AckTracker,
    queues: DashMap<String, Mutex<VecDeque<QueuedMessage>>>,
    shutdown: AtomicBool,
    flusher_running: AtomicBool,
    offset_running: AtomicBool,
}

/// Sink adapter buffering messages per stream key and flushing them to the
/// transport on a timer. Write acceptance is gated by the global writer
/// permit pool; acknowledged batches advance the durable offset through
/// the ack tracker's prefix drain.
pub struct SinkPipeline {
    config: PipelineConfig,
    transport: Arc<dyn Transport>,
    budget: Arc<MemoryBudget>,
    store: Arc<dyn StateStore>,
    inner: Option<Arc<PipelineInner>>,
}

impl SinkPipeline {
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
        budget: Arc<MemoryBudget>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            transport,
            budget,
            store,
            inner: None,
        }
    }
}

#[async_trait]
impl SinkAdapter for SinkPipeline {
    async fn init(&mut self, profile: &InstanceProfile) -> Result<()> {
        let inner = Arc::new(PipelineInner {
            profile: profile.clone(),
            field_splitter: profile.field_splitter.clone().into_bytes(),
            config: self.config.clone(),
            transport: self.transport.clone(),
            budget: self.budget.clone(),
            store: self.store.clone(),
            tracker: AckTracker::new(self.budget.clone(), AGENT_GLOBAL_WRITER_PERMIT),
            queues: DashMap::new(),
            shutdown: AtomicBool::new(false),
            flusher_running: AtomicBool::new(false),
            offset_running: AtomicBool::new(false),
        });

        if let Err(e) = self.transport.start().await {
            inner.shutdown.store(true, Ordering::Release);
            error!(
                task_id = %profile.task_id,
                instance_id = %profile.instance_id,
                error = %e,
                "failed to start sink transport"
            );
            return Err(Error::InitFailure(format!("transport start failed: {}", e)));
        }

        let flusher = inner.clone();
        tokio::spawn(async move { flusher.run_flusher().await });
        let checkpointer = inner.clone();
        tokio::spawn(async move { checkpointer.run_offset_flusher().await });

        info!(
            task_id = %profile.task_id,
            instance_id = %profile.instance_id,
            "sink pipeline started"
        );
        self.inner = Some(inner);
        Ok(())
    }

    async fn write(&self, msg: Message) {
        let Some(inner) = &self.inner else {
            warn!("write on uninitialized sink pipeline");
            return;
        };
        let mut msg = msg;
        while !inner.shutdown.load(Ordering::Acquire) {
            if inner.put_in_cache(&mut msg) {
                return;
            }
            sleep(inner.config.write_retry_wait).await;
        }
    }

    async fn finished(&self) -> bool {
        self.inner
            .as_ref()
            .map(|inner| inner.tracker.is_empty())
            .unwrap_or(true)
    }

    async fn destroy(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        info!(
            task_id = %inner.profile.task_id,
            instance_id = %inner.profile.instance_id,
            "destroy sink pipeline"
        );
        inner.shutdown.store(true, Ordering::Release);
        // Transport first: a flusher blocked in send() must error out
        // before the running-flag wait below can complete.
        inner.transport.stop().await;
        while inner.flusher_running.load(Ordering::Acquire)
            || inner.offset_running.load(Ordering::Acquire)
        {
            sleep(inner.config.destroy_poll_interval).await;
        }
        inner.tracker.clear();
        info!(
            task_id = %inner.profile.task_id,
            instance_id = %inner.profile.instance_id,
            "destroy sink pipeline end"
        );
    }
}

impl PipelineInner {
    /// One write attempt: permit, per-stream queue, ack entry. Returns
    /// false when the permit pool is exhausted so the caller can back off.
    fn put_in_cache(&self, msg: &mut Message) -> bool {
        if msg.is_end() {
            metrics::record_sink_fail(&self.profile.group_id, &self.profile.stream_id);
            return true;
        }
        self.extract_stream_id(msg);
        let len = msg.body.len();
        if !self.budget.try_acquire(AGENT_GLOBAL_WRITER_PERMIT, len) {
            self.budget.report(AGENT_GLOBAL_WRITER_PERMIT, "sink pipeline");
            return false;
        }
        let handle = self.tracker.enqueue(msg.offset().to_string(), len);
        let stream_key = self.stream_key(msg);
        self.queues
            .entry(stream_key)
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .push_back(QueuedMessage {
                body: msg.body.clone(),
                handle,
            });
        true
    }

    /// Populate the streamId header from the first splitter-delimited body
    /// field when the source did not set one.
    fn extract_stream_id(&self, msg: &mut Message) {
        if self.field_splitter.is_empty() || msg.header.contains_key(header::STREAM_ID) {
            return;
        }
        let body = &msg.body;
        let field_end = body
            .windows(self.field_splitter.len())
            .position(|window| window == self.field_splitter.as_slice())
            .unwrap_or(body.len());
        let stream_id = String::from_utf8_lossy(&body[..field_end]).into_owned();
        if !stream_id.is_empty() {
            msg.header.insert(header::STREAM_ID.to_string(), stream_id);
        }
    }

    fn stream_key(&self, msg: &Message) -> String {
        msg.header_value(header::STREAM_KEY)
            .or_else(|| msg.header_value(header::STREAM_ID))
            .unwrap_or(&self.profile.stream_id)
            .to_string()
    }

    async fn run_flusher(self: Arc<Self>) {
        self.flusher_running.store(true, Ordering::Release);
        info!(
            task_id = %self.profile.task_id,
            instance_id = %self.profile.instance_id,
            "start flushing sink cache"
        );
        while !self.shutdown.load(Ordering::Acquire) {
            self.flush_cache().await;
            sleep(self.config.batch_flush_interval).await;
        }
        info!(
            task_id = %self.profile.task_id,
            instance_id = %self.profile.instance_id,
            "stop flushing sink cache"
        );
        self.flusher_running.store(false, Ordering::Release);
    }

    /// Cut one batch per non-empty stream queue and hand each to the
    /// transport. Batches within a stream key never reorder.
    async fn flush_cache(&self) {
        let stream_keys: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for stream_key in stream_keys {
            let Some((records, handles, total_bytes)) = self.cut_batch(&stream_key) else {
                continue;
            };
            let batch = StreamBatch {
                group_id: self.profile.group_id.clone(),
                stream_key: stream_key.clone(),
                data_time: self.profile.sink_data_time,
                records,
                total_bytes,
            };
            match self.transport.send(batch).await {
                Ok(()) => {
                    for handle in &handles {
                        handle.ack();
                    }
                    debug!(
                        task_id = %self.profile.task_id,
                        instance_id = %self.profile.instance_id,
                        stream_key = %stream_key,
                        records = handles.len(),
                        "batch accepted downstream"
                    );
                }
                Err(e) => {
                    error!(
                        task_id = %self.profile.task_id,
                        instance_id = %self.profile.instance_id,
                        stream_key = %stream_key,
                        error = %e,
                        "transport rejected batch"
                    );
                }
            }
        }
    }

    fn cut_batch(&self, stream_key: &str) -> Option<(Vec<Bytes>, Vec<AckHandle>, usize)> {
        let queue_ref = self.queues.get(stream_key)?;
        let mut queue = queue_ref.lock();
        if queue.is_empty() {
            return None;
        }
        let mut records = Vec::new();
        let mut handles = Vec::new();
        let mut total_bytes = 0usize;
        loop {
            let fits = match queue.front() {
                Some(front) => {
                    records.is_empty()
                        || (records.len() < self.config.batch_max_records
                            && total_bytes + front.body.len() <= self.config.batch_max_bytes)
                }
                None => false,
            };
            if !fits {
                break;
            }
            if let Some(queued) = queue.pop_front() {
                total_bytes += queued.body.len();
                records.push(queued.body);
                handles.push(queued.handle);
            }
        }
        Some((records, handles, total_bytes))
    }

    async fn run_offset_flusher(self: Arc<Self>) {
        self.offset_running.store(true, Ordering::Release);
        info!(
            task_id = %self.profile.task_id,
            instance_id = %self.profile.instance_id,
            "start flushing offsets"
        );
        while !self.shutdown.load(Ordering::Acquire) {
            self.flush_offset().await;
            sleep(self.config.save_offset_interval).await;
        }
        info!(
            task_id = %self.profile.task_id,
            instance_id = %self.profile.instance_id,
            "stop flushing offsets"
        );
        self.offset_running.store(false, Ordering::Release);
    }

    async fn flush_offset(&self) {
        let Some(offset) = self.tracker.drain() else {
            return;
        };
        info!(
            task_id = %self.profile.task_id,
            instance_id = %self.profile.instance_id,
            offset = %offset,
            "save offset"
        );
        let record = logship_common::types::OffsetRecord::new(
            self.profile.task_id.clone(),
            self.profile.instance_id.clone(),
            offset,
            self.profile.inode.clone(),
        );
        if let Err(e) = self.store.save_offset(record).await {
            error!(
                task_id = %self.profile.task_id,
                instance_id = %self.profile.instance_id,
                error = %e,
                "failed to persist offset"
            );
        }
    }
}
