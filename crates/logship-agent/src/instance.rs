//! A single ingest instance: the state machine wiring one source to one
//! sink, including the termination protocol.

use crate::adapter::{AdapterRegistry, SinkAdapter, SourceAdapter};
use crate::config::InstanceConfig;
use crate::manager::{ActionBus, InstanceAction};
use crate::metrics;
use logship_common::now_millis;
use logship_common::store::StateStore;
use logship_common::types::{InstanceProfile, InstanceState};
use logship_common::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, info};

/// Runtime object for one unit of ingestion (typically one file).
///
/// The run loop is a single cooperative worker: read a message, hand it to
/// the sink (which may block on backpressure), and probe for completion
/// when the source runs dry. Termination goes through the supervisor's
/// action queue; destruction blocks until the run loop has observed the
/// stop flag.
pub struct Instance {
    profile: InstanceProfile,
    source: Box<dyn SourceAdapter>,
    sink: Box<dyn SinkAdapter>,
    store: Arc<dyn StateStore>,
    actions: ActionBus,
    config: InstanceConfig,
    stop: AtomicBool,
    running: AtomicBool,
}

impl Instance {
    /// Build and initialize source and sink for `profile`. On any failure
    /// the instance is fatal: its offset record is removed, nothing is
    /// registered, and the run loop must not be started.
    pub async fn init(
        profile: InstanceProfile,
        registry: &AdapterRegistry,
        store: Arc<dyn StateStore>,
        actions: ActionBus,
        config: InstanceConfig,
    ) -> Result<Arc<Self>> {
        match Self::try_init(&profile, registry, store.clone(), actions, config).await {
            Ok(instance) => {
                info!(
                    task_id = %profile.task_id,
                    instance_id = %profile.instance_id,
                    "instance initialized"
                );
                Ok(instance)
            }
            Err(e) => {
                error!(
                    task_id = %profile.task_id,
                    instance_id = %profile.instance_id,
                    error = %e,
                    "instance init failed"
                );
                if let Err(del) = store
                    .delete_offset(&profile.task_id, &profile.instance_id)
                    .await
                {
                    error!(
                        task_id = %profile.task_id,
                        instance_id = %profile.instance_id,
                        error = %del,
                        "failed to remove offset of fatal instance"
                    );
                }
                Err(e)
            }
        }
    }

    async fn try_init(
        profile: &InstanceProfile,
        registry: &AdapterRegistry,
        store: Arc<dyn StateStore>,
        actions: ActionBus,
        config: InstanceConfig,
    ) -> Result<Arc<Self>> {
        let mut source = registry.create_source(&profile.source_tag)?;
        source.init(profile).await?;
        let mut sink = registry.create_sink(&profile.sink_tag)?;
        sink.init(profile).await?;
        Ok(Arc::new(Self {
            profile: profile.clone(),
            source,
            sink,
            store,
            actions,
            config,
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }))
    }

    pub fn task_id(&self) -> &str {
        &self.profile.task_id
    }

    pub fn instance_id(&self) -> &str {
        &self.profile.instance_id
    }

    pub fn profile(&self) -> &InstanceProfile {
        &self.profile
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Start the run loop as its own task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        self.running.store(true, Ordering::Release);
        info!(
            task_id = %self.profile.task_id,
            instance_id = %self.profile.instance_id,
            "instance run loop started"
        );
        self.do_run().await;
        self.running.store(false, Ordering::Release);
        info!(
            task_id = %self.profile.task_id,
            instance_id = %self.profile.instance_id,
            "instance run loop stopped"
        );
    }

    async fn do_run(&self) {
        let mut finish_probes = 0u32;
        while !self.stopped() {
            if !self.source.exists().await {
                self.handle_source_deleted().await;
                break;
            }
            match self.source.read().await {
                Ok(Some(msg)) => {
                    finish_probes = 0;
                    self.sink.write(msg).await;
                }
                Ok(None) => {
                    if self.source.finished().await && self.sink.finished().await {
                        finish_probes += 1;
                        if finish_probes > self.config.check_finish_at_least_count {
                            self.handle_read_end().await;
                            break;
                        }
                    } else {
                        finish_probes = 0;
                    }
                    sleep(self.config.idle_sleep).await;
                    metrics::record_instance_heartbeat(
                        &self.profile.group_id,
                        &self.profile.stream_id,
                    );
                }
                Err(e) => {
                    error!(
                        task_id = %self.profile.task_id,
                        instance_id = %self.profile.instance_id,
                        error = %e,
                        "source read error"
                    );
                    finish_probes = 0;
                    sleep(self.config.idle_sleep).await;
                }
            }
        }
    }

    /// The source and sink are both drained: ask the supervisor to mark
    /// this instance finished.
    async fn handle_read_end(&self) {
        let action = InstanceAction::finish(self.profile.clone());
        self.submit_with_retry(action).await;
    }

    /// The source is gone: drop the durable offset and ask the supervisor
    /// to delete this instance.
    async fn handle_source_deleted(&self) {
        if let Err(e) = self
            .store
            .delete_offset(&self.profile.task_id, &self.profile.instance_id)
            .await
        {
            error!(
                task_id = %self.profile.task_id,
                instance_id = %self.profile.instance_id,
                error = %e,
                "failed to delete offset of removed source"
            );
        }
        let mut profile = self.profile.clone();
        profile.set_state(InstanceState::Delete, now_millis());
        self.submit_with_retry(InstanceAction::delete(profile)).await;
    }

    /// Submit an action, backing off while the supervisor queue is full.
    /// Gives up only when the stop flag is observed.
    async fn submit_with_retry(&self, action: InstanceAction) {
        while !self.stopped() {
            if self.actions.submit(action.clone()) {
                return;
            }
            error!(
                task_id = %self.profile.task_id,
                instance_id = %self.profile.instance_id,
                "instance manager action queue is full"
            );
            sleep(self.config.action_retry_wait).await;
        }
    }

    /// Signal the run loop to stop, wait for it to exit, then tear down
    /// source and sink in that order. Safe to call while the loop is still
    /// running.
    pub async fn destroy(&self) {
        self.stop.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            sleep(self.config.destroy_poll_interval).await;
        }
        self.source.destroy().await;
        self.sink.destroy().await;
    }
}
