//! Per-task supervisor: admission of new instances, reconciliation with
//! the state store, the action queue, and expiry GC.

use crate::adapter::AdapterRegistry;
use crate::config::{InstanceConfig, ManagerConfig};
use crate::instance::Instance;
use crate::metrics;
use dashmap::DashMap;
use logship_common::now_millis;
use logship_common::store::StateStore;
use logship_common::types::{InstanceProfile, InstanceState, TaskProfile, TaskState};
use logship_common::Result;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Supervisor command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Finish,
    Delete,
}

/// One command on the supervisor queue.
#[derive(Debug, Clone)]
pub struct InstanceAction {
    pub kind: ActionKind,
    pub profile: InstanceProfile,
}

impl InstanceAction {
    pub fn add(profile: InstanceProfile) -> Self {
        Self {
            kind: ActionKind::Add,
            profile,
        }
    }

    pub fn finish(profile: InstanceProfile) -> Self {
        Self {
            kind: ActionKind::Finish,
            profile,
        }
    }

    pub fn delete(profile: InstanceProfile) -> Self {
        Self {
            kind: ActionKind::Delete,
            profile,
        }
    }
}

/// Bounded FIFO of supervisor commands. `submit` never blocks; producers
/// own their retry policy when the queue is full.
#[derive(Clone)]
pub struct ActionBus {
    tx: mpsc::Sender<InstanceAction>,
}

impl ActionBus {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<InstanceAction>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Returns false when the queue is full.
    pub fn submit(&self, action: InstanceAction) -> bool {
        self.tx.try_send(action).is_ok()
    }

    /// Number of actions waiting to be drained.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Per-state record counts, logged with the expiry sweep summary.
#[derive(Default)]
struct StateStat {
    default_count: usize,
    finished_count: usize,
    delete_count: usize,
    other_count: usize,
}

impl StateStat {
    fn record(&mut self, state: InstanceState) {
        match state {
            InstanceState::Default => self.default_count += 1,
            InstanceState::Finished => self.finished_count += 1,
            InstanceState::Delete => self.delete_count += 1,
            InstanceState::Fatal => self.other_count += 1,
        }
    }
}

impl fmt::Display for StateStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "default {} finished {} delete {} other {}",
            self.default_count, self.finished_count, self.delete_count, self.other_count
        )
    }
}

/// Supervisor for the instances of one task.
///
/// Instance info lives in both the state store and memory; the core loop
/// keeps the two in pace, drains the action queue, and garbage-collects
/// expired finished records.
pub struct InstanceManager {
    task_id: String,
    config: ManagerConfig,
    instance_config: InstanceConfig,
    store: Arc<dyn StateStore>,
    registry: Arc<AdapterRegistry>,
    instances: DashMap<String, Arc<Instance>>,
    bus: ActionBus,
    rx: tokio::sync::Mutex<mpsc::Receiver<InstanceAction>>,
    task_profile: parking_lot::RwLock<Option<TaskProfile>>,
    stop: AtomicBool,
    running: AtomicBool,
    ran_at_least_once: AtomicBool,
    last_clean_time: AtomicI64,
}

impl InstanceManager {
    pub fn new(
        task_id: &str,
        config: ManagerConfig,
        instance_config: InstanceConfig,
        store: Arc<dyn StateStore>,
        registry: Arc<AdapterRegistry>,
    ) -> Arc<Self> {
        let (bus, rx) = ActionBus::new(config.action_queue_capacity);
        Arc::new(Self {
            task_id: task_id.to_string(),
            config,
            instance_config,
            store,
            registry,
            instances: DashMap::new(),
            bus,
            rx: tokio::sync::Mutex::new(rx),
            task_profile: parking_lot::RwLock::new(None),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            ran_at_least_once: AtomicBool::new(false),
            last_clean_time: AtomicI64::new(0),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Handle producers use to submit actions.
    pub fn action_bus(&self) -> ActionBus {
        self.bus.clone()
    }

    /// Non-blocking submit; false when the queue is full.
    pub fn submit_action(&self, action: InstanceAction) -> bool {
        self.bus.submit(action)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    pub async fn get_instance_profile(&self, instance_id: &str) -> Result<Option<InstanceProfile>> {
        self.store.get_instance(&self.task_id, instance_id).await
    }

    /// Load estimate for the upstream scheduler: live instances plus
    /// queued actions against a reserve fraction of the limit.
    pub fn is_full(&self) -> bool {
        let load = self.instances.len() + self.bus.pending();
        load as f64 >= self.config.instance_limit as f64 * self.config.reserve_coefficient
    }

    /// True iff the manager has looped at least once, nothing is live or
    /// queued, and every store record is finished.
    pub async fn all_instances_finished(&self) -> Result<bool> {
        if !self.ran_at_least_once.load(Ordering::Acquire) {
            return Ok(false);
        }
        if !self.instances.is_empty() {
            return Ok(false);
        }
        if self.bus.pending() > 0 {
            return Ok(false);
        }
        let profiles = self.store.list_instances(&self.task_id).await?;
        Ok(profiles
            .iter()
            .all(|profile| profile.state == InstanceState::Finished))
    }

    /// Restore live instances from the store and start the core loop.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.restore_from_db().await?;
        let manager = self.clone();
        tokio::spawn(async move { manager.run_core().await });
        Ok(())
    }

    /// Signal the core loop, wait for it to exit, then destroy every live
    /// instance.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            sleep(self.config.core_tick).await;
        }
        self.stop_all_instances().await;
    }

    async fn run_core(self: Arc<Self>) {
        self.running.store(true, Ordering::Release);
        info!(task_id = %self.task_id, "instance manager core loop started");
        while !self.stop.load(Ordering::Acquire) {
            sleep(self.config.core_tick).await;
            if let Err(e) = self.clean_db_instances().await {
                error!(task_id = %self.task_id, error = %e, "expiry sweep failed");
            }
            self.drain_actions().await;
            if let Err(e) = self.keep_pace_with_db().await {
                error!(task_id = %self.task_id, error = %e, "reconciliation failed");
            }
            let (group_id, stream_id) = self.task_labels();
            metrics::record_manager_heartbeat(&group_id, &stream_id);
            self.ran_at_least_once.store(true, Ordering::Release);
        }
        info!(task_id = %self.task_id, "instance manager core loop stopped");
        self.running.store(false, Ordering::Release);
    }

    fn task_labels(&self) -> (String, String) {
        let task = self.task_profile.read();
        match task.as_ref() {
            Some(profile) => (profile.group_id.clone(), profile.stream_id.clone()),
            None => (String::new(), String::new()),
        }
    }

    async fn restore_from_db(&self) -> Result<()> {
        let task = self.store.get_task(&self.task_id).await?;
        if task.is_none() {
            error!(task_id = %self.task_id, "no task profile in store");
        }
        *self.task_profile.write() = task;

        for profile in self.store.list_instances(&self.task_id).await? {
            if profile.state == InstanceState::Default {
                info!(
                    task_id = %self.task_id,
                    instance_id = %profile.instance_id,
                    "restore adds instance to memory"
                );
                self.add_to_memory(profile).await;
            } else {
                info!(
                    task_id = %self.task_id,
                    instance_id = %profile.instance_id,
                    state = ?profile.state,
                    "restore ignores terminal instance"
                );
            }
        }
        Ok(())
    }

    async fn drain_actions(&self) {
        let mut rx = self.rx.lock().await;
        while !self.stop.load(Ordering::Acquire) {
            let action = match rx.try_recv() {
                Ok(action) => action,
                Err(_) => break,
            };
            let result = match action.kind {
                ActionKind::Add => self.add_instance(action.profile).await,
                ActionKind::Finish => self.finish_instance(action.profile).await,
                ActionKind::Delete => self.delete_instance(&action.profile.instance_id).await,
            };
            if let Err(e) = result {
                error!(task_id = %self.task_id, error = %e, "action handling failed");
            }
        }
    }

    async fn add_instance(&self, profile: InstanceProfile) -> Result<()> {
        if self.instances.len() >= self.config.instance_limit {
            error!(
                task_id = %self.task_id,
                live = self.instances.len(),
                limit = self.config.instance_limit,
                "instance map over limit, dropping add"
            );
            return Ok(());
        }
        info!(
            task_id = %self.task_id,
            instance_id = %profile.instance_id,
            "add instance"
        );
        if !self
            .should_add_again(&profile.instance_id, profile.file_update_time)
            .await?
        {
            info!(
                task_id = %self.task_id,
                instance_id = %profile.instance_id,
                "instance already handled, skipping add"
            );
            return Ok(());
        }
        let mut stored = profile;
        stored.set_state(InstanceState::Default, now_millis());
        self.store.store_instance(&stored).await?;
        metrics::record_instance_added_db(&stored.group_id, &stored.stream_id);
        self.add_to_memory(stored).await;
        Ok(())
    }

    async fn finish_instance(&self, mut profile: InstanceProfile) -> Result<()> {
        profile.set_state(InstanceState::Finished, now_millis());
        self.store.store_instance(&profile).await?;
        self.delete_from_memory(&profile.instance_id).await;
        info!(
            task_id = %profile.task_id,
            instance_id = %profile.instance_id,
            "instance finished"
        );
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.delete_from_db(instance_id).await?;
        self.delete_from_memory(instance_id).await;
        Ok(())
    }

    /// Remove the profile and its offset record in one logical step.
    async fn delete_from_db(&self, instance_id: &str) -> Result<()> {
        let profile = self.store.get_instance(&self.task_id, instance_id).await?;
        self.store.delete_instance(&self.task_id, instance_id).await?;
        self.store.delete_offset(&self.task_id, instance_id).await?;
        info!(
            task_id = %self.task_id,
            instance_id = %instance_id,
            "deleted instance from store"
        );
        if let Some(profile) = profile {
            metrics::record_instance_deleted_db(&profile.group_id, &profile.stream_id);
        }
        Ok(())
    }

    async fn delete_from_memory(&self, instance_id: &str) {
        let Some((_, instance)) = self.instances.remove(instance_id) else {
            error!(
                task_id = %self.task_id,
                instance_id = %instance_id,
                "instance to delete not found in memory"
            );
            return;
        };
        instance.destroy().await;
        metrics::record_instance_deleted_mem(
            &instance.profile().group_id,
            &instance.profile().stream_id,
        );
        metrics::set_live_instances(&self.task_id, self.instances.len());
        info!(
            task_id = %self.task_id,
            instance_id = %instance_id,
            "deleted instance from memory"
        );
    }

    /// Instantiate and start an instance. A stale in-memory entry for the
    /// same id is destroyed first.
    async fn add_to_memory(&self, profile: InstanceProfile) {
        if let Some((_, stale)) = self.instances.remove(&profile.instance_id) {
            error!(
                task_id = %self.task_id,
                instance_id = %profile.instance_id,
                "stale instance should not exist, stopping it first"
            );
            stale.destroy().await;
            metrics::record_instance_unusual_delete(&profile.group_id, &profile.stream_id);
        }
        match Instance::init(
            profile.clone(),
            &self.registry,
            self.store.clone(),
            self.bus.clone(),
            self.instance_config.clone(),
        )
        .await
        {
            Ok(instance) => {
                self.instances
                    .insert(profile.instance_id.clone(), instance.clone());
                instance.spawn();
                metrics::record_instance_added_mem(&profile.group_id, &profile.stream_id);
                metrics::set_live_instances(&self.task_id, self.instances.len());
                info!(
                    task_id = %self.task_id,
                    instance_id = %profile.instance_id,
                    live = self.instances.len(),
                    "added instance to memory"
                );
            }
            Err(e) => {
                error!(
                    task_id = %self.task_id,
                    instance_id = %profile.instance_id,
                    error = %e,
                    "instance init failed, not registering"
                );
                metrics::record_instance_add_failed(&profile.group_id, &profile.stream_id);
            }
        }
    }

    /// Enforce the in-memory <-> durable contract in both directions.
    async fn keep_pace_with_db(&self) -> Result<()> {
        self.db_to_memory().await?;
        self.memory_to_db().await?;
        Ok(())
    }

    async fn db_to_memory(&self) -> Result<()> {
        for profile in self.store.list_instances(&self.task_id).await? {
            let present = self.instances.contains_key(&profile.instance_id);
            match profile.state {
                InstanceState::Default => {
                    if !present {
                        info!(
                            task_id = %self.task_id,
                            instance_id = %profile.instance_id,
                            "reconcile adds instance to memory"
                        );
                        self.add_to_memory(profile).await;
                    }
                }
                // Finished and deleted records both mean the instance must
                // not stay live.
                InstanceState::Finished | InstanceState::Delete => {
                    if present {
                        info!(
                            task_id = %self.task_id,
                            instance_id = %profile.instance_id,
                            "reconcile removes instance from memory"
                        );
                        self.delete_from_memory(&profile.instance_id).await;
                    }
                }
                other => {
                    error!(
                        task_id = %self.task_id,
                        instance_id = %profile.instance_id,
                        state = ?other,
                        "instance record in invalid state"
                    );
                }
            }
        }
        Ok(())
    }

    async fn memory_to_db(&self) -> Result<()> {
        let live_ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for instance_id in live_ids {
            let profile = self.store.get_instance(&self.task_id, &instance_id).await?;
            let keep = matches!(
                profile.as_ref().map(|p| p.state),
                Some(InstanceState::Default)
            );
            if !keep {
                self.delete_from_memory(&instance_id).await;
            }
        }
        Ok(())
    }

    /// Expiry sweep: delete finished records that have outlived the
    /// retention window, then log a state summary.
    async fn clean_db_instances(&self) -> Result<()> {
        let now = now_millis();
        let elapsed = now - self.last_clean_time.load(Ordering::Acquire);
        if elapsed <= self.config.db_clean_interval.as_millis() as i64 {
            return Ok(());
        }
        let profiles = self.store.list_instances(&self.task_id).await?;
        let deleted = self.sweep_expired(&profiles, now).await?;

        let mut stat = StateStat::default();
        for profile in &profiles {
            if !deleted.contains(&profile.instance_id) {
                stat.record(profile.state);
            }
        }
        info!(
            task_id = %self.task_id,
            live = self.instances.len(),
            stored = profiles.len() - deleted.len(),
            states = %stat,
            pending_actions = self.bus.pending(),
            "instance manager running"
        );
        self.last_clean_time.store(now, Ordering::Release);
        Ok(())
    }

    async fn sweep_expired(&self, profiles: &[InstanceProfile], now: i64) -> Result<Vec<String>> {
        let Some(task) = self.task_profile.read().clone() else {
            return Ok(Vec::new());
        };
        if task.cycle_unit.is_real_time() {
            return Ok(Vec::new());
        }
        if task.retry && task.state != TaskState::RetryFinish {
            return Ok(Vec::new());
        }
        let Some(window) = task.cycle_unit.expire_after(self.config.expire_cycle_count) else {
            return Ok(Vec::new());
        };
        let window_millis = window.as_millis() as i64;

        let mut deleted = Vec::new();
        for profile in profiles {
            if deleted.len() >= self.config.clean_once_limit {
                break;
            }
            if profile.state != InstanceState::Finished {
                continue;
            }
            if now - profile.modify_time > window_millis {
                info!(
                    task_id = %profile.task_id,
                    instance_id = %profile.instance_id,
                    data_time = profile.source_data_time,
                    "instance record expired, deleting from store"
                );
                self.delete_from_db(&profile.instance_id).await?;
                deleted.push(profile.instance_id.clone());
            }
        }
        Ok(deleted)
    }

    /// Whether an ADD for `instance_id` should be honored given what the
    /// store already records. Pure over store state and the supplied file
    /// update time.
    pub async fn should_add_again(&self, instance_id: &str, file_update_time: i64) -> Result<bool> {
        let Some(profile) = self.store.get_instance(&self.task_id, instance_id).await? else {
            debug!(instance_id = %instance_id, "not in store, should add");
            return Ok(true);
        };
        match profile.state {
            InstanceState::Finished if file_update_time > profile.modify_time => {
                debug!(instance_id = %instance_id, "finished but file updated again");
                Ok(true)
            }
            InstanceState::Delete => {
                debug!(instance_id = %instance_id, "deleted and added again");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stop_all_instances(&self) {
        let live_ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for instance_id in live_ids {
            self.delete_from_memory(&instance_id).await;
        }
    }
}
