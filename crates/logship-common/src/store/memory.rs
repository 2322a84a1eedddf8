//! In-memory implementation of StateStore for testing.

use super::traits::StateStore;
use crate::error::Result;
use crate::now_millis;
use crate::types::{InstanceProfile, OffsetRecord, TaskProfile};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

/// In-memory state store. Keyed the same way as the sled store but without
/// durability; intended for tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    instances: RwLock<HashMap<(String, String), InstanceProfile>>,
    offsets: RwLock<HashMap<(String, String), OffsetRecord>>,
    tasks: RwLock<HashMap<String, TaskProfile>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn store_instance(&self, profile: &InstanceProfile) -> Result<()> {
        let key = (profile.task_id.clone(), profile.instance_id.clone());
        self.instances.write().await.insert(key, profile.clone());
        Ok(())
    }

    async fn get_instance(
        &self,
        task_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceProfile>> {
        let key = (task_id.to_string(), instance_id.to_string());
        Ok(self.instances.read().await.get(&key).cloned())
    }

    async fn delete_instance(&self, task_id: &str, instance_id: &str) -> Result<()> {
        let key = (task_id.to_string(), instance_id.to_string());
        self.instances.write().await.remove(&key);
        Ok(())
    }

    async fn list_instances(&self, task_id: &str) -> Result<Vec<InstanceProfile>> {
        let instances = self.instances.read().await;
        let mut out: Vec<InstanceProfile> = instances
            .iter()
            .filter(|((task, _), _)| task == task_id)
            .map(|(_, profile)| profile.clone())
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }

    async fn save_offset(&self, mut record: OffsetRecord) -> Result<()> {
        if !record.is_complete() {
            warn!(
                task_id = %record.task_id,
                instance_id = %record.instance_id,
                "dropping offset record with missing required fields"
            );
            return Ok(());
        }
        record.last_update_time = now_millis();
        let key = (record.task_id.clone(), record.instance_id.clone());
        self.offsets.write().await.insert(key, record);
        Ok(())
    }

    async fn get_offset(&self, task_id: &str, instance_id: &str) -> Result<Option<OffsetRecord>> {
        let key = (task_id.to_string(), instance_id.to_string());
        Ok(self.offsets.read().await.get(&key).cloned())
    }

    async fn delete_offset(&self, task_id: &str, instance_id: &str) -> Result<()> {
        let key = (task_id.to_string(), instance_id.to_string());
        self.offsets.write().await.remove(&key);
        Ok(())
    }

    async fn list_offsets(&self) -> Result<Vec<OffsetRecord>> {
        Ok(self.offsets.read().await.values().cloned().collect())
    }

    async fn store_task(&self, task: &TaskProfile) -> Result<()> {
        self.tasks
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskProfile>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }
}
