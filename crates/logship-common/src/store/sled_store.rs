//! Sled-based implementation of StateStore.

use super::traits::{instance_key, instance_prefix, offset_key, task_key, StateStore};
use crate::error::{Error, Result};
use crate::now_millis;
use crate::types::{InstanceProfile, OffsetRecord, TaskProfile};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::path::Path;
use tracing::warn;

/// Sled-backed state store. One ordered keyspace holds the three logical
/// key spaces, distinguished by key prefix:
///
/// - `instance:{taskId}:{instanceId}` -> JSON instance profile
/// - `offset:{taskId}_{instanceId}` -> JSON offset record
/// - `task:{taskId}` -> JSON task profile
pub struct SledStateStore {
    db: Db,
}

impl SledStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| Error::Storage(format!("failed to open state db: {}", e)))?;
        Ok(Self { db })
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    /// Scan a key prefix, decoding values and skipping (never repairing)
    /// records that no longer parse.
    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(decoded) => out.push(decoded),
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping corrupt record in state db"
                    );
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StateStore for SledStateStore {
    async fn store_instance(&self, profile: &InstanceProfile) -> Result<()> {
        self.put(&instance_key(&profile.task_id, &profile.instance_id), profile)
    }

    async fn get_instance(
        &self,
        task_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceProfile>> {
        self.get(&instance_key(task_id, instance_id))
    }

    async fn delete_instance(&self, task_id: &str, instance_id: &str) -> Result<()> {
        self.remove(&instance_key(task_id, instance_id))
    }

    async fn list_instances(&self, task_id: &str) -> Result<Vec<InstanceProfile>> {
        self.scan(&instance_prefix(task_id))
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
        self.put(&offset_key(&record.task_id, &record.instance_id), &record)
    }

    async fn get_offset(&self, task_id: &str, instance_id: &str) -> Result<Option<OffsetRecord>> {
        self.get(&offset_key(task_id, instance_id))
    }

    async fn delete_offset(&self, task_id: &str, instance_id: &str) -> Result<()> {
        self.remove(&offset_key(task_id, instance_id))
    }

    async fn list_offsets(&self) -> Result<Vec<OffsetRecord>> {
        self.scan("offset:")
    }

    async fn store_task(&self, task: &TaskProfile) -> Result<()> {
        self.put(&task_key(&task.task_id), task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskProfile>> {
        self.get(&task_key(task_id))
    }
}
