//! State store abstraction over the three persisted key spaces.

use crate::error::Result;
use crate::types::{InstanceProfile, OffsetRecord, TaskProfile};
use async_trait::async_trait;

/// Durable mapping of instance profiles, offset records, and task profiles.
///
/// Crash consistency contract: a process restarted after a crash observes
/// exactly the last successful store/delete for each key. Implementations
/// must be safe under concurrent reads from the supervisor and listing by
/// the expiry sweep; the supervisor is the single writer per key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist an instance profile, overwriting any previous record.
    async fn store_instance(&self, profile: &InstanceProfile) -> Result<()>;

    async fn get_instance(
        &self,
        task_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceProfile>>;

    /// Delete is a no-op when the record does not exist.
    async fn delete_instance(&self, task_id: &str, instance_id: &str) -> Result<()>;

    async fn list_instances(&self, task_id: &str) -> Result<Vec<InstanceProfile>>;

    /// Persist an offset record, stamping `last_update_time`. Records with
    /// missing required fields are silently dropped.
    async fn save_offset(&self, record: OffsetRecord) -> Result<()>;

    async fn get_offset(&self, task_id: &str, instance_id: &str) -> Result<Option<OffsetRecord>>;

    async fn delete_offset(&self, task_id: &str, instance_id: &str) -> Result<()>;

    async fn list_offsets(&self) -> Result<Vec<OffsetRecord>>;

    async fn store_task(&self, task: &TaskProfile) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskProfile>>;
}

/// Key of an instance profile record.
pub fn instance_key(task_id: &str, instance_id: &str) -> String {
    format!("instance:{}:{}", task_id, instance_id)
}

/// Prefix selecting every instance of one task.
pub fn instance_prefix(task_id: &str) -> String {
    format!("instance:{}:", task_id)
}

/// Key of an offset record.
pub fn offset_key(task_id: &str, instance_id: &str) -> String {
    format!("offset:{}_{}", task_id, instance_id)
}

/// Key of a task profile record.
pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}
