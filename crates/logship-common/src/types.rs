//! Core data model: messages flowing through an instance and the durable
//! profiles the supervisor keeps in the state store.

use crate::cycle::CycleUnit;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known message header keys.
pub mod header {
    /// Partitioning key used by the sink buffer to group messages.
    pub const STREAM_KEY: &str = "streamKey";
    /// Destination stream id, extracted from the body when absent.
    pub const STREAM_ID: &str = "streamId";
    /// Source offset of the message, an opaque string.
    pub const OFFSET: &str = "offset";
    /// Inode of the file the message was read from.
    pub const INODE: &str = "inode";
}

/// Whether a message carries data or marks the end of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    End,
}

/// A single unit of data read from a source and handed to a sink.
///
/// The `End` kind is a sentinel: sinks accept it without forwarding it
/// downstream.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl Message {
    pub fn new(body: Bytes, header: HashMap<String, String>) -> Self {
        Self {
            kind: MessageKind::Data,
            header,
            body,
        }
    }

    /// The end-of-source sentinel.
    pub fn end() -> Self {
        Self {
            kind: MessageKind::End,
            header: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.kind == MessageKind::End
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    /// Source offset carried in the header, empty when the source did not
    /// stamp one.
    pub fn offset(&self) -> &str {
        self.header_value(header::OFFSET).unwrap_or("")
    }
}

/// Lifecycle state of an instance as persisted in the state store.
///
/// `Default` is the only live state; `Finished` and `Delete` are terminal
/// and durable. `Fatal` is terminal in memory only and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Default,
    Finished,
    Delete,
    Fatal,
}

/// Profile of one instance (typically one file) within a task.
///
/// The identity fields are immutable once created by the task scheduler;
/// only `state` and `modify_time` change over the instance's life.
/// `(task_id, instance_id)` is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceProfile {
    pub task_id: String,
    pub instance_id: String,
    /// Tag resolving the source adapter in the registry.
    pub source_tag: String,
    /// Tag resolving the sink adapter in the registry.
    pub sink_tag: String,
    pub group_id: String,
    pub stream_id: String,
    /// Last modification time of the underlying file, epoch millis.
    pub file_update_time: i64,
    pub source_data_time: i64,
    pub sink_data_time: i64,
    pub inode: String,
    /// Byte sequence used by the stream-id extractor.
    pub field_splitter: String,
    #[serde(default)]
    pub extras: HashMap<String, String>,
    pub state: InstanceState,
    /// Epoch millis of the last state change.
    pub modify_time: i64,
}

impl InstanceProfile {
    pub fn set_state(&mut self, state: InstanceState, modify_time: i64) {
        self.state = state;
        self.modify_time = modify_time;
    }
}

/// Durable read position of one instance. Uniqueness key is
/// `(task_id, instance_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub task_id: String,
    pub instance_id: String,
    /// Opaque offset string produced by the source.
    pub offset: String,
    pub inode: String,
    pub last_update_time: i64,
}

impl OffsetRecord {
    pub fn new(task_id: String, instance_id: String, offset: String, inode: String) -> Self {
        Self {
            task_id,
            instance_id,
            offset,
            inode,
            last_update_time: 0,
        }
    }

    /// All fields the store requires before it will persist the record.
    pub fn is_complete(&self) -> bool {
        !self.task_id.is_empty() && !self.instance_id.is_empty() && !self.offset.is_empty()
    }
}

/// State of the owning task, consulted read-only by the expiry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Running,
    RetryFinish,
    Finished,
}

/// Profile of the task that owns a set of instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProfile {
    pub task_id: String,
    pub group_id: String,
    pub stream_id: String,
    pub cycle_unit: CycleUnit,
    /// Whether this task is a retry of an earlier run.
    pub retry: bool,
    pub state: TaskState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_message_is_sentinel() {
        let msg = Message::end();
        assert!(msg.is_end());
        assert!(msg.body.is_empty());
        assert_eq!(msg.offset(), "");
    }

    #[test]
    fn instance_state_serde_tokens() {
        assert_eq!(
            serde_json::to_string(&InstanceState::Default).unwrap(),
            "\"DEFAULT\""
        );
        let state: InstanceState = serde_json::from_str("\"FINISHED\"").unwrap();
        assert_eq!(state, InstanceState::Finished);
    }

    #[test]
    fn task_state_serde_tokens() {
        assert_eq!(
            serde_json::to_string(&TaskState::RetryFinish).unwrap(),
            "\"RETRY_FINISH\""
        );
    }

    #[test]
    fn offset_record_completeness() {
        let record = OffsetRecord::new("t1".into(), "i1".into(), "42".into(), "inode".into());
        assert!(record.is_complete());
        let record = OffsetRecord::new("t1".into(), "i1".into(), "".into(), "inode".into());
        assert!(!record.is_complete());
    }

    #[test]
    fn instance_profile_json_round_trip() {
        let profile = InstanceProfile {
            task_id: "task-1".into(),
            instance_id: "/data/log/a.log".into(),
            source_tag: "file".into(),
            sink_tag: "proxy".into(),
            group_id: "g1".into(),
            stream_id: "s1".into(),
            file_update_time: 1_700_000_000_000,
            source_data_time: 1_700_000_000_000,
            sink_data_time: 1_700_000_000_000,
            inode: "65021".into(),
            field_splitter: "|".into(),
            extras: HashMap::new(),
            state: InstanceState::Default,
            modify_time: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&profile).unwrap();
        let back: InstanceProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, profile.instance_id);
        assert_eq!(back.state, InstanceState::Default);
    }
}
