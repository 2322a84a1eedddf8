//! Source and sink adapter contracts, and the registry that maps profile
//! tags onto concrete implementations.

use async_trait::async_trait;
use logship_common::types::{InstanceProfile, Message};
use logship_common::{Error, Result};
use std::collections::HashMap;

/// One readable data source, typically a tailed file.
///
/// `read` returning `None` means nothing is available right now;
/// `finished` means no more data will ever come; `exists` turns false once
/// the underlying file has been removed or rotated beyond recognition.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn init(&mut self, profile: &InstanceProfile) -> Result<()>;

    async fn read(&self) -> Result<Option<Message>>;

    async fn exists(&self) -> bool;

    async fn finished(&self) -> bool;

    async fn destroy(&self);
}

/// One message sink as offered to an instance.
///
/// `write` returns only once the message is accepted or the sink is shut
/// down; `finished` is true when no acknowledgements are outstanding.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    async fn init(&mut self, profile: &InstanceProfile) -> Result<()>;

    async fn write(&self, msg: Message);

    async fn finished(&self) -> bool;

    async fn destroy(&self);
}

type SourceFactory = Box<dyn Fn() -> Box<dyn SourceAdapter> + Send + Sync>;
type SinkFactory = Box<dyn Fn() -> Box<dyn SinkAdapter> + Send + Sync>;

/// Closed set of adapter constructors keyed by the profile's source/sink
/// tags. Unknown tags fail instance initialization explicitly.
#[derive(Default)]
pub struct AdapterRegistry {
    sources: HashMap<String, SourceFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn() -> Box<dyn SourceAdapter> + Send + Sync + 'static,
    {
        self.sources.insert(tag.to_string(), Box::new(factory));
    }

    pub fn register_sink<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn() -> Box<dyn SinkAdapter> + Send + Sync + 'static,
    {
        self.sinks.insert(tag.to_string(), Box::new(factory));
    }

    pub fn create_source(&self, tag: &str) -> Result<Box<dyn SourceAdapter>> {
        self.sources
            .get(tag)
            .map(|factory| factory())
            .ok_or_else(|| Error::InitFailure(format!("unknown source tag: {}", tag)))
    }

    pub fn create_sink(&self, tag: &str) -> Result<Box<dyn SinkAdapter>> {
        self.sinks
            .get(tag)
            .map(|factory| factory())
            .ok_or_else(|| Error::InitFailure(format!("unknown sink tag: {}", tag)))
    }
}
