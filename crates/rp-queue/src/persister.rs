use async_trait::async_trait;
use anyhow::Result;
use dashmap::DashMap;
use rp_common::DelayableMessage;

/// Storage for queued units so they survive a restart.
#[async_trait]
pub trait MessagePersister: Send + Sync {
    /// Returns false when the unit was intentionally not stored.
    async fn persist(&self, queue_id: &str, unit: &DelayableMessage) -> Result<bool>;
    async fn fetch_all(&self, queue_id: &str) -> Result<Vec<DelayableMessage>>;
    async fn remove(&self, queue_id: &str, unit: &DelayableMessage) -> Result<()>;
}

pub struct NoOpMessagePersister;

#[async_trait]
impl MessagePersister for NoOpMessagePersister {
    async fn persist(&self, _queue_id: &str, _unit: &DelayableMessage) -> Result<bool> {
        Ok(false)
    }

    async fn fetch_all(&self, _queue_id: &str) -> Result<Vec<DelayableMessage>> {
        Ok(Vec::new())
    }

    async fn remove(&self, _queue_id: &str, _unit: &DelayableMessage) -> Result<()> {
        Ok(())
    }
}

/// Keeps units in memory, keyed by queue id and unit key. Useful for tests
/// and for handing queued work between router instances in one process.
#[derive(Default)]
pub struct InMemoryMessagePersister {
    units: DashMap<(String, String), DelayableMessage>,
}

impl InMemoryMessagePersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl MessagePersister for InMemoryMessagePersister {
    async fn persist(&self, queue_id: &str, unit: &DelayableMessage) -> Result<bool> {
        self.units.insert((queue_id.to_string(), unit.key()), unit.clone());
        Ok(true)
    }

    async fn fetch_all(&self, queue_id: &str) -> Result<Vec<DelayableMessage>> {
        let mut units: Vec<DelayableMessage> = self
            .units
            .iter()
            .filter(|entry| entry.key().0 == queue_id)
            .map(|entry| entry.value().clone())
            .collect();
        units.sort_by_key(|unit| unit.ready_at_ms());
        Ok(units)
    }

    async fn remove(&self, queue_id: &str, unit: &DelayableMessage) -> Result<()> {
        self.units.remove(&(queue_id.to_string(), unit.key()));
        Ok(())
    }
}
