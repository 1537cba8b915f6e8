use async_trait::async_trait;
use anyhow::Result;
use rp_common::ImmutableMessage;

/// Decides whether the recipient of a message may consume it.
#[async_trait]
pub trait AccessController: Send + Sync {
    async fn has_consumer_permission(&self, message: &ImmutableMessage) -> Result<bool>;
}
