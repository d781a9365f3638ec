//! Identity-to-channel bindings and remote-control pairings.
//!
//! Bindings are ephemeral: last registration wins (reconnect), unregister
//! drops whatever identity a closed channel held, and delivery to an
//! identity with no live channel is a silent no-op.

use dashmap::DashMap;
use ef_channels::{DeliveryChannel, ReplyPayload, UserId};
use std::sync::Arc;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<UserId, Arc<dyn DeliveryChannel>>,
    /// secondary identity (e.g. a phone number) -> primary identity whose
    /// channel mirrors the secondary's conversation.
    pairs: DashMap<UserId, UserId>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` to `channel`, replacing any prior binding.
    pub fn register(&self, identity: UserId, channel: Arc<dyn DeliveryChannel>) {
        tracing::debug!(identity = %identity, connection_id = channel.id(), "channel registered");
        self.channels.insert(identity, channel);
    }

    /// Drops whichever identity is bound to this exact connection. Channel
    /// counts are small; a scan is fine.
    pub fn unregister_channel(&self, connection_id: &str) {
        let identity = self
            .channels
            .iter()
            .find(|entry| entry.value().id() == connection_id)
            .map(|entry| entry.key().clone());
        if let Some(identity) = identity {
            tracing::debug!(identity = %identity, connection_id, "channel unregistered");
            self.channels.remove(&identity);
        }
    }

    /// Mirrors turns on `secondary` to `primary`'s channel.
    pub fn pair(&self, secondary: UserId, primary: UserId) {
        tracing::info!(secondary = %secondary, primary = %primary, "remote control paired");
        self.pairs.insert(secondary, primary);
    }

    pub fn paired_primary_for(&self, secondary: &UserId) -> Option<UserId> {
        self.pairs.get(secondary).map(|p| p.clone())
    }

    /// Removes every pairing that mirrors into `identity`; called when that
    /// identity starts driving its own conversation again.
    pub fn unpair_all_for(&self, identity: &UserId) {
        self.pairs.retain(|_, primary| primary != identity);
    }

    pub fn bound_channels(&self) -> usize {
        self.channels.len()
    }

    /// Pushes a payload to the channel bound to `identity`. No live channel
    /// is a tolerated no-op, and a failed send is logged, not surfaced.
    pub async fn deliver(&self, identity: &UserId, payload: &ReplyPayload) {
        let Some(channel) = self.channels.get(identity).map(|c| c.clone()) else {
            tracing::debug!(identity = %identity, "no live channel; delivery dropped");
            return;
        };
        if let Err(e) = channel.send(payload).await {
            tracing::warn!(%e, identity = %identity, "channel delivery failed");
        }
    }
}
