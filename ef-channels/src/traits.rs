use crate::types::ReplyPayload;
use anyhow::Result;
use async_trait::async_trait;

/// A live connection payloads can be pushed to.
///
/// Channels are ephemeral: the registry binds identities to them and drops
/// the binding on disconnect. `id` is unique per connection so a stale
/// binding can be matched back to the channel that owned it.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Unique id for this connection (not the user identity).
    fn id(&self) -> &str;

    async fn send(&self, payload: &ReplyPayload) -> Result<()>;
}
