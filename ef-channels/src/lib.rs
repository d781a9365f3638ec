//! Delivery substrate: payload shapes, the delivery-channel seam, and the
//! browser WebSocket adapter.

mod traits;
mod types;
mod webchat;

pub use traits::DeliveryChannel;
pub use types::{InboundEvent, InboundKind, ReplyPayload, Token, UserId};
pub use webchat::WebChatAdapter;
