use ef_stores::{EventItem, RecentSearch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::traits::DeliveryChannel;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(Token);

/// What a connected client sent.
#[derive(Debug, Clone)]
pub enum InboundKind {
    /// A chat turn.
    Message { text: String },
    /// Request to mirror the conversation of `phone` onto this channel.
    Remote { phone: String },
    /// The socket closed; the binding for this channel should be dropped.
    Disconnected,
}

/// One inbound frame plus the live channel it arrived on.
#[derive(Clone)]
pub struct InboundEvent {
    pub token: Token,
    pub kind: InboundKind,
    pub channel: Arc<dyn DeliveryChannel>,
}

impl fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundEvent")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("channel_id", &self.channel.id())
            .finish()
    }
}

/// Everything the core can say back to a client, over any transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyPayload {
    /// Plain text reply.
    Msg {
        text: String,
        #[serde(default)]
        username: Option<String>,
    },
    /// Search results with mappable points and a shareable URL.
    Map {
        text: String,
        #[serde(default)]
        username: Option<String>,
        points: Vec<EventItem>,
        url: String,
    },
    /// The user's recent searches, for selection by index.
    Searches {
        text: String,
        #[serde(default)]
        username: Option<String>,
        searches: Vec<RecentSearch>,
    },
    /// Mirrored input from a remote-controlled conversation.
    Input {
        text: String,
        #[serde(default)]
        username: Option<String>,
    },
    /// Keepalive echo.
    Ping,
}

impl ReplyPayload {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Msg { text, .. }
            | Self::Map { text, .. }
            | Self::Searches { text, .. }
            | Self::Input { text, .. } => Some(text),
            Self::Ping => None,
        }
    }
}
