//! HTTP client for the external NLU dialog service.
//!
//! The dialog service is treated as an opaque oracle: free text plus a
//! context blob go in, a new context blob plus output lines come back.

mod client;
mod error;
mod types;

pub use client::NluClient;
pub use error::{NluError, Result};
pub use types::{ConverseResponse, Entity, ACTION_KEY};
