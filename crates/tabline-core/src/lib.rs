//! Shared data model, wire types, error envelope, configuration, and the
//! session storage boundary for the whole control plane.

pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Envelope, ErrorCode, Result, RuntimeError};
pub use protocol::{event_names, BridgeErrorDetail, BridgeInvokeFrame, BridgeReplyFrame, InboundMessage, RuntimeEvent};
pub use store::{InMemoryStore, SessionStore};
pub use types::*;
