//! PostgreSQL wire protocol (pure, sync).
//!
//! No async, no I/O, no tokio — just bytes in, messages out. The async
//! driver layer sits on top.

pub mod auth;
pub mod encoder;
pub mod wire;

pub use auth::ScramClient;
pub use encoder::{FrontendEncoder, MAX_PARAMETERS, PROTOCOL_VERSION};
pub use wire::{
    BackendMessage, CommandTag, FieldDescription, Notification, TransactionStatus,
};
