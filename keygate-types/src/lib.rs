//! Core type definitions for keygate.
//!
//! This crate defines the small, protocol-agnostic types shared by the
//! licensing client and the reference authority:
//! - Session identifiers (UUID v7) and authority-issued connection ids
//! - Opaque session tokens
//! - Unix timestamps and the clock abstraction used for countdowns

mod ids;
mod timestamp;

pub use ids::{ConnectionId, SessionId, SessionToken};
pub use timestamp::{Clock, ManualClock, SystemClock, UnixTimestamp};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid connection id: {0}")]
    InvalidConnectionId(String),
}
