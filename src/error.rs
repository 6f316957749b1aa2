//! Error types for the chat relay
//!
//! Defines application-level errors, message send errors and errors
//! reported by the external stores. Uses thiserror for ergonomic error
//! definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (send error message to client).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Connection is not registered (already disconnected)
    #[error("Unknown connection: {0}")]
    UnknownConnection(crate::types::ClientId),

    /// Username is required but not set
    #[error("Username required")]
    UsernameRequired,

    /// Username is empty or too long
    #[error("Invalid username: '{0}'")]
    InvalidUsername(String),

    /// Username is already bound to another live connection
    #[error("Username '{0}' is already connected")]
    IdentityConflict(String),

    /// Room name is empty or too long
    #[error("Invalid room name: '{0}'")]
    InvalidRoom(String),

    /// Sending into a room the client is not a member of
    #[error("Not in room: {0}")]
    NotInRoom(String),

    /// Message has neither text nor image
    #[error("Message is empty")]
    EmptyMessage,

    /// Reaction emoji is empty
    #[error("Reaction is empty")]
    EmptyReaction,

    /// tempId already used by this connection
    #[error("Duplicate tempId: {0}")]
    DuplicateTempId(String),

    /// Private message recipient has no live connection
    #[error("Recipient not connected")]
    RecipientUnreachable,

    /// History store write or query failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Errors reported by the history and identity stores
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record with this id was already saved
    #[error("duplicate message id {0}")]
    Duplicate(u64),

    /// No record with this id
    #[error("message {0} not found")]
    NotFound(u64),
}
