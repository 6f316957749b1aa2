//! Basic type definitions for the chat relay
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based connection identifier
//! - `MessageId`: router-assigned durable message id
//! - `RoomName`: validated broadcast room name
//! - `UserHandle`: a connection bound to a durable username
//! - `RecipientRef`: how a private message names its recipient

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Maximum username length in characters
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum room name length in characters
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4 assigned at handshake. A connection is ephemeral;
/// the durable identity is the username it binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client ID from its string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable message identifier
///
/// Serialized as a plain JSON number. Ids sort in the order the router
/// committed the messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly increasing message id source
///
/// Each id is `max(previous + 1, now in milliseconds)`, so ids stay unique
/// within the process and keep increasing across restarts as long as the
/// wall clock does.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: u64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id
    pub fn next_id(&mut self) -> MessageId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last = now.max(self.last + 1);
        MessageId(self.last)
    }
}

/// Broadcast room name
///
/// Trimmed, non-empty, at most `MAX_ROOM_NAME_LEN` characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomName(pub String);

impl RoomName {
    /// Validate and normalize a room name from user input
    pub fn parse(name: &str) -> Result<Self, AppError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(AppError::InvalidRoom(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate and normalize a username from user input
pub fn parse_username(username: &str) -> Result<String, AppError> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err(AppError::InvalidUsername(username.to_string()));
    }
    Ok(username.to_string())
}

/// A live connection bound to a durable identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserHandle {
    pub client_id: ClientId,
    pub username: String,
}

impl UserHandle {
    pub fn new(client_id: ClientId, username: impl Into<String>) -> Self {
        Self {
            client_id,
            username: username.into(),
        }
    }
}

/// Recipient reference carried by a private message
///
/// `to` is usually the recipient's connection id as last seen by the
/// sender; it may be stale after a reconnect, in which case the username
/// is used instead. A `to` that is not a connection id is taken as a
/// username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRef {
    /// The reference exactly as the sender supplied it
    pub raw: String,
    pub client_id: Option<ClientId>,
    pub username: Option<String>,
}

impl RecipientRef {
    pub fn new(to: String, to_username: Option<String>) -> Self {
        let to_username = to_username
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        match ClientId::parse(&to) {
            Some(client_id) => Self {
                raw: to,
                client_id: Some(client_id),
                username: to_username,
            },
            None => {
                let username = to_username.or_else(|| {
                    let name = to.trim();
                    (!name.is_empty()).then(|| name.to_string())
                });
                Self {
                    raw: to,
                    client_id: None,
                    username,
                }
            }
        }
    }
}
