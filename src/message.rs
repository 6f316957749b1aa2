//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization. Event names are
//! snake_case, payload fields are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::record::{ChatMessage, ReactionSnapshot};
use crate::types::MessageId;

/// Client → Server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind a username to this connection
    UserJoin { username: String },
    /// Move to another broadcast room
    JoinRoom { room: String },
    /// Send a message to a room (defaults to the current room)
    SendMessage {
        #[serde(default)]
        message: String,
        room: Option<String>,
        image: Option<String>,
        temp_id: String,
    },
    /// Send a direct message
    PrivateMessage {
        to: String,
        to_username: Option<String>,
        #[serde(default)]
        message: String,
        image: Option<String>,
        temp_id: String,
    },
    /// Tell the original sender a private message was read
    ///
    /// The sender is looked up from the message itself; a `recipientId`
    /// sent by older clients is ignored.
    PrivateMessageRead { message_id: MessageId },
    /// Typing indicator on/off
    Typing { is_typing: bool },
    /// Add a reaction
    MessageReaction(ReactionTarget),
    /// Remove a reaction
    RemoveReaction(ReactionTarget),
    /// Page through a room's history
    FetchHistory {
        room: Option<String>,
        offset: Option<usize>,
        limit: Option<usize>,
    },
    /// Page through the conversation with another user
    FetchPrivateHistory {
        with: String,
        offset: Option<usize>,
        limit: Option<usize>,
    },
    /// Ask for the room list
    ListRooms,
    /// Ask for every known identity
    ListUsers,
}

/// Which message a reaction applies to
///
/// Where the reaction is announced follows from the message, so scope
/// hints (`room`, `isPrivate`, `recipientId`) are not read.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionTarget {
    pub message_id: MessageId,
    pub reaction: String,
}

/// Whether a reaction event adds or removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Online user as shown in presence lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub username: String,
    pub id: String,
}

/// Identity known to the identity store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownUser {
    pub username: String,
    pub id: String,
    pub online: bool,
}

/// Server → Client message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Connection successful, client ID issued
    Connected { client_id: String },
    /// Rooms in creation order
    RoomList { rooms: Vec<String> },
    /// Everyone currently bound to a username
    UserList { users: Vec<UserSummary> },
    /// A user bound a username
    UserJoined { username: String, id: String },
    /// A user disconnected or was replaced
    UserLeft { username: String, id: String },
    /// Someone entered the room
    UserJoinedRoom { username: String, room: String },
    /// Room message
    ReceiveMessage(ChatMessage),
    /// Direct message (to the recipient, echoed to the sender)
    PrivateMessage(ChatMessage),
    /// Delivery acknowledgment for a send, correlated by tempId
    Ack {
        delivered: bool,
        id: MessageId,
        temp_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// No acknowledgment within the deadline
    DeliveryFailed {
        id: MessageId,
        temp_id: String,
        reason: String,
    },
    /// A private message was read by its recipient
    PrivateMessageRead { message_id: MessageId, reader_id: String },
    /// Usernames currently typing
    TypingUsers { users: Vec<String> },
    /// A reaction was added or removed
    MessageReaction {
        message_id: MessageId,
        reaction: String,
        user_id: String,
        username: String,
        action: ReactionAction,
        timestamp: DateTime<Utc>,
        reactions: ReactionSnapshot,
    },
    /// One page of history
    History {
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        with: Option<String>,
        offset: usize,
        messages: Vec<ChatMessage>,
        has_more: bool,
        total: usize,
    },
    /// Every identity the identity store knows
    KnownUsers { users: Vec<KnownUser> },
    /// Another connection bound this username; this one is now unbound
    SessionReplaced,
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Attempted action without binding a username
    UsernameRequired,
    /// Username empty or too long
    InvalidUsername,
    /// Username already bound elsewhere
    IdentityConflict,
    /// Room name empty or too long
    InvalidRoom,
    /// Sending into a room the client has not joined
    NotInRoom,
    /// Message without text or image
    EmptyMessage,
    /// Reaction without an emoji
    EmptyReaction,
    /// tempId reused on this connection
    DuplicateTempId,
    /// History store failed
    PersistenceFailed,
    /// Invalid message format
    InvalidMessage,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let code = match &err {
            AppError::UsernameRequired => ErrorCode::UsernameRequired,
            AppError::InvalidUsername(_) => ErrorCode::InvalidUsername,
            AppError::IdentityConflict(_) => ErrorCode::IdentityConflict,
            AppError::InvalidRoom(_) => ErrorCode::InvalidRoom,
            AppError::NotInRoom(_) => ErrorCode::NotInRoom,
            AppError::EmptyMessage => ErrorCode::EmptyMessage,
            AppError::EmptyReaction => ErrorCode::EmptyReaction,
            AppError::DuplicateTempId(_) => ErrorCode::DuplicateTempId,
            AppError::Persistence(_) => ErrorCode::PersistenceFailed,
            AppError::Json(e) => {
                return ServerMessage::Error {
                    code: ErrorCode::InvalidMessage,
                    message: format!("Invalid message format: {}", e),
                };
            }
            // Fatal errors are not typically converted (connection closes)
            _ => {
                return ServerMessage::Error {
                    code: ErrorCode::InvalidMessage,
                    message: "Internal error".to_string(),
                };
            }
        };
        ServerMessage::Error {
            code,
            message: err.to_string(),
        }
    }
}
