//! Chat message record
//!
//! The shape delivered to clients in `receive_message` / `private_message`
//! events and handed to the history store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageId, RoomName, UserHandle};

/// emoji -> usernames that reacted with it
pub type ReactionSnapshot = BTreeMap<String, BTreeSet<String>>;

/// Delivery state of a message as seen by its sender
///
/// `Delivered` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryStatus::Sending)
    }
}

/// Who a message was addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageScope {
    /// Broadcast to a room
    Room(RoomName),
    /// Direct message between two users
    Private {
        sender: String,
        recipient: Option<String>,
    },
}

/// A chat message, public or private
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub sender: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_username: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_private: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub reactions: ReactionSnapshot,
}

impl ChatMessage {
    /// Build a room message
    pub fn public(
        id: MessageId,
        sender: &UserHandle,
        room: &RoomName,
        message: String,
        image: Option<String>,
        temp_id: String,
    ) -> Self {
        Self {
            id,
            temp_id: Some(temp_id),
            sender: sender.username.clone(),
            sender_id: sender.client_id.to_string(),
            room: Some(room.0.clone()),
            to: None,
            to_username: None,
            message,
            image,
            timestamp: Utc::now(),
            is_private: false,
            read: false,
            reactions: ReactionSnapshot::new(),
        }
    }

    /// Build a direct message
    ///
    /// `to` is the recipient's connection id if one was resolved, otherwise
    /// the reference the sender supplied.
    pub fn private(
        id: MessageId,
        sender: &UserHandle,
        to: String,
        to_username: Option<String>,
        message: String,
        image: Option<String>,
        temp_id: String,
    ) -> Self {
        Self {
            id,
            temp_id: Some(temp_id),
            sender: sender.username.clone(),
            sender_id: sender.client_id.to_string(),
            room: None,
            to: Some(to),
            to_username,
            message,
            image,
            timestamp: Utc::now(),
            is_private: true,
            read: false,
            reactions: ReactionSnapshot::new(),
        }
    }

    pub fn scope(&self) -> MessageScope {
        match (&self.room, self.is_private) {
            (Some(room), false) => MessageScope::Room(RoomName(room.clone())),
            _ => MessageScope::Private {
                sender: self.sender.clone(),
                recipient: self.to_username.clone(),
            },
        }
    }
}
