//! Client struct definition
//!
//! Represents a live connection with its optional bound identity and
//! outbound communication channel.

use std::collections::{HashSet, VecDeque};

use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{ClientId, UserHandle};

/// Connected client information
///
/// Holds all state related to a live connection: its ID, the username it
/// is bound to (if any), the outbound channel, and the tempIds of its
/// most recent sends.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Bound username (None before `user_join`)
    pub username: Option<String>,
    /// Server → Client message channel
    pub sender: mpsc::Sender<ServerMessage>,
    /// tempIds of the last `temp_id_window` sends, oldest first
    temp_ids: HashSet<String>,
    temp_id_order: VecDeque<String>,
    temp_id_window: usize,
}

impl Client {
    /// Create a new unbound client with the given ID and sender channel
    ///
    /// Duplicate tempIds are detected among the last `temp_id_window` sends.
    pub fn new(id: ClientId, sender: mpsc::Sender<ServerMessage>, temp_id_window: usize) -> Self {
        Self {
            id,
            username: None,
            sender,
            temp_ids: HashSet::new(),
            temp_id_order: VecDeque::new(),
            temp_id_window: temp_id_window.max(1),
        }
    }

    /// Send a message to this client
    ///
    /// Returns an error if the channel is closed (client disconnected).
    pub async fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// The bound identity, if any
    pub fn handle(&self) -> Option<UserHandle> {
        self.username
            .as_ref()
            .map(|username| UserHandle::new(self.id, username.clone()))
    }

    /// Record a tempId; false if one of the recent sends already used it
    pub fn claim_temp_id(&mut self, temp_id: &str) -> bool {
        if !self.temp_ids.insert(temp_id.to_string()) {
            return false;
        }
        self.temp_id_order.push_back(temp_id.to_string());
        while self.temp_id_order.len() > self.temp_id_window {
            if let Some(oldest) = self.temp_id_order.pop_front() {
                self.temp_ids.remove(&oldest);
            }
        }
        true
    }
}
