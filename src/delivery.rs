//! Delivery tracking
//!
//! Holds the sends that are still waiting for an acknowledgment, keyed by
//! (connection, tempId), and a bounded ledger of recent messages with
//! their scope, delivery status and read flag.

use std::collections::{HashMap, VecDeque};

use crate::record::{DeliveryStatus, MessageScope};
use crate::types::{ClientId, MessageId};

/// A send waiting for its persistence result or deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    pub message_id: MessageId,
    /// Private message whose recipient could not be resolved
    pub recipient_missing: bool,
}

/// What the router remembers about a recent message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    pub scope: MessageScope,
    pub status: DeliveryStatus,
    pub read: bool,
}

/// Result of a read receipt against the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReceipt {
    /// Read flag flipped; carries the original sender's username
    Marked { sender: String },
    /// Already read before; carries the original sender's username
    AlreadyRead { sender: String },
    /// The reader is not the recipient of this message
    NotRecipient,
    /// Not a private message
    NotPrivate,
    /// Not in the ledger (evicted or never seen)
    Unknown,
}

#[derive(Debug)]
pub struct DeliveryTracker {
    pending: HashMap<(ClientId, String), PendingAck>,
    messages: HashMap<MessageId, TrackedMessage>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl DeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            messages: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Start tracking a send in `Sending` state
    ///
    /// Returns the ids evicted from the ledger to stay within capacity.
    pub fn track(
        &mut self,
        client_id: ClientId,
        temp_id: String,
        message_id: MessageId,
        scope: MessageScope,
        recipient_missing: bool,
    ) -> Vec<MessageId> {
        self.pending.insert(
            (client_id, temp_id),
            PendingAck {
                message_id,
                recipient_missing,
            },
        );
        self.messages.insert(
            message_id,
            TrackedMessage {
                scope,
                status: DeliveryStatus::Sending,
                read: false,
            },
        );
        self.order.push_back(message_id);

        let mut evicted = Vec::new();
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.messages.remove(&old);
                evicted.push(old);
            }
        }
        evicted
    }

    /// Remove a pending send; each (connection, tempId) settles once
    pub fn take_pending(&mut self, client_id: ClientId, temp_id: &str) -> Option<PendingAck> {
        self.pending.remove(&(client_id, temp_id.to_string()))
    }

    /// Move a message out of `Sending`; terminal states never change
    pub fn finish(&mut self, message_id: MessageId, status: DeliveryStatus) -> bool {
        match self.messages.get_mut(&message_id) {
            Some(tracked) if !tracked.status.is_terminal() => {
                tracked.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn scope(&self, message_id: MessageId) -> Option<&MessageScope> {
        self.messages.get(&message_id).map(|m| &m.scope)
    }

    /// Apply a read receipt from `reader`
    pub fn mark_read(&mut self, message_id: MessageId, reader: &str) -> ReadReceipt {
        let Some(tracked) = self.messages.get_mut(&message_id) else {
            return ReadReceipt::Unknown;
        };
        let MessageScope::Private { sender, recipient } = &tracked.scope else {
            return ReadReceipt::NotPrivate;
        };
        if recipient.as_deref() != Some(reader) {
            return ReadReceipt::NotRecipient;
        }

        let sender = sender.clone();
        if tracked.read {
            ReadReceipt::AlreadyRead { sender }
        } else {
            tracked.read = true;
            ReadReceipt::Marked { sender }
        }
    }
}
