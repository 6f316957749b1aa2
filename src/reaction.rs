//! Reaction index
//!
//! Per message, per emoji, the set of usernames that reacted. Kept apart
//! from the message records so public and private messages share one
//! add/remove path.

use std::collections::HashMap;

use crate::message::ReactionAction;
use crate::record::ReactionSnapshot;
use crate::types::MessageId;

/// Apply one add or remove to a message's reactions; false if nothing changed
///
/// Emojis left without users are pruned.
pub fn apply_change(
    reactions: &mut ReactionSnapshot,
    action: ReactionAction,
    emoji: &str,
    username: &str,
) -> bool {
    match action {
        ReactionAction::Add => reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(username.to_string()),
        ReactionAction::Remove => {
            let Some(users) = reactions.get_mut(emoji) else {
                return false;
            };
            if !users.remove(username) {
                return false;
            }
            if users.is_empty() {
                reactions.remove(emoji);
            }
            true
        }
    }
}

/// Reactions of the messages the router still tracks
#[derive(Debug, Default)]
pub struct ReactionIndex {
    entries: HashMap<MessageId, ReactionSnapshot>,
}

impl ReactionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reaction; false if it was already there
    pub fn add(&mut self, message_id: MessageId, emoji: &str, username: &str) -> bool {
        self.apply(message_id, ReactionAction::Add, emoji, username)
    }

    /// Withdraw a reaction; false if there was nothing to remove
    pub fn remove(&mut self, message_id: MessageId, emoji: &str, username: &str) -> bool {
        self.apply(message_id, ReactionAction::Remove, emoji, username)
    }

    fn apply(&mut self, message_id: MessageId, action: ReactionAction, emoji: &str, username: &str) -> bool {
        let reactions = self.entries.entry(message_id).or_default();
        let changed = apply_change(reactions, action, emoji, username);
        if reactions.is_empty() {
            self.entries.remove(&message_id);
        }
        changed
    }

    pub fn snapshot(&self, message_id: MessageId) -> ReactionSnapshot {
        self.entries.get(&message_id).cloned().unwrap_or_default()
    }

    /// Drop every reaction on a message
    pub fn forget(&mut self, message_id: MessageId) {
        self.entries.remove(&message_id);
    }
}
