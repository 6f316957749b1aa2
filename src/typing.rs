//! Typing presence
//!
//! Tracks which usernames are currently typing. Membership changes only
//! on an explicit signal; nothing expires on its own.

use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct TypingAggregator {
    typing: BTreeSet<String>,
}

impl TypingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user's typing flag; returns true if the set changed
    pub fn set_typing(&mut self, username: &str, is_typing: bool) -> bool {
        if is_typing {
            self.typing.insert(username.to_string())
        } else {
            self.typing.remove(username)
        }
    }

    /// Currently typing usernames, sorted
    pub fn snapshot(&self) -> Vec<String> {
        self.typing.iter().cloned().collect()
    }
}
