//! External stores
//!
//! The router persists messages through `HistoryStore` and records
//! identities through `IdentityStore`. Both are traits so a database can
//! stand in for the in-memory implementations shipped here.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::message::ReactionAction;
use crate::reaction::apply_change;
use crate::record::{ChatMessage, ReactionSnapshot};
use crate::types::{ClientId, MessageId, RoomName};

/// Page size for room history when the client gives none
pub const DEFAULT_ROOM_PAGE: usize = 20;

/// Page size for private history when the client gives none
pub const DEFAULT_PRIVATE_PAGE: usize = 50;

/// Largest page a client may ask for
pub const MAX_PAGE: usize = 100;

/// Which messages a history query covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryFilter {
    /// Public messages of one room
    Room(RoomName),
    /// Private messages exchanged between two users, in either direction
    Conversation { user1: String, user2: String },
}

impl HistoryFilter {
    pub fn matches(&self, message: &ChatMessage) -> bool {
        match self {
            HistoryFilter::Room(room) => {
                !message.is_private && message.room.as_deref() == Some(room.as_str())
            }
            HistoryFilter::Conversation { user1, user2 } => {
                let to = message.to_username.as_deref();
                message.is_private
                    && ((message.sender == *user1 && to == Some(user2.as_str()))
                        || (message.sender == *user2 && to == Some(user1.as_str())))
            }
        }
    }
}

/// One page of a history query, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
    pub total: usize,
}

/// Durable message storage
pub trait HistoryStore: Send + Sync + 'static {
    /// Persist a new message
    fn save(&self, message: ChatMessage) -> impl Future<Output = Result<MessageId, StoreError>> + Send;

    /// Messages matching `filter`, oldest first, skipping `offset`
    fn find(
        &self,
        filter: HistoryFilter,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<HistoryPage, StoreError>> + Send;

    /// Replace the stored reactions of a message
    fn set_reactions(
        &self,
        id: MessageId,
        reactions: ReactionSnapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Apply one reaction change to a stored message
    ///
    /// Returns the updated message, or `None` if the change was a no-op.
    fn apply_reaction(
        &self,
        id: MessageId,
        action: ReactionAction,
        emoji: String,
        username: String,
    ) -> impl Future<Output = Result<Option<ChatMessage>, StoreError>> + Send;

    /// Flag a private message as read by `reader`
    ///
    /// Only the message's recipient may do so. Returns the sender's
    /// username, or `None` (leaving the message untouched) for anyone else.
    fn mark_read(
        &self,
        id: MessageId,
        reader: String,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;
}

/// Last connection seen for a username
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub username: String,
    pub client_id: ClientId,
}

/// Durable identity storage
pub trait IdentityStore: Send + Sync + 'static {
    /// Insert or update the connection last bound to `username`
    fn upsert(
        &self,
        username: String,
        client_id: ClientId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every identity ever bound, sorted by username
    fn list_all(&self) -> impl Future<Output = Result<Vec<IdentityRecord>, StoreError>> + Send;
}

/// History kept in process memory, ordered by message id
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryHistoryStore {
    pub(crate) async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub(crate) async fn get(&self, id: MessageId) -> Option<ChatMessage> {
        let messages = self.messages.read().await;
        messages
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|pos| messages[pos].clone())
    }
}

impl HistoryStore for MemoryHistoryStore {
    async fn save(&self, message: ChatMessage) -> Result<MessageId, StoreError> {
        let mut messages = self.messages.write().await;
        // ids are assigned in commit order, so id order is creation order
        match messages.binary_search_by_key(&message.id, |m| m.id) {
            Ok(_) => Err(StoreError::Duplicate(message.id.0)),
            Err(pos) => {
                let id = message.id;
                messages.insert(pos, message);
                Ok(id)
            }
        }
    }

    async fn find(
        &self,
        filter: HistoryFilter,
        offset: usize,
        limit: usize,
    ) -> Result<HistoryPage, StoreError> {
        let messages = self.messages.read().await;
        let matching: Vec<&ChatMessage> = messages.iter().filter(|m| filter.matches(m)).collect();
        let total = matching.len();
        let page: Vec<ChatMessage> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(HistoryPage {
            has_more: total > offset + page.len(),
            messages: page,
            total,
        })
    }

    async fn set_reactions(&self, id: MessageId, reactions: ReactionSnapshot) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let pos = messages
            .binary_search_by_key(&id, |m| m.id)
            .map_err(|_| StoreError::NotFound(id.0))?;
        messages[pos].reactions = reactions;
        Ok(())
    }

    async fn apply_reaction(
        &self,
        id: MessageId,
        action: ReactionAction,
        emoji: String,
        username: String,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let mut messages = self.messages.write().await;
        let pos = messages
            .binary_search_by_key(&id, |m| m.id)
            .map_err(|_| StoreError::NotFound(id.0))?;
        let message = &mut messages[pos];
        if !apply_change(&mut message.reactions, action, &emoji, &username) {
            return Ok(None);
        }
        Ok(Some(message.clone()))
    }

    async fn mark_read(&self, id: MessageId, reader: String) -> Result<Option<String>, StoreError> {
        let mut messages = self.messages.write().await;
        let pos = messages
            .binary_search_by_key(&id, |m| m.id)
            .map_err(|_| StoreError::NotFound(id.0))?;
        let message = &mut messages[pos];
        if !message.is_private || message.to_username.as_deref() != Some(reader.as_str()) {
            return Ok(None);
        }
        message.read = true;
        Ok(Some(message.sender.clone()))
    }
}

/// Identities kept in process memory
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    users: RwLock<BTreeMap<String, ClientId>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    async fn upsert(&self, username: String, client_id: ClientId) -> Result<(), StoreError> {
        self.users.write().await.insert(username, client_id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .map(|(username, client_id)| IdentityRecord {
                username: username.clone(),
                client_id: *client_id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserHandle;

    fn general() -> RoomName {
        RoomName("general".to_string())
    }

    fn public(id: u64, sender: &str, room: &RoomName) -> ChatMessage {
        ChatMessage::public(
            MessageId(id),
            &UserHandle::new(ClientId::new(), sender),
            room,
            format!("message {}", id),
            None,
            format!("t{}", id),
        )
    }

    fn private(id: u64, sender: &str, to: &str) -> ChatMessage {
        ChatMessage::private(
            MessageId(id),
            &UserHandle::new(ClientId::new(), sender),
            to.to_string(),
            Some(to.to_string()),
            format!("dm {}", id),
            None,
            format!("t{}", id),
        )
    }

    #[tokio::test]
    async fn test_save_rejects_duplicate_id() {
        let store = MemoryHistoryStore::new();
        assert_eq!(store.save(public(1, "Alice", &general())).await, Ok(MessageId(1)));
        assert_eq!(
            store.save(public(1, "Bob", &general())).await,
            Err(StoreError::Duplicate(1))
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_pages_are_contiguous_and_ordered() {
        let store = MemoryHistoryStore::new();
        // saved out of order, as concurrent persist tasks may do
        for id in (1..=45).rev() {
            store.save(public(id, "Alice", &general())).await.unwrap();
        }
        store.save(public(100, "Alice", &RoomName("other".to_string()))).await.unwrap();

        let filter = HistoryFilter::Room(general());
        let first = store.find(filter.clone(), 0, 20).await.unwrap();
        let second = store.find(filter.clone(), 20, 20).await.unwrap();
        let third = store.find(filter, 40, 20).await.unwrap();

        assert_eq!(first.total, 45);
        assert!(first.has_more && second.has_more && !third.has_more);
        assert_eq!(third.messages.len(), 5);

        let ids: Vec<u64> = first
            .messages
            .iter()
            .chain(&second.messages)
            .chain(&third.messages)
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, (1..=45).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_conversation_filter_is_symmetric() {
        let store = MemoryHistoryStore::new();
        store.save(private(1, "Alice", "Bob")).await.unwrap();
        store.save(private(2, "Bob", "Alice")).await.unwrap();
        store.save(private(3, "Alice", "Carol")).await.unwrap();
        store.save(public(4, "Alice", &general())).await.unwrap();

        let filter = HistoryFilter::Conversation {
            user1: "Bob".to_string(),
            user2: "Alice".to_string(),
        };
        let page = store.find(filter, 0, 50).await.unwrap();
        let ids: Vec<u64> = page.messages.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_offset_past_end() {
        let store = MemoryHistoryStore::new();
        store.save(public(1, "Alice", &general())).await.unwrap();
        let page = store.find(HistoryFilter::Room(general()), 10, 20).await.unwrap();
        assert!(page.messages.is_empty());
        assert_eq!(page.total, 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_updates_reactions_and_read() {
        let store = MemoryHistoryStore::new();
        store.save(private(1, "Alice", "Bob")).await.unwrap();

        let mut reactions = ReactionSnapshot::new();
        reactions.entry("👍".to_string()).or_default().insert("Bob".to_string());
        store.set_reactions(MessageId(1), reactions.clone()).await.unwrap();
        assert_eq!(
            store.mark_read(MessageId(1), "Bob".to_string()).await,
            Ok(Some("Alice".to_string()))
        );

        let stored = store.get(MessageId(1)).await.unwrap();
        assert_eq!(stored.reactions, reactions);
        assert!(stored.read);
        assert_eq!(
            store.mark_read(MessageId(2), "Bob".to_string()).await,
            Err(StoreError::NotFound(2))
        );
    }

    #[tokio::test]
    async fn test_only_the_recipient_marks_read() {
        let store = MemoryHistoryStore::new();
        store.save(private(1, "Alice", "Bob")).await.unwrap();
        store.save(public(2, "Alice", &general())).await.unwrap();

        assert_eq!(store.mark_read(MessageId(1), "Carol".to_string()).await, Ok(None));
        assert_eq!(store.mark_read(MessageId(1), "Alice".to_string()).await, Ok(None));
        assert_eq!(store.mark_read(MessageId(2), "Bob".to_string()).await, Ok(None));
        assert!(!store.get(MessageId(1)).await.unwrap().read);
        assert!(!store.get(MessageId(2)).await.unwrap().read);
    }

    #[tokio::test]
    async fn test_apply_reaction_to_stored_message() {
        let store = MemoryHistoryStore::new();
        store.save(public(1, "Alice", &general())).await.unwrap();

        let updated = store
            .apply_reaction(MessageId(1), ReactionAction::Add, "👍".to_string(), "Bob".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(updated.reactions["👍"].contains("Bob"));

        let repeat = store
            .apply_reaction(MessageId(1), ReactionAction::Add, "👍".to_string(), "Bob".to_string())
            .await;
        assert_eq!(repeat, Ok(None));

        let missing = store
            .apply_reaction(MessageId(9), ReactionAction::Add, "👍".to_string(), "Bob".to_string())
            .await;
        assert_eq!(missing, Err(StoreError::NotFound(9)));
    }

    #[tokio::test]
    async fn test_identity_upsert_keeps_latest() {
        let store = MemoryIdentityStore::new();
        let (first, second) = (ClientId::new(), ClientId::new());
        store.upsert("Bob".to_string(), first).await.unwrap();
        store.upsert("Alice".to_string(), first).await.unwrap();
        store.upsert("Bob".to_string(), second).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].username, "Alice");
        assert_eq!(all[1].client_id, second);
    }
}
