//! Connection registry
//!
//! Maps live connections to zero-or-one durable username, and usernames
//! back to the connection currently holding them.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::client::Client;
use crate::config::DuplicateLoginPolicy;
use crate::error::AppError;
use crate::message::{ServerMessage, UserSummary};
use crate::types::{ClientId, RecipientRef, UserHandle};

/// Result of binding a username to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// The new binding
    pub handle: UserHandle,
    /// Older connection that lost the username under `Replace`
    pub replaced: Option<UserHandle>,
    /// Username this connection was bound to before, if it changed
    pub previous_username: Option<String>,
}

/// Live connections and their identities
#[derive(Debug)]
pub struct ConnectionRegistry {
    clients: HashMap<ClientId, Client>,
    by_username: HashMap<String, ClientId>,
    policy: DuplicateLoginPolicy,
    /// Recent sends per connection checked for tempId reuse
    temp_id_window: usize,
}

impl ConnectionRegistry {
    pub fn new(policy: DuplicateLoginPolicy, temp_id_window: usize) -> Self {
        Self {
            clients: HashMap::new(),
            by_username: HashMap::new(),
            policy,
            temp_id_window,
        }
    }

    /// Add an unbound connection
    pub fn register(&mut self, client_id: ClientId, sender: mpsc::Sender<ServerMessage>) {
        self.clients.insert(client_id, Client::new(client_id, sender, self.temp_id_window));
    }

    /// Drop a connection entirely, releasing its username
    pub fn remove(&mut self, client_id: ClientId) -> Option<Client> {
        self.unbind(client_id);
        self.clients.remove(&client_id)
    }

    /// Bind `username` to a connection
    ///
    /// Rebinding the same name is a no-op. A name held by another live
    /// connection is refused or taken over depending on the policy.
    pub fn bind(&mut self, client_id: ClientId, username: String) -> Result<BindOutcome, AppError> {
        if !self.clients.contains_key(&client_id) {
            return Err(AppError::UnknownConnection(client_id));
        }

        let mut replaced = None;
        if let Some(&holder) = self.by_username.get(&username) {
            if holder == client_id {
                return Ok(BindOutcome {
                    handle: UserHandle::new(client_id, username),
                    replaced: None,
                    previous_username: None,
                });
            }
            match self.policy {
                DuplicateLoginPolicy::Reject => return Err(AppError::IdentityConflict(username)),
                DuplicateLoginPolicy::Replace => {
                    debug!("Connection {} takes '{}' over from {}", client_id, username, holder);
                    replaced = self.unbind(holder);
                }
            }
        }

        let previous_username = self.unbind(client_id).map(|h| h.username);

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.username = Some(username.clone());
        }
        self.by_username.insert(username.clone(), client_id);

        Ok(BindOutcome {
            handle: UserHandle::new(client_id, username),
            replaced,
            previous_username,
        })
    }

    /// Release the username bound to a connection, keeping the connection
    pub fn unbind(&mut self, client_id: ClientId) -> Option<UserHandle> {
        let client = self.clients.get_mut(&client_id)?;
        let username = client.username.take()?;
        if self.by_username.get(&username) == Some(&client_id) {
            self.by_username.remove(&username);
        }
        Some(UserHandle::new(client_id, username))
    }

    pub fn resolve(&self, client_id: ClientId) -> Option<UserHandle> {
        self.clients.get(&client_id).and_then(Client::handle)
    }

    pub fn resolve_by_username(&self, username: &str) -> Option<ClientId> {
        self.by_username.get(username).copied()
    }

    /// Find the live connection a private message should go to
    ///
    /// The connection id wins if it is still live and bound; otherwise
    /// the username is looked up.
    pub fn resolve_recipient(&self, recipient: &RecipientRef) -> Option<UserHandle> {
        recipient
            .client_id
            .and_then(|id| self.resolve(id))
            .or_else(|| {
                let username = recipient.username.as_deref()?;
                let id = self.resolve_by_username(username)?;
                self.resolve(id)
            })
    }

    pub fn client(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn client_mut(&mut self, client_id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// All live connections, bound or not
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Bound users sorted by username
    pub fn online_users(&self) -> Vec<UserSummary> {
        let mut users: Vec<UserSummary> = self
            .by_username
            .iter()
            .map(|(username, id)| UserSummary {
                username: username.clone(),
                id: id.to_string(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(policy: DuplicateLoginPolicy, n: usize) -> (ConnectionRegistry, Vec<ClientId>) {
        let mut registry = ConnectionRegistry::new(policy, 16);
        let ids: Vec<ClientId> = (0..n).map(|_| ClientId::new()).collect();
        for id in &ids {
            let (tx, _rx) = mpsc::channel(1);
            registry.register(*id, tx);
        }
        (registry, ids)
    }

    #[test]
    fn test_register_is_unbound() {
        let (registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(ids[0]).is_none());
    }

    #[test]
    fn test_bind_and_resolve() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 1);
        let outcome = registry.bind(ids[0], "Alice".to_string()).unwrap();

        assert_eq!(outcome.handle, UserHandle::new(ids[0], "Alice"));
        assert!(outcome.replaced.is_none());
        assert_eq!(registry.resolve(ids[0]), Some(outcome.handle));
        assert_eq!(registry.resolve_by_username("Alice"), Some(ids[0]));
    }

    #[test]
    fn test_bind_unknown_connection() {
        let (mut registry, _) = registry_with(DuplicateLoginPolicy::Reject, 0);
        let result = registry.bind(ClientId::new(), "Alice".to_string());
        assert!(matches!(result, Err(AppError::UnknownConnection(_))));
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 2);
        registry.bind(ids[0], "Alice".to_string()).unwrap();

        let result = registry.bind(ids[1], "Alice".to_string());
        assert!(matches!(result, Err(AppError::IdentityConflict(name)) if name == "Alice"));
        assert_eq!(registry.resolve_by_username("Alice"), Some(ids[0]));
        assert!(registry.resolve(ids[1]).is_none());
    }

    #[test]
    fn test_duplicate_binding_replaces() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Replace, 2);
        registry.bind(ids[0], "Alice".to_string()).unwrap();

        let outcome = registry.bind(ids[1], "Alice".to_string()).unwrap();
        assert_eq!(outcome.replaced, Some(UserHandle::new(ids[0], "Alice")));
        assert_eq!(registry.resolve_by_username("Alice"), Some(ids[1]));
        assert!(registry.resolve(ids[0]).is_none());
    }

    #[test]
    fn test_rebind_same_name_is_noop() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 1);
        registry.bind(ids[0], "Alice".to_string()).unwrap();
        let outcome = registry.bind(ids[0], "Alice".to_string()).unwrap();
        assert!(outcome.previous_username.is_none());
        assert_eq!(registry.online_users().len(), 1);
    }

    #[test]
    fn test_rename_releases_old_name() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 1);
        registry.bind(ids[0], "Alice".to_string()).unwrap();
        let outcome = registry.bind(ids[0], "Alicia".to_string()).unwrap();

        assert_eq!(outcome.previous_username.as_deref(), Some("Alice"));
        assert!(registry.resolve_by_username("Alice").is_none());
        assert_eq!(registry.resolve_by_username("Alicia"), Some(ids[0]));
    }

    #[test]
    fn test_remove_returns_binding_once() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 1);
        registry.bind(ids[0], "Alice".to_string()).unwrap();

        assert_eq!(registry.unbind(ids[0]), Some(UserHandle::new(ids[0], "Alice")));
        assert_eq!(registry.unbind(ids[0]), None);
        assert!(registry.remove(ids[0]).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_recipient_falls_back_to_username() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 1);
        registry.bind(ids[0], "Bob".to_string()).unwrap();

        let stale = ClientId::new();
        let by_stale_id = RecipientRef::new(stale.to_string(), Some("Bob".to_string()));
        assert_eq!(
            registry.resolve_recipient(&by_stale_id),
            Some(UserHandle::new(ids[0], "Bob"))
        );

        let by_live_id = RecipientRef::new(ids[0].to_string(), None);
        assert_eq!(registry.resolve_recipient(&by_live_id).map(|h| h.client_id), Some(ids[0]));

        let nobody = RecipientRef::new("Carol".to_string(), None);
        assert!(registry.resolve_recipient(&nobody).is_none());
    }

    #[test]
    fn test_online_users_sorted() {
        let (mut registry, ids) = registry_with(DuplicateLoginPolicy::Reject, 3);
        registry.bind(ids[0], "Carol".to_string()).unwrap();
        registry.bind(ids[1], "Alice".to_string()).unwrap();

        let names: Vec<String> = registry.online_users().into_iter().map(|u| u.username).collect();
        assert_eq!(names, vec!["Alice", "Carol"]);
    }
}
