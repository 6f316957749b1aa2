//! MessageRouter actor implementation
//!
//! The central actor that owns every shared table: connections, rooms,
//! typing state, reactions and pending deliveries. Connection handlers
//! and background tasks talk to it only through `ServerCommand`s, so each
//! table has a single writer and room messages are committed in the
//! order the actor processes them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::delivery::{DeliveryTracker, ReadReceipt};
use crate::error::{AppError, StoreError};
use crate::message::{KnownUser, ReactionAction, ReactionTarget, ServerMessage};
use crate::reaction::ReactionIndex;
use crate::record::{ChatMessage, DeliveryStatus, MessageScope, ReactionSnapshot};
use crate::registry::ConnectionRegistry;
use crate::room::RoomManager;
use crate::store::{
    HistoryFilter, HistoryStore, IdentityStore, DEFAULT_PRIVATE_PAGE, DEFAULT_ROOM_PAGE, MAX_PAGE,
};
use crate::typing::TypingAggregator;
use crate::types::{
    parse_username, ClientId, MessageId, MessageIdGenerator, RecipientRef, RoomName, UserHandle,
};

/// Commands sent to the MessageRouter actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New connection after handshake
    Connect {
        client_id: ClientId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// Connection closed
    Disconnect { client_id: ClientId },
    /// Bind a username
    UserJoin { client_id: ClientId, username: String },
    /// Move to another room
    JoinRoom { client_id: ClientId, room: String },
    /// Room message
    SendMessage {
        client_id: ClientId,
        room: Option<String>,
        message: String,
        image: Option<String>,
        temp_id: String,
    },
    /// Direct message
    PrivateMessage {
        client_id: ClientId,
        recipient: RecipientRef,
        message: String,
        image: Option<String>,
        temp_id: String,
    },
    /// Read receipt for a direct message
    PrivateMessageRead {
        client_id: ClientId,
        message_id: MessageId,
    },
    /// Typing indicator
    Typing { client_id: ClientId, is_typing: bool },
    /// Add or remove a reaction
    Reaction {
        client_id: ClientId,
        action: ReactionAction,
        target: ReactionTarget,
    },
    /// Room history page
    FetchHistory {
        client_id: ClientId,
        room: Option<String>,
        offset: Option<usize>,
        limit: Option<usize>,
    },
    /// Private conversation history page
    FetchPrivateHistory {
        client_id: ClientId,
        with: String,
        offset: Option<usize>,
        limit: Option<usize>,
    },
    /// Room list request
    ListRooms { client_id: ClientId },
    /// Known identities request
    ListUsers { client_id: ClientId },
    /// A history store write finished
    Persisted {
        client_id: ClientId,
        temp_id: String,
        message_id: MessageId,
        result: Result<MessageId, StoreError>,
    },
    /// A send's acknowledgment deadline passed
    AckDeadline { client_id: ClientId, temp_id: String },
    /// The history store accepted a read receipt the ledger could not check
    ReadConfirmed {
        client_id: ClientId,
        message_id: MessageId,
        sender: String,
    },
    /// The history store applied a reaction to a message the ledger no
    /// longer holds
    ReactionStored {
        client_id: ClientId,
        action: ReactionAction,
        reaction: String,
        message: ChatMessage,
    },
}

impl ServerCommand {
    /// The connection this command concerns
    pub fn client_id(&self) -> ClientId {
        match self {
            ServerCommand::Connect { client_id, .. }
            | ServerCommand::Disconnect { client_id }
            | ServerCommand::UserJoin { client_id, .. }
            | ServerCommand::JoinRoom { client_id, .. }
            | ServerCommand::SendMessage { client_id, .. }
            | ServerCommand::PrivateMessage { client_id, .. }
            | ServerCommand::PrivateMessageRead { client_id, .. }
            | ServerCommand::Typing { client_id, .. }
            | ServerCommand::Reaction { client_id, .. }
            | ServerCommand::FetchHistory { client_id, .. }
            | ServerCommand::FetchPrivateHistory { client_id, .. }
            | ServerCommand::ListRooms { client_id }
            | ServerCommand::ListUsers { client_id }
            | ServerCommand::Persisted { client_id, .. }
            | ServerCommand::AckDeadline { client_id, .. }
            | ServerCommand::ReadConfirmed { client_id, .. }
            | ServerCommand::ReactionStored { client_id, .. } => *client_id,
        }
    }
}

/// The main MessageRouter actor
pub struct MessageRouter<H, I> {
    config: ServerConfig,
    registry: ConnectionRegistry,
    rooms: RoomManager,
    typing: TypingAggregator,
    reactions: ReactionIndex,
    deliveries: DeliveryTracker,
    ids: MessageIdGenerator,
    history: Arc<H>,
    identities: Arc<I>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    /// For background tasks to report back; weak so the loop still ends
    /// once every connection handler has dropped its sender
    commands: mpsc::WeakSender<ServerCommand>,
}

impl<H: HistoryStore, I: IdentityStore> MessageRouter<H, I> {
    /// Create a router and the sender connection handlers use to reach it
    pub fn new(
        config: ServerConfig,
        history: Arc<H>,
        identities: Arc<I>,
    ) -> (Self, mpsc::Sender<ServerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_buffer);
        let router = Self {
            registry: ConnectionRegistry::new(config.duplicate_login, config.message_cache),
            rooms: RoomManager::new(config.default_room.clone()),
            typing: TypingAggregator::new(),
            reactions: ReactionIndex::new(),
            deliveries: DeliveryTracker::new(config.message_cache),
            ids: MessageIdGenerator::new(),
            history,
            identities,
            receiver: cmd_rx,
            commands: cmd_tx.downgrade(),
            config,
        };
        (router, cmd_tx)
    }

    /// Run the MessageRouter event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("MessageRouter started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!("MessageRouter shutting down");
    }

    /// Process a single command
    ///
    /// Business errors go back to the originating connection only.
    async fn handle_command(&mut self, cmd: ServerCommand) {
        let client_id = cmd.client_id();
        if let Err(err) = self.dispatch(cmd).await {
            debug!("Rejected command from {}: {}", client_id, err);
            self.send_to(client_id, err.into()).await;
        }
    }

    async fn dispatch(&mut self, cmd: ServerCommand) -> Result<(), AppError> {
        match cmd {
            ServerCommand::Connect { client_id, sender } => {
                self.handle_connect(client_id, sender).await;
            }
            ServerCommand::Disconnect { client_id } => {
                self.handle_disconnect(client_id).await;
            }
            ServerCommand::UserJoin { client_id, username } => {
                self.handle_user_join(client_id, username).await?;
            }
            ServerCommand::JoinRoom { client_id, room } => {
                self.handle_join_room(client_id, room).await?;
            }
            ServerCommand::SendMessage {
                client_id,
                room,
                message,
                image,
                temp_id,
            } => {
                self.handle_send_message(client_id, room, message, image, temp_id)
                    .await?;
            }
            ServerCommand::PrivateMessage {
                client_id,
                recipient,
                message,
                image,
                temp_id,
            } => {
                self.handle_private_message(client_id, recipient, message, image, temp_id)
                    .await?;
            }
            ServerCommand::PrivateMessageRead {
                client_id,
                message_id,
            } => {
                self.handle_read_receipt(client_id, message_id).await?;
            }
            ServerCommand::Typing { client_id, is_typing } => {
                self.handle_typing(client_id, is_typing).await;
            }
            ServerCommand::Reaction {
                client_id,
                action,
                target,
            } => {
                self.handle_reaction(client_id, action, target).await?;
            }
            ServerCommand::FetchHistory {
                client_id,
                room,
                offset,
                limit,
            } => {
                let room = match room {
                    Some(room) => RoomName::parse(&room)?,
                    None => self
                        .rooms
                        .current_room(client_id)
                        .cloned()
                        .unwrap_or_else(|| self.config.default_room.clone()),
                };
                let limit = page_limit(limit, DEFAULT_ROOM_PAGE);
                self.spawn_history_query(
                    client_id,
                    HistoryFilter::Room(room.clone()),
                    (Some(room.0), None),
                    offset.unwrap_or(0),
                    limit,
                );
            }
            ServerCommand::FetchPrivateHistory {
                client_id,
                with,
                offset,
                limit,
            } => {
                let user = self.require_user(client_id)?;
                let with = parse_username(&with)?;
                let filter = HistoryFilter::Conversation {
                    user1: user.username,
                    user2: with.clone(),
                };
                let limit = page_limit(limit, DEFAULT_PRIVATE_PAGE);
                self.spawn_history_query(
                    client_id,
                    filter,
                    (None, Some(with)),
                    offset.unwrap_or(0),
                    limit,
                );
            }
            ServerCommand::ListRooms { client_id } => {
                let rooms = self.rooms.list_rooms();
                self.send_to(client_id, ServerMessage::RoomList { rooms }).await;
            }
            ServerCommand::ListUsers { client_id } => {
                self.spawn_identity_listing(client_id);
            }
            ServerCommand::Persisted {
                client_id,
                temp_id,
                message_id,
                result,
            } => {
                self.handle_persisted(client_id, temp_id, message_id, result)
                    .await;
            }
            ServerCommand::AckDeadline { client_id, temp_id } => {
                self.handle_ack_deadline(client_id, temp_id).await;
            }
            ServerCommand::ReadConfirmed {
                client_id,
                message_id,
                sender,
            } => {
                self.forward_read_receipt(client_id, message_id, &sender)
                    .await;
            }
            ServerCommand::ReactionStored {
                client_id,
                action,
                reaction,
                message,
            } => {
                let Some(actor) = self.registry.resolve(client_id) else {
                    debug!("Reaction on {} stored after {} left", message.id, client_id);
                    return Ok(());
                };
                let audience = self.audience(&message.scope());
                self.announce_reaction(&audience, &actor, action, message.id, reaction, message.reactions)
                    .await;
            }
        }
        Ok(())
    }

    /// Handle new connection
    async fn handle_connect(&mut self, client_id: ClientId, sender: mpsc::Sender<ServerMessage>) {
        info!("Client {} connected", client_id);
        self.registry.register(client_id, sender);

        let rooms = self.rooms.list_rooms();
        self.send_to(client_id, ServerMessage::RoomList { rooms }).await;

        debug!(
            "Total clients: {}, Total rooms: {}",
            self.registry.len(),
            self.rooms.list_rooms().len()
        );
    }

    /// Handle connection close
    ///
    /// In-flight persistence is left alone; the connection just stops
    /// receiving anything, its own acks included.
    async fn handle_disconnect(&mut self, client_id: ClientId) {
        info!("Client {} disconnected", client_id);

        let handle = self.registry.unbind(client_id);
        self.registry.remove(client_id);
        self.rooms.leave(client_id);

        debug!("Total clients: {}", self.registry.len());

        let Some(handle) = handle else {
            return;
        };

        let typing_changed = self.typing.set_typing(&handle.username, false);
        info!("'{}' left the chat", handle.username);

        self.broadcast(ServerMessage::UserLeft {
            username: handle.username,
            id: client_id.to_string(),
        })
        .await;
        self.broadcast_user_list().await;
        if typing_changed {
            self.broadcast_typing().await;
        }
    }

    /// Handle username binding
    async fn handle_user_join(&mut self, client_id: ClientId, username: String) -> Result<(), AppError> {
        let username = parse_username(&username)?;
        let outcome = self.registry.bind(client_id, username)?;
        let handle = outcome.handle;
        let mut typing_changed = false;

        if let Some(previous) = outcome.previous_username {
            typing_changed |= self.typing.set_typing(&previous, false);
            self.broadcast(ServerMessage::UserLeft {
                username: previous,
                id: client_id.to_string(),
            })
            .await;
        }

        if let Some(replaced) = outcome.replaced {
            info!(
                "Client {} took '{}' over from {}",
                client_id, replaced.username, replaced.client_id
            );
            self.rooms.leave(replaced.client_id);
            typing_changed |= self.typing.set_typing(&replaced.username, false);
            self.send_to(replaced.client_id, ServerMessage::SessionReplaced)
                .await;
            self.broadcast(ServerMessage::UserLeft {
                username: replaced.username,
                id: replaced.client_id.to_string(),
            })
            .await;
        }

        // a rename keeps the connection where it is
        if self.rooms.current_room(client_id).is_none() {
            self.rooms.join(&handle, self.config.default_room.clone());
        }
        self.spawn_identity_upsert(&handle);

        info!("Client {} joined the chat as '{}'", client_id, handle.username);

        self.broadcast_user_list().await;
        self.broadcast(ServerMessage::UserJoined {
            username: handle.username,
            id: client_id.to_string(),
        })
        .await;
        self.broadcast(ServerMessage::RoomList {
            rooms: self.rooms.list_rooms(),
        })
        .await;
        if typing_changed {
            self.broadcast_typing().await;
        }
        Ok(())
    }

    /// Handle room switch
    async fn handle_join_room(&mut self, client_id: ClientId, room: String) -> Result<(), AppError> {
        let user = self.require_user(client_id)?;
        let room = RoomName::parse(&room)?;
        let change = self.rooms.join(&user, room);

        info!(
            "'{}' moved from {:?} to room {}",
            user.username,
            change.previous.as_ref().map(RoomName::as_str),
            change.current
        );

        if change.created {
            self.broadcast(ServerMessage::RoomList {
                rooms: self.rooms.list_rooms(),
            })
            .await;
        }

        let members = self.rooms.members(&change.current);
        self.fan_out(
            &members,
            ServerMessage::UserJoinedRoom {
                username: user.username,
                room: change.current.0,
            },
        )
        .await;
        Ok(())
    }

    /// Handle room message
    ///
    /// The message is fanned out as soon as it has an id; the ack follows
    /// once the history store answers.
    async fn handle_send_message(
        &mut self,
        client_id: ClientId,
        room: Option<String>,
        message: String,
        image: Option<String>,
        temp_id: String,
    ) -> Result<(), AppError> {
        let sender = self.require_user(client_id)?;
        let image = image.filter(|i| !i.is_empty());
        if message.trim().is_empty() && image.is_none() {
            return Err(AppError::EmptyMessage);
        }

        let current = self
            .rooms
            .current_room(client_id)
            .cloned()
            .ok_or_else(|| AppError::NotInRoom(self.config.default_room.0.clone()))?;
        let room = match room {
            Some(room) => {
                let room = RoomName::parse(&room)?;
                if room != current {
                    return Err(AppError::NotInRoom(room.0));
                }
                room
            }
            None => current,
        };

        self.claim_temp_id(client_id, &temp_id)?;

        let id = self.ids.next_id();
        let msg = ChatMessage::public(id, &sender, &room, message, image, temp_id.clone());
        self.track(client_id, &temp_id, id, msg.scope(), false);
        self.clear_typing(&sender).await;

        let members = self.rooms.members(&room);
        debug!(
            "Message {} from '{}' to room {} ({} members)",
            id,
            sender.username,
            room,
            members.len()
        );
        self.fan_out(&members, ServerMessage::ReceiveMessage(msg.clone()))
            .await;

        self.persist(client_id, temp_id, msg);
        Ok(())
    }

    /// Handle direct message
    ///
    /// Persisted whether or not the recipient is online; the ack tells
    /// the sender which it was.
    async fn handle_private_message(
        &mut self,
        client_id: ClientId,
        recipient: RecipientRef,
        message: String,
        image: Option<String>,
        temp_id: String,
    ) -> Result<(), AppError> {
        let sender = self.require_user(client_id)?;
        let image = image.filter(|i| !i.is_empty());
        if message.trim().is_empty() && image.is_none() {
            return Err(AppError::EmptyMessage);
        }

        self.claim_temp_id(client_id, &temp_id)?;

        let resolved = self.registry.resolve_recipient(&recipient);
        let (to, to_username) = match &resolved {
            Some(handle) => (handle.client_id.to_string(), Some(handle.username.clone())),
            None => (recipient.raw.clone(), recipient.username.clone()),
        };

        let id = self.ids.next_id();
        let msg = ChatMessage::private(id, &sender, to, to_username, message, image, temp_id.clone());
        self.track(client_id, &temp_id, id, msg.scope(), resolved.is_none());
        self.clear_typing(&sender).await;

        match resolved {
            Some(target) => {
                debug!(
                    "Private message {} from '{}' to '{}'",
                    id, sender.username, target.username
                );
                self.send_to(target.client_id, ServerMessage::PrivateMessage(msg.clone()))
                    .await;
                if target.client_id != client_id {
                    self.send_to(client_id, ServerMessage::PrivateMessage(msg.clone()))
                        .await;
                }
            }
            None => {
                debug!(
                    "Private message {} from '{}': recipient '{}' not connected",
                    id, sender.username, recipient.raw
                );
            }
        }

        self.persist(client_id, temp_id, msg);
        Ok(())
    }

    /// Handle read receipt
    ///
    /// Only the recipient of a private message can mark it read, and the
    /// receipt goes to the original sender only. Messages the ledger no
    /// longer holds are checked against the history store first.
    async fn handle_read_receipt(&mut self, client_id: ClientId, message_id: MessageId) -> Result<(), AppError> {
        let reader = self.require_user(client_id)?;

        match self.deliveries.mark_read(message_id, &reader.username) {
            ReadReceipt::Marked { sender } => {
                self.spawn_mark_read(message_id, reader.username);
                self.forward_read_receipt(client_id, message_id, &sender)
                    .await;
            }
            ReadReceipt::AlreadyRead { sender } => {
                self.forward_read_receipt(client_id, message_id, &sender)
                    .await;
            }
            ReadReceipt::Unknown => {
                self.spawn_verified_read(client_id, message_id, reader.username);
            }
            ReadReceipt::NotRecipient | ReadReceipt::NotPrivate => {
                debug!(
                    "Ignoring read receipt for {} from '{}'",
                    message_id, reader.username
                );
            }
        }
        Ok(())
    }

    /// Tell a message's sender that `reader_id` read it
    async fn forward_read_receipt(&self, reader_id: ClientId, message_id: MessageId, sender: &str) {
        match self.registry.resolve_by_username(sender) {
            Some(target) => {
                self.send_to(
                    target,
                    ServerMessage::PrivateMessageRead {
                        message_id,
                        reader_id: reader_id.to_string(),
                    },
                )
                .await;
            }
            None => debug!("Read receipt for {}: '{}' not connected", message_id, sender),
        }
    }

    /// Handle typing indicator
    ///
    /// Unbound connections are ignored.
    async fn handle_typing(&mut self, client_id: ClientId, is_typing: bool) {
        let Some(user) = self.registry.resolve(client_id) else {
            return;
        };

        if self.typing.set_typing(&user.username, is_typing) {
            self.broadcast_typing().await;
        }
    }

    /// Handle reaction add/remove
    ///
    /// Reactions of messages in the ledger live in the index and are
    /// written through to history. Older messages are updated in the
    /// history store alone and announced once it answers.
    async fn handle_reaction(
        &mut self,
        client_id: ClientId,
        action: ReactionAction,
        target: ReactionTarget,
    ) -> Result<(), AppError> {
        let actor = self.require_user(client_id)?;
        let emoji = target.reaction.trim();
        if emoji.is_empty() {
            return Err(AppError::EmptyReaction);
        }

        let Some(scope) = self.deliveries.scope(target.message_id).cloned() else {
            self.spawn_stored_reaction(client_id, action, target.message_id, emoji, actor.username);
            return Ok(());
        };

        let changed = match action {
            ReactionAction::Add => self.reactions.add(target.message_id, emoji, &actor.username),
            ReactionAction::Remove => self
                .reactions
                .remove(target.message_id, emoji, &actor.username),
        };
        if !changed {
            debug!(
                "Reaction {} on {} by '{}' already in that state",
                emoji, target.message_id, actor.username
            );
            return Ok(());
        }

        let snapshot = self.reactions.snapshot(target.message_id);
        self.spawn_set_reactions(target.message_id, snapshot.clone());

        let audience = self.audience(&scope);
        self.announce_reaction(&audience, &actor, action, target.message_id, emoji.to_string(), snapshot)
            .await;
        Ok(())
    }

    /// Who hears about activity on a message
    ///
    /// Room messages reach the room's current members, private messages
    /// their two participants.
    fn audience(&self, scope: &MessageScope) -> HashSet<ClientId> {
        match scope {
            MessageScope::Room(room) => self.rooms.members(room),
            MessageScope::Private { sender, recipient } => [Some(sender.as_str()), recipient.as_deref()]
                .into_iter()
                .flatten()
                .filter_map(|username| self.registry.resolve_by_username(username))
                .collect(),
        }
    }

    async fn announce_reaction(
        &self,
        audience: &HashSet<ClientId>,
        actor: &UserHandle,
        action: ReactionAction,
        message_id: MessageId,
        reaction: String,
        reactions: ReactionSnapshot,
    ) {
        self.fan_out(
            audience,
            ServerMessage::MessageReaction {
                message_id,
                reaction,
                user_id: actor.client_id.to_string(),
                username: actor.username.clone(),
                action,
                timestamp: Utc::now(),
                reactions,
            },
        )
        .await;
    }

    /// Handle a finished history write
    async fn handle_persisted(
        &mut self,
        client_id: ClientId,
        temp_id: String,
        message_id: MessageId,
        result: Result<MessageId, StoreError>,
    ) {
        let Some(pending) = self.deliveries.take_pending(client_id, &temp_id) else {
            match result {
                Ok(_) => warn!("Message {} persisted after its ack deadline", message_id),
                Err(e) => warn!("Message {} failed to persist after its ack deadline: {}", message_id, e),
            }
            return;
        };

        let error = match result {
            Err(e) => {
                warn!("Failed to persist message {}: {}", message_id, e);
                Some(AppError::Persistence(e))
            }
            Ok(_) if pending.recipient_missing => Some(AppError::RecipientUnreachable),
            Ok(_) => None,
        };
        let delivered = error.is_none();
        let status = if delivered {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Failed
        };
        self.deliveries.finish(message_id, status);

        let ack = ServerMessage::Ack {
            delivered,
            id: message_id,
            temp_id,
            error: error.map(|e| e.to_string()),
        };
        if !self.send_to(client_id, ack).await {
            debug!("Client {} gone before ack for message {}", client_id, message_id);
        }
    }

    /// Handle an expired acknowledgment deadline
    async fn handle_ack_deadline(&mut self, client_id: ClientId, temp_id: String) {
        let Some(pending) = self.deliveries.take_pending(client_id, &temp_id) else {
            return;
        };

        self.deliveries.finish(pending.message_id, DeliveryStatus::Failed);
        warn!(
            "Message {} from {} not acknowledged within {:?}",
            pending.message_id, client_id, self.config.ack_timeout
        );

        self.send_to(
            client_id,
            ServerMessage::DeliveryFailed {
                id: pending.message_id,
                temp_id,
                reason: "Delivery acknowledgment timed out".to_string(),
            },
        )
        .await;
    }

    /// Helper: the bound identity of a connection
    fn require_user(&self, client_id: ClientId) -> Result<UserHandle, AppError> {
        self.registry
            .resolve(client_id)
            .ok_or(AppError::UsernameRequired)
    }

    /// Helper: reserve a tempId on a connection
    fn claim_temp_id(&mut self, client_id: ClientId, temp_id: &str) -> Result<(), AppError> {
        let client = self
            .registry
            .client_mut(client_id)
            .ok_or(AppError::UnknownConnection(client_id))?;
        if client.claim_temp_id(temp_id) {
            Ok(())
        } else {
            Err(AppError::DuplicateTempId(temp_id.to_string()))
        }
    }

    /// Helper: start tracking a send, dropping reactions of evicted messages
    fn track(
        &mut self,
        client_id: ClientId,
        temp_id: &str,
        message_id: MessageId,
        scope: MessageScope,
        recipient_missing: bool,
    ) {
        let evicted = self.deliveries.track(
            client_id,
            temp_id.to_string(),
            message_id,
            scope,
            recipient_missing,
        );
        for id in evicted {
            self.reactions.forget(id);
        }
    }

    /// Helper: a sent message ends the sender's typing
    async fn clear_typing(&mut self, user: &UserHandle) {
        if self.typing.set_typing(&user.username, false) {
            self.broadcast_typing().await;
        }
    }

    /// Helper: write a message to history and arm its ack deadline
    fn persist(&self, client_id: ClientId, temp_id: String, message: ChatMessage) {
        let Some(commands) = self.commands.upgrade() else {
            warn!("Router shutting down, message {} not persisted", message.id);
            return;
        };

        let message_id = message.id;
        let history = Arc::clone(&self.history);
        let persisted_tx = commands.clone();
        let persisted_temp_id = temp_id.clone();
        tokio::spawn(async move {
            let result = history.save(message).await;
            let _ = persisted_tx
                .send(ServerCommand::Persisted {
                    client_id,
                    temp_id: persisted_temp_id,
                    message_id,
                    result,
                })
                .await;
        });

        let deadline = self.config.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = commands
                .send(ServerCommand::AckDeadline { client_id, temp_id })
                .await;
        });
    }

    /// Helper: query history off the actor and reply straight to the client
    fn spawn_history_query(
        &self,
        client_id: ClientId,
        filter: HistoryFilter,
        (room, with): (Option<String>, Option<String>),
        offset: usize,
        limit: usize,
    ) {
        let Some(client) = self.registry.client(client_id) else {
            return;
        };
        let sender = client.sender.clone();
        let history = Arc::clone(&self.history);

        tokio::spawn(async move {
            let reply = match history.find(filter, offset, limit).await {
                Ok(page) => ServerMessage::History {
                    room,
                    with,
                    offset,
                    messages: page.messages,
                    has_more: page.has_more,
                    total: page.total,
                },
                Err(e) => {
                    warn!("History query for {} failed: {}", client_id, e);
                    AppError::Persistence(e).into()
                }
            };
            let _ = sender.send(reply).await;
        });
    }

    fn spawn_identity_upsert(&self, user: &UserHandle) {
        let identities = Arc::clone(&self.identities);
        let username = user.username.clone();
        let client_id = user.client_id;
        tokio::spawn(async move {
            if let Err(e) = identities.upsert(username.clone(), client_id).await {
                warn!("Failed to record identity '{}': {}", username, e);
            }
        });
    }

    fn spawn_identity_listing(&self, client_id: ClientId) {
        let Some(client) = self.registry.client(client_id) else {
            return;
        };
        let sender = client.sender.clone();
        let identities = Arc::clone(&self.identities);
        let online: HashSet<String> = self
            .registry
            .online_users()
            .into_iter()
            .map(|u| u.username)
            .collect();

        tokio::spawn(async move {
            let reply = match identities.list_all().await {
                Ok(records) => ServerMessage::KnownUsers {
                    users: records
                        .into_iter()
                        .map(|r| KnownUser {
                            online: online.contains(&r.username),
                            id: r.client_id.to_string(),
                            username: r.username,
                        })
                        .collect(),
                },
                Err(e) => {
                    warn!("Identity listing failed: {}", e);
                    AppError::Persistence(e).into()
                }
            };
            let _ = sender.send(reply).await;
        });
    }

    fn spawn_set_reactions(&self, message_id: MessageId, reactions: ReactionSnapshot) {
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            if let Err(e) = history.set_reactions(message_id, reactions).await {
                debug!("Reactions of message {} not stored: {}", message_id, e);
            }
        });
    }

    fn spawn_mark_read(&self, message_id: MessageId, reader: String) {
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            if let Err(e) = history.mark_read(message_id, reader).await {
                debug!("Read flag of message {} not stored: {}", message_id, e);
            }
        });
    }

    /// Helper: mark a message read in history, then report back if the
    /// reader turned out to be its recipient
    fn spawn_verified_read(&self, client_id: ClientId, message_id: MessageId, reader: String) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            match history.mark_read(message_id, reader.clone()).await {
                Ok(Some(sender)) => {
                    let _ = commands
                        .send(ServerCommand::ReadConfirmed {
                            client_id,
                            message_id,
                            sender,
                        })
                        .await;
                }
                Ok(None) => debug!("Ignoring read receipt for {} from '{}'", message_id, reader),
                Err(e) => debug!("Read receipt for {} not applied: {}", message_id, e),
            }
        });
    }

    /// Helper: apply a reaction in history and report back if it changed
    /// anything
    fn spawn_stored_reaction(
        &self,
        client_id: ClientId,
        action: ReactionAction,
        message_id: MessageId,
        emoji: &str,
        username: String,
    ) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let history = Arc::clone(&self.history);
        let reaction = emoji.to_string();
        tokio::spawn(async move {
            match history
                .apply_reaction(message_id, action, reaction.clone(), username)
                .await
            {
                Ok(Some(message)) => {
                    let _ = commands
                        .send(ServerCommand::ReactionStored {
                            client_id,
                            action,
                            reaction,
                            message,
                        })
                        .await;
                }
                Ok(None) => debug!("Reaction {} on {} already in that state", reaction, message_id),
                Err(e) => debug!("Reaction on message {} not applied: {}", message_id, e),
            }
        });
    }

    /// Helper: send to one connection; false if it is gone
    async fn send_to(&self, client_id: ClientId, msg: ServerMessage) -> bool {
        match self.registry.client(client_id) {
            Some(client) => client.send(msg).await.is_ok(),
            None => false,
        }
    }

    /// Helper: send to a set of connections
    async fn fan_out(&self, targets: &HashSet<ClientId>, msg: ServerMessage) {
        for client_id in targets {
            if let Some(client) = self.registry.client(*client_id) {
                let _ = client.send(msg.clone()).await;
            }
        }
    }

    /// Helper: send to every live connection
    async fn broadcast(&self, msg: ServerMessage) {
        for client in self.registry.clients() {
            let _ = client.send(msg.clone()).await;
        }
    }

    async fn broadcast_user_list(&self) {
        self.broadcast(ServerMessage::UserList {
            users: self.registry.online_users(),
        })
        .await;
    }

    async fn broadcast_typing(&self) {
        self.broadcast(ServerMessage::TypingUsers {
            users: self.typing.snapshot(),
        })
        .await;
    }
}

/// Clamp a requested page size
fn page_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).clamp(1, MAX_PAGE)
}
