//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake,
//! message parsing, and bidirectional communication with the MessageRouter.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::message::{ClientMessage, ReactionAction, ServerMessage};
use crate::router::ServerCommand;
use crate::types::{ClientId, RecipientRef};

/// Outbound queue size per connection
const CLIENT_CHANNEL_SIZE: usize = 64;

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, sets up bidirectional communication,
/// and manages the connection lifecycle.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = ClientId::new();
    info!("Client {} connected from {}", client_id, peer_addr);

    // Channel for router -> client messages
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(CLIENT_CHANNEL_SIZE);

    // Greet before registering so `connected` is the first frame
    let connected_msg = ServerMessage::Connected {
        client_id: client_id.to_string(),
    };
    let json = serde_json::to_string(&connected_msg)?;
    ws_sender.send(Message::Text(json.into())).await?;

    if cmd_tx
        .send(ServerCommand::Connect {
            client_id,
            sender: msg_tx.clone(),
        })
        .await
        .is_err()
    {
        error!("Failed to register client {} - router closed", client_id);
        return Err(AppError::ChannelSend);
    }

    let cmd_tx_read = cmd_tx.clone();

    // Read task (WebSocket -> ServerCommand)
    let read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let cmd = client_message_to_command(client_id, client_msg);
                        if cmd_tx_read.send(cmd).await.is_err() {
                            debug!("Router closed, ending read task for {}", client_id);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid JSON from {}: {}", client_id, e);
                        let _ = msg_tx.send(AppError::Json(e).into()).await;
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Client {} sent close frame", client_id);
                    break;
                }
                Ok(Message::Ping(_)) => {
                    // Pong is handled automatically by tungstenite
                    debug!("Ping from {}", client_id);
                }
                Ok(Message::Pong(_)) => {
                    debug!("Pong from {}", client_id);
                }
                Ok(_) => {
                    // Binary or other message types - ignore
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", client_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", client_id);
    });

    // Write task (ServerMessage -> WebSocket)
    let write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                }
            }
        }
        debug!("Write task ended for client");

        let _ = ws_sender.close().await;
    });

    tokio::select! {
        _ = read_task => {
            debug!("Read task completed for {}", client_id);
        }
        _ = write_task => {
            debug!("Write task completed for {}", client_id);
        }
    }

    let _ = cmd_tx.send(ServerCommand::Disconnect { client_id }).await;

    info!("Client {} disconnected", client_id);

    Ok(())
}

/// Convert a ClientMessage to a ServerCommand
pub fn client_message_to_command(client_id: ClientId, msg: ClientMessage) -> ServerCommand {
    match msg {
        ClientMessage::UserJoin { username } => ServerCommand::UserJoin { client_id, username },
        ClientMessage::JoinRoom { room } => ServerCommand::JoinRoom { client_id, room },
        ClientMessage::SendMessage {
            message,
            room,
            image,
            temp_id,
        } => ServerCommand::SendMessage {
            client_id,
            room,
            message,
            image,
            temp_id,
        },
        ClientMessage::PrivateMessage {
            to,
            to_username,
            message,
            image,
            temp_id,
        } => ServerCommand::PrivateMessage {
            client_id,
            recipient: RecipientRef::new(to, to_username),
            message,
            image,
            temp_id,
        },
        ClientMessage::PrivateMessageRead { message_id } => {
            ServerCommand::PrivateMessageRead { client_id, message_id }
        }
        ClientMessage::Typing { is_typing } => ServerCommand::Typing { client_id, is_typing },
        ClientMessage::MessageReaction(target) => ServerCommand::Reaction {
            client_id,
            action: ReactionAction::Add,
            target,
        },
        ClientMessage::RemoveReaction(target) => ServerCommand::Reaction {
            client_id,
            action: ReactionAction::Remove,
            target,
        },
        ClientMessage::FetchHistory {
            room,
            offset,
            limit,
        } => ServerCommand::FetchHistory {
            client_id,
            room,
            offset,
            limit,
        },
        ClientMessage::FetchPrivateHistory {
            with,
            offset,
            limit,
        } => ServerCommand::FetchPrivateHistory {
            client_id,
            with,
            offset,
            limit,
        },
        ClientMessage::ListRooms => ServerCommand::ListRooms { client_id },
        ClientMessage::ListUsers => ServerCommand::ListUsers { client_id },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageId;

    fn parse(client_id: ClientId, json: &str) -> ServerCommand {
        client_message_to_command(client_id, serde_json::from_str(json).unwrap())
    }

    #[test]
    fn test_private_message_keeps_recipient_reference() {
        let client_id = ClientId::new();
        let stale = ClientId::new();
        let json = format!(
            r#"{{"type":"private_message","to":"{}","toUsername":"Bob","message":"hi","tempId":"p1"}}"#,
            stale
        );

        match parse(client_id, &json) {
            ServerCommand::PrivateMessage {
                client_id: from,
                recipient,
                temp_id,
                ..
            } => {
                assert_eq!(from, client_id);
                assert_eq!(recipient.client_id, Some(stale));
                assert_eq!(recipient.username.as_deref(), Some("Bob"));
                assert_eq!(temp_id, "p1");
            }
            other => panic!("Wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_reaction_events_map_to_actions() {
        let client_id = ClientId::new();
        let add = parse(
            client_id,
            r#"{"type":"message_reaction","messageId":3,"reaction":"🎉","isPrivate":true,"recipientId":"x"}"#,
        );
        assert!(matches!(
            add,
            ServerCommand::Reaction { action: ReactionAction::Add, ref target, .. }
                if target.message_id == MessageId(3) && target.reaction == "🎉"
        ));

        let remove = parse(
            client_id,
            r#"{"type":"remove_reaction","messageId":3,"reaction":"🎉"}"#,
        );
        assert!(matches!(
            remove,
            ServerCommand::Reaction { action: ReactionAction::Remove, .. }
        ));
    }

    #[test]
    fn test_commands_carry_client_id() {
        let client_id = ClientId::new();
        let cmd = parse(client_id, r#"{"type":"list_rooms"}"#);
        assert_eq!(cmd.client_id(), client_id);
    }
}
