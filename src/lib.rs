//! Multi-room WebSocket Chat Relay Library
//!
//! A WebSocket chat relay built with tokio-tungstenite using the Actor
//! pattern for state management.
//!
//! # Features
//! - Username binding with a configurable duplicate-login policy
//! - Named rooms, created on first join, one room per connection
//! - Room broadcast and private messages with acknowledged delivery
//! - Server-side acknowledgment deadline (`delivery_failed`)
//! - Read receipts for private messages
//! - Emoji reactions with idempotent add/remove
//! - Typing indicators
//! - Paginated room and private history
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `MessageRouter` is the central actor owning every shared table
//! - Each connection has a `handler` task communicating with the router
//! - Persistence runs in background tasks that report back to the router
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_relay::{handle_connection, MemoryHistoryStore, MemoryIdentityStore, MessageRouter, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let listener = TcpListener::bind(&config.addr).await.unwrap();
//!     let (router, cmd_tx) = MessageRouter::new(
//!         config,
//!         Arc::new(MemoryHistoryStore::new()),
//!         Arc::new(MemoryIdentityStore::new()),
//!     );
//!
//!     tokio::spawn(router.run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let cmd_tx = cmd_tx.clone();
//!         tokio::spawn(handle_connection(stream, cmd_tx));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod handler;
pub mod message;
pub mod reaction;
pub mod record;
pub mod registry;
pub mod room;
pub mod router;
pub mod store;
pub mod typing;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use config::{DuplicateLoginPolicy, ServerConfig};
pub use delivery::DeliveryTracker;
pub use error::{AppError, SendError, StoreError};
pub use handler::handle_connection;
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use reaction::ReactionIndex;
pub use record::{ChatMessage, DeliveryStatus};
pub use registry::ConnectionRegistry;
pub use room::{MembershipChange, RoomManager};
pub use router::{MessageRouter, ServerCommand};
pub use store::{HistoryStore, IdentityStore, MemoryHistoryStore, MemoryIdentityStore};
pub use typing::TypingAggregator;
pub use types::{ClientId, MessageId, RoomName, UserHandle};
