//! Server configuration
//!
//! Read from `CHAT_*` environment variables with defaults matching a
//! single-machine deployment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::types::RoomName;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Default room every bound user starts in
pub const DEFAULT_ROOM: &str = "general";

/// What to do when a username is bound while another connection holds it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateLoginPolicy {
    /// Refuse the new binding with `identity_conflict`
    Reject,
    /// Unbind the older connection and let the new one take over
    Replace,
}

impl FromStr for DuplicateLoginPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            other => Err(AppError::Config(format!(
                "CHAT_DUPLICATE_LOGIN must be 'reject' or 'replace', got '{}'",
                other
            ))),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub addr: String,
    /// How long a send may stay unacknowledged before it is marked failed
    pub ack_timeout: Duration,
    /// Duplicate username policy
    pub duplicate_login: DuplicateLoginPolicy,
    /// Room joined on a connection's first `user_join`
    pub default_room: RoomName,
    /// Router command channel capacity
    pub channel_buffer: usize,
    /// Recent messages whose scope, status and reactions stay in memory;
    /// also the per-connection window for tempId reuse
    pub message_cache: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            ack_timeout: Duration::from_secs(5),
            duplicate_login: DuplicateLoginPolicy::Reject,
            default_room: RoomName(DEFAULT_ROOM.to_string()),
            channel_buffer: 256,
            message_cache: 1000,
        }
    }
}

impl ServerConfig {
    /// Load from the process environment; the first CLI argument, if any,
    /// overrides `CHAT_ADDR`.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        if let Some(addr) = env::args().nth(1) {
            config.addr = addr;
        }
        Ok(config)
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_ADDR") {
            config.addr = addr;
        }
        if let Some(ms) = lookup("CHAT_ACK_TIMEOUT_MS") {
            let ms: u64 = parse_number("CHAT_ACK_TIMEOUT_MS", &ms)?;
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup("CHAT_DUPLICATE_LOGIN") {
            config.duplicate_login = policy.parse()?;
        }
        if let Some(room) = lookup("CHAT_DEFAULT_ROOM") {
            config.default_room = RoomName::parse(&room)
                .map_err(|e| AppError::Config(format!("CHAT_DEFAULT_ROOM: {}", e)))?;
        }
        if let Some(n) = lookup("CHAT_CHANNEL_BUFFER") {
            config.channel_buffer = parse_number("CHAT_CHANNEL_BUFFER", &n)?;
        }
        if let Some(n) = lookup("CHAT_MESSAGE_CACHE") {
            config.message_cache = parse_number("CHAT_MESSAGE_CACHE", &n)?;
        }

        if config.ack_timeout.is_zero() {
            return Err(AppError::Config("CHAT_ACK_TIMEOUT_MS must be positive".to_string()));
        }
        if config.channel_buffer == 0 {
            return Err(AppError::Config("CHAT_CHANNEL_BUFFER must be positive".to_string()));
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{} is not a valid number: '{}'", key, value)))
}
