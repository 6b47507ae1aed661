//! The external Telegram actor: the capabilities the provisioner needs and
//! the error classification it retries on.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

/// Supergroup ids are reported as `-100<n>`; this is the `100…0` offset.
pub const SUPERGROUP_OFFSET: i64 = 1_000_000_000_000;

/// Positive ids from the session API become `-1_000_000_000_000 - n`;
/// negative ids are already canonical.
pub fn canonical_chat_id(raw: i64) -> i64 {
    if raw > 0 {
        -SUPERGROUP_OFFSET - raw
    } else {
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorErrorKind {
    /// Network failure, timeout, rate limit or 5xx. Retried with backoff.
    Transient,
    /// Permission denied, invalid title and other refusals.
    Permanent,
    /// The requested effect already holds (e.g. bot is already admin).
    AlreadyDone,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ActorError {
    pub kind: ActorErrorKind,
    pub message: String,
}

impl ActorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ActorErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ActorErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn already_done(message: impl Into<String>) -> Self {
        Self {
            kind: ActorErrorKind::AlreadyDone,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500..=599 => Self::transient(format!("HTTP {status}: {message}")),
            _ => Self::permanent(format!("HTTP {status}: {message}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ActorErrorKind::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BotMembership {
    pub present: bool,
    pub admin: bool,
}

#[async_trait]
pub trait TelegramControl: Send + Sync {
    /// Creates a supergroup and returns the id as the session API reports it.
    ///
    /// Repeating a call with the same `key` must not create a second group:
    /// the actor either returns the existing id or answers `AlreadyDone`.
    async fn create_group(&self, title: &str, key: &str) -> Result<i64, ActorError>;
    /// Id of the group created earlier under `key`, if any.
    async fn find_group(&self, key: &str) -> Result<Option<i64>, ActorError>;
    async fn promote_bot(&self, chat_id: i64) -> Result<(), ActorError>;
    async fn export_invite(&self, chat_id: i64) -> Result<String, ActorError>;
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), ActorError>;
    async fn bot_membership(&self, chat_id: i64) -> Result<BotMembership, ActorError>;
}
