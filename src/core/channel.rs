use crate::core::triggers::TriggerKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Channels a bot can run on. Distinct from [`TriggerKind`], which also
/// covers the clock-driven scheduled kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotKind {
    Telegram,
    Discord,
}

impl BotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotKind::Telegram => "telegram",
            BotKind::Discord => "discord",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(BotKind::Telegram),
            "discord" => Some(BotKind::Discord),
            _ => None,
        }
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        match self {
            BotKind::Telegram => TriggerKind::Telegram,
            BotKind::Discord => TriggerKind::Discord,
        }
    }
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by channel adapters, both at connect time and later
/// from the background watchdog.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("credential revoked or unauthorized: {0}")]
    RevokedCredential(String),

    #[error("another session is already using this credential: {0}")]
    ConflictingSession(String),

    #[error("agent has no {0} trigger configured")]
    MissingTrigger(BotKind),

    #[error("missing required secret '{0}'")]
    MissingSecret(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChannelError {
    /// Errors that mean the bot cannot keep running and retrying will not
    /// help until the operator changes something.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::InvalidCredential(_)
                | ChannelError::RevokedCredential(_)
                | ChannelError::ConflictingSession(_)
        )
    }
}

/// Map an upstream API error string to a credential-level diagnosis.
///
/// Checked most-specific first: a conflict often carries a 409 status and
/// distinctive phrasing, while 401/404 map to revoked and invalid tokens.
/// Anything unrecognized stays a transport failure.
pub fn classify_connect_failure(detail: &str) -> ChannelError {
    let lower = detail.to_lowercase();
    if lower.contains("409") || lower.contains("conflict") || lower.contains("terminated by other") {
        ChannelError::ConflictingSession(detail.to_string())
    } else if lower.contains("401") || lower.contains("unauthorized") {
        ChannelError::RevokedCredential(detail.to_string())
    } else if lower.contains("404") || lower.contains("not found") {
        ChannelError::InvalidCredential(detail.to_string())
    } else {
        ChannelError::Transport(detail.to_string())
    }
}

/// A live connection to one chat platform on behalf of one agent.
///
/// `connect` must validate credentials before declaring success and hand
/// back a receiver that fires at most once, when the adapter dies after a
/// successful connect.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> BotKind;

    async fn connect(&self, agent_id: &str) -> Result<oneshot::Receiver<ChannelError>, ChannelError>;

    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Deliver a message outside the inbound-reply flow, e.g. a scheduled
    /// announcement. `destination` is a platform chat/channel id.
    async fn send_direct_message(&self, destination: &str, text: &str) -> anyhow::Result<()>;

    /// Swap in freshly resolved secrets without restarting the connection.
    async fn update_secrets(&self, secrets: HashMap<String, String>);

    fn is_connected(&self) -> bool;
}

/// Builds one adapter per started bot, so the manager stays testable with
/// mock adapters.
pub trait AdapterFactory: Send + Sync {
    fn create(&self) -> Arc<dyn ChannelAdapter>;
}
