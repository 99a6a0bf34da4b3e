//! Error taxonomy for the enforcement core.
//!
//! `CoreError` is the single error type crossing module boundaries. Every
//! variant maps to the taxonomy component design documents classify Telegram
//! and persistence failures into; classification methods drive retry and
//! circuit-breaker decisions in the facade and the gateway's own bounded
//! retry wrapper.

use std::fmt;

/// One Telegram API call's outcome, as seen by the facade before it is
/// folded into [`CoreError`]. Kept distinct from `CoreError` so retry and
/// circuit-breaker logic can pattern-match on Telegram specifics without
/// the umbrella enum growing Telegram-only fields.
#[derive(Debug, Clone)]
pub enum TelegramFailure {
    /// 429 Too Many Requests; the u64 is the advertised `retry_after` seconds.
    RetryAfter(u64),
    /// Network/IO error talking to the Bot API.
    Network(String),
    /// HTTP 5xx or an otherwise ambiguous server-side failure.
    ServerError(String),
    /// The bot lacks the rights to perform this call in this chat.
    PermissionDenied(String),
    /// Chat, user, or message the call targeted does not exist.
    NotFound(String),
    /// Token is invalid or the user blocked the bot; never retry.
    Terminal(String),
}

impl TelegramFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TelegramFailure::RetryAfter(_)
                | TelegramFailure::Network(_)
                | TelegramFailure::ServerError(_)
        )
    }
}

impl fmt::Display for TelegramFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelegramFailure::RetryAfter(secs) => write!(f, "rate limited, retry after {secs}s"),
            TelegramFailure::Network(msg) => write!(f, "network error: {msg}"),
            TelegramFailure::ServerError(msg) => write!(f, "server error: {msg}"),
            TelegramFailure::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            TelegramFailure::NotFound(msg) => write!(f, "not found: {msg}"),
            TelegramFailure::Terminal(msg) => write!(f, "terminal error: {msg}"),
        }
    }
}

impl From<&teloxide::RequestError> for TelegramFailure {
    fn from(err: &teloxide::RequestError) -> Self {
        use teloxide::RequestError;
        match err {
            RequestError::RetryAfter(duration) => {
                TelegramFailure::RetryAfter(duration.seconds() as u64)
            }
            RequestError::Network(e) => TelegramFailure::Network(e.to_string()),
            RequestError::Io(e) => TelegramFailure::Network(e.to_string()),
            RequestError::Api(api_err) => classify_api_error(api_err),
            RequestError::MigrateToChatId(_) => TelegramFailure::Terminal(err.to_string()),
            RequestError::InvalidJson { .. } => TelegramFailure::ServerError(err.to_string()),
            _ => TelegramFailure::ServerError(err.to_string()),
        }
    }
}

fn classify_api_error(err: &teloxide::ApiError) -> TelegramFailure {
    use teloxide::ApiError;
    let text = err.to_string();
    match err {
        ApiError::NotFound
        | ApiError::MessageToDeleteNotFound
        | ApiError::MessageIdInvalid
        | ApiError::ChatNotFound => TelegramFailure::NotFound(text),
        ApiError::NotEnoughRightsToPinMessage
        | ApiError::NotEnoughRightsToManagePins
        | ApiError::NotEnoughRightsToRestrict
        | ApiError::ChatAdminRequired
        | ApiError::Unauthorized => TelegramFailure::PermissionDenied(text),
        ApiError::BotBlocked | ApiError::UserDeactivated | ApiError::CantInitiateConversation => {
            TelegramFailure::Terminal(text)
        }
        ApiError::Unknown(_) => TelegramFailure::ServerError(text),
        _ => TelegramFailure::ServerError(text),
    }
}

/// The crate-wide error taxonomy (§7).
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// A requested entity (chat, user, message, row) is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bot lacks rights to perform the requested action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Telegram told us to slow down; absorbed by the facade, rarely surfaced.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Network, timeout, or 5xx; retried up to the component's bound before
    /// surfacing.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unique-constraint violation or equivalent race in the gateway.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration invalid, encryption key missing, schema mismatch — the
    /// process refuses to start or the worker aborts.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether retrying the operation that produced this error is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::RateLimited { .. })
    }

    /// Whether this error should abort the bot worker entirely rather than
    /// being absorbed locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_))
    }
}

impl From<TelegramFailure> for CoreError {
    fn from(failure: TelegramFailure) -> Self {
        match failure {
            TelegramFailure::RetryAfter(secs) => CoreError::RateLimited {
                retry_after_secs: secs,
            },
            TelegramFailure::Network(msg) | TelegramFailure::ServerError(msg) => {
                CoreError::Transient(msg)
            }
            TelegramFailure::PermissionDenied(msg) => CoreError::PermissionDenied(msg),
            TelegramFailure::NotFound(msg) => CoreError::NotFound(msg),
            TelegramFailure::Terminal(msg) => CoreError::Fatal(msg),
        }
    }
}

impl From<teloxide::RequestError> for CoreError {
    fn from(err: teloxide::RequestError) -> Self {
        CoreError::from(TelegramFailure::from(&err))
    }
}

impl From<tokio_postgres::Error> for CoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            if db_err.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                return CoreError::Conflict(db_err.message().to_string());
            }
        }
        CoreError::Transient(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for CoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        CoreError::Transient(format!("pool: {err}"))
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Transient(format!("cache: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Fatal(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
