//! Value objects for the persistent data model (§3).
//!
//! Every type here is a plain, cloneable struct returned by the Persistence
//! Gateway. Nothing here carries a live connection, a row handle, or any
//! other resource — callers own the data outright.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A human operator identified by a Telegram user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: i64,
    pub username: Option<String>,
}

/// One Telegram bot controlled by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotInstance {
    pub id: i64,
    pub owner_user_id: i64,
    pub bot_id: i64,
    pub bot_username: String,
    pub display_name: Option<String>,
    /// Authenticated-encryption ciphertext; the gateway never decrypts this.
    pub token_ciphertext: Vec<u8>,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BotInstance {
    pub fn is_live(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }
}

/// A Telegram group in which enforcement runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedGroup {
    pub id: i64,
    pub bot_instance_id: i64,
    pub group_id: i64,
    pub owner_user_id: i64,
    pub title: Option<String>,
    pub enabled: bool,
    pub params: JsonValue,
    pub member_count: Option<i64>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A Telegram channel whose subscription is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcedChannel {
    pub id: i64,
    pub bot_instance_id: i64,
    pub channel_id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
    pub invite_link: Option<String>,
    pub subscriber_count: Option<i64>,
}

/// The many-to-many binding of groups to required channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupChannelLink {
    pub group_id: i64,
    pub channel_id: i64,
}

/// Status markers recorded by one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Restricted,
    Error,
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Restricted => "restricted",
            VerificationStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Append-only record of one verdict (§3, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationLog {
    pub bot_instance_id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub channel_id: Option<i64>,
    pub status: VerificationStatus,
    pub latency_ms: i64,
    pub cached: bool,
    pub error_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of one Telegram API call (§3, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallLog {
    pub bot_instance_id: i64,
    pub method: String,
    pub chat_id: Option<i64>,
    pub user_id: Option<i64>,
    pub success: bool,
    pub latency_ms: i64,
    pub error_category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Operator-visible audit row (§3): written by the command worker and
/// chat-command handlers for actions like ban/unban/protect/unprotect,
/// read only by external observers — the core never queries this table back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAuditLog {
    pub bot_instance_id: i64,
    pub actor_user_id: Option<i64>,
    pub action: String,
    pub group_id: Option<i64>,
    pub target_user_id: Option<i64>,
    pub details: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// Status lifecycle of a queued admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A queued instruction from dashboard to bot (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCommand {
    pub id: uuid::Uuid,
    pub bot_instance_id: i64,
    pub command_type: String,
    pub payload: JsonValue,
    pub status: CommandStatus,
    pub error: Option<String>,
    pub attempts: i32,
    /// The operator who queued this command, if the dashboard attached one;
    /// threaded through to the audit log entry the worker writes on success.
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Liveness states a bot worker can occupy (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Restarting,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Restarting => "restarting",
        };
        write!(f, "{s}")
    }
}

/// Singleton-per-bot liveness record (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatus {
    pub bot_instance_id: i64,
    pub status: WorkerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub last_error: Option<String>,
}

/// The three verdict markers the cache stores (§4.2). Distinct from
/// [`crate::verification::Verdict`]: this is what the cache persists, not
/// what the verification service returns to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipMarker {
    Member,
    NonMember,
    UnknownError,
}

impl MembershipMarker {
    pub fn as_code(&self) -> &'static str {
        match self {
            MembershipMarker::Member => "m",
            MembershipMarker::NonMember => "n",
            MembershipMarker::UnknownError => "e",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "m" => Some(MembershipMarker::Member),
            "n" => Some(MembershipMarker::NonMember),
            "e" => Some(MembershipMarker::UnknownError),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_instance_liveness() {
        let mut bot = BotInstance {
            id: 1,
            owner_user_id: 1,
            bot_id: 99,
            bot_username: "nezuko_bot".into(),
            display_name: None,
            token_ciphertext: vec![],
            is_active: true,
            deleted_at: None,
        };
        assert!(bot.is_live());
        bot.is_active = false;
        assert!(!bot.is_live());
        bot.is_active = true;
        bot.deleted_at = Some(Utc::now());
        assert!(!bot.is_live());
    }

    #[test]
    fn membership_marker_round_trips() {
        for marker in [
            MembershipMarker::Member,
            MembershipMarker::NonMember,
            MembershipMarker::UnknownError,
        ] {
            let code = marker.as_code();
            assert_eq!(MembershipMarker::from_code(code), Some(marker));
        }
        assert_eq!(MembershipMarker::from_code("?"), None);
    }

    #[test]
    fn verification_status_display() {
        assert_eq!(VerificationStatus::Verified.to_string(), "verified");
        assert_eq!(VerificationStatus::Restricted.to_string(), "restricted");
    }
}
