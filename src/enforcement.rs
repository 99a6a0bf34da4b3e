//! Enforcement Service (C5, §4.5).
//!
//! Applies a [`crate::verification::Verdict`] to a group idempotently. Keeps
//! no long-lived state about mute status — restrict calls are safe to
//! re-issue — except the ephemeral pending-challenge map used only to know
//! which challenge message to clean up on a later `Verified` transition.

use crate::error::Result;
use crate::verification::Verdict;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const CHALLENGE_TTL: Duration = Duration::from_secs(60 * 60);

/// What the enforcement service needs from the Telegram side. Implemented
/// by an adapter over [`crate::telegram::TelegramFacade`].
#[async_trait]
pub trait EnforcementActions: Send + Sync {
    async fn restrict_default_member(&self, chat_id: i64, user_id: i64) -> Result<()>;
    async fn restrict_fully(&self, chat_id: i64, user_id: i64) -> Result<()>;
    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()>;
    async fn send_challenge(
        &self,
        chat_id: i64,
        user_id: i64,
        channel_title: &str,
        invite_link: Option<&str>,
    ) -> Result<i32>;
    async fn send_verified_toast(&self, chat_id: i64, user_id: i64) -> Result<()>;
}

#[derive(Clone, Copy)]
struct ChallengeEntry {
    message_id: i32,
    inserted_at: Instant,
}

pub struct EnforcementService {
    actions: std::sync::Arc<dyn EnforcementActions>,
    pending_challenges: Mutex<HashMap<(i64, i64), ChallengeEntry>>,
    send_verified_toast: bool,
}

impl EnforcementService {
    pub fn new(actions: std::sync::Arc<dyn EnforcementActions>, send_verified_toast: bool) -> Self {
        Self {
            actions,
            pending_challenges: Mutex::new(HashMap::new()),
            send_verified_toast,
        }
    }

    /// Applies `verdict` for `(chat_id, user_id)`. `triggering_message_id` is
    /// the message that caused the check, if any (absent for new-member and
    /// callback-query-triggered calls).
    pub async fn apply(
        &self,
        chat_id: i64,
        user_id: i64,
        verdict: Verdict,
        triggering_message_id: Option<i32>,
        channel_title: &str,
        invite_link: Option<&str>,
    ) -> Result<()> {
        match verdict {
            Verdict::Verified => self.apply_verified(chat_id, user_id).await,
            Verdict::Restricted { .. } => {
                self.apply_restricted(chat_id, user_id, triggering_message_id, channel_title, invite_link)
                    .await
            }
            Verdict::Error => {
                warn!(chat_id, user_id, "verification errored, leaving enforcement state untouched");
                Ok(())
            }
        }
    }

    async fn apply_verified(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.actions.restrict_default_member(chat_id, user_id).await?;

        if let Some(entry) = self.take_challenge(chat_id, user_id).await {
            if let Err(err) = self.actions.delete_message(chat_id, entry.message_id).await {
                warn!(chat_id, user_id, error = %err, "failed to delete stale challenge message");
            }
        }

        if self.send_verified_toast {
            if let Err(err) = self.actions.send_verified_toast(chat_id, user_id).await {
                warn!(chat_id, user_id, error = %err, "failed to send verified toast");
            }
        }
        Ok(())
    }

    async fn apply_restricted(
        &self,
        chat_id: i64,
        user_id: i64,
        triggering_message_id: Option<i32>,
        channel_title: &str,
        invite_link: Option<&str>,
    ) -> Result<()> {
        self.actions.restrict_fully(chat_id, user_id).await?;

        if let Some(message_id) = triggering_message_id {
            if let Err(err) = self.actions.delete_message(chat_id, message_id).await {
                warn!(chat_id, user_id, error = %err, "failed to delete offending message");
            }
        }

        let message_id = self
            .actions
            .send_challenge(chat_id, user_id, channel_title, invite_link)
            .await?;
        self.remember_challenge(chat_id, user_id, message_id).await;
        info!(chat_id, user_id, "issued subscription challenge");
        Ok(())
    }

    async fn remember_challenge(&self, chat_id: i64, user_id: i64, message_id: i32) {
        let mut map = self.pending_challenges.lock().await;
        map.insert(
            (chat_id, user_id),
            ChallengeEntry { message_id, inserted_at: Instant::now() },
        );
    }

    /// Removes and returns the pending challenge for `(chat_id, user_id)` if
    /// one exists and hasn't expired; expired entries are dropped silently.
    async fn take_challenge(&self, chat_id: i64, user_id: i64) -> Option<ChallengeEntry> {
        let mut map = self.pending_challenges.lock().await;
        match map.remove(&(chat_id, user_id)) {
            Some(entry) if entry.inserted_at.elapsed() < CHALLENGE_TTL => Some(entry),
            _ => None,
        }
    }
}

/// Default unmute permission set (§4.5, resolved open question #1): an
/// ordinary non-admin member's Telegram permissions.
pub fn default_unmute_permissions() -> teloxide::types::ChatPermissions {
    use teloxide::types::ChatPermissions;
    ChatPermissions::SEND_MESSAGES
        | ChatPermissions::SEND_AUDIOS
        | ChatPermissions::SEND_DOCUMENTS
        | ChatPermissions::SEND_PHOTOS
        | ChatPermissions::SEND_VIDEOS
        | ChatPermissions::SEND_VIDEO_NOTES
        | ChatPermissions::SEND_VOICE_NOTES
        | ChatPermissions::SEND_POLLS
        | ChatPermissions::SEND_OTHER_MESSAGES
        | ChatPermissions::ADD_WEB_PAGE_PREVIEWS
}

/// Full restriction: every communication permission denied.
pub fn fully_restricted_permissions() -> teloxide::types::ChatPermissions {
    teloxide::types::ChatPermissions::empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeActions {
        restricted_default: AsyncMutex<Vec<(i64, i64)>>,
        restricted_full: AsyncMutex<Vec<(i64, i64)>>,
        deleted: AsyncMutex<Vec<(i64, i32)>>,
        next_message_id: AtomicI32,
    }

    #[async_trait]
    impl EnforcementActions for FakeActions {
        async fn restrict_default_member(&self, chat_id: i64, user_id: i64) -> Result<()> {
            self.restricted_default.lock().await.push((chat_id, user_id));
            Ok(())
        }
        async fn restrict_fully(&self, chat_id: i64, user_id: i64) -> Result<()> {
            self.restricted_full.lock().await.push((chat_id, user_id));
            Ok(())
        }
        async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
            self.deleted.lock().await.push((chat_id, message_id));
            Ok(())
        }
        async fn send_challenge(
            &self,
            _chat_id: i64,
            _user_id: i64,
            _channel_title: &str,
            _invite_link: Option<&str>,
        ) -> Result<i32> {
            Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
        }
        async fn send_verified_toast(&self, _chat_id: i64, _user_id: i64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn restricted_verdict_mutes_and_sends_challenge() {
        let actions = Arc::new(FakeActions::default());
        let service = EnforcementService::new(actions.clone(), false);
        service
            .apply(1, 2, Verdict::Restricted { missing_channel_id: 99 }, Some(42), "News", None)
            .await
            .unwrap();
        assert_eq!(actions.restricted_full.lock().await.as_slice(), &[(1, 2)]);
        assert_eq!(actions.deleted.lock().await.as_slice(), &[(1, 42)]);
    }

    #[tokio::test]
    async fn verified_after_restricted_clears_challenge() {
        let actions = Arc::new(FakeActions::default());
        let service = EnforcementService::new(actions.clone(), false);
        service
            .apply(1, 2, Verdict::Restricted { missing_channel_id: 99 }, None, "News", None)
            .await
            .unwrap();
        service.apply(1, 2, Verdict::Verified, None, "News", None).await.unwrap();
        assert_eq!(actions.restricted_default.lock().await.as_slice(), &[(1, 2)]);
        assert_eq!(actions.deleted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn verified_without_prior_challenge_does_not_delete() {
        let actions = Arc::new(FakeActions::default());
        let service = EnforcementService::new(actions.clone(), false);
        service.apply(1, 2, Verdict::Verified, None, "News", None).await.unwrap();
        assert!(actions.deleted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn error_verdict_is_a_no_op() {
        let actions = Arc::new(FakeActions::default());
        let service = EnforcementService::new(actions.clone(), false);
        service.apply(1, 2, Verdict::Error, Some(5), "News", None).await.unwrap();
        assert!(actions.restricted_full.lock().await.is_empty());
        assert!(actions.restricted_default.lock().await.is_empty());
        assert!(actions.deleted.lock().await.is_empty());
    }
}
