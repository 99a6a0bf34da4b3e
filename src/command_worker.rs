//! Command Worker (C7, §4.7).
//!
//! Drains one bot's `admin_commands` queue. Grounded on the teacher's cron
//! service tick loop (`tokio::time::sleep`-driven poll plus an atomic
//! running flag), generalized here to race the poll against a wake signal
//! and to dequeue from Postgres instead of a JSON-backed job store.

use crate::cache::MembershipCache;
use crate::db::{PersistenceGateway, RESYNC_RECENT_USER_LIMIT};
use crate::enforcement::EnforcementService;
use crate::error::Result;
use crate::models::{AdminAuditLog, AdminCommand};
use crate::telegram::TelegramFacade;
use crate::verification::{Verdict, VerificationService};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const CLAIM_LIMIT: i64 = 10;
const STALE_PROCESSING_THRESHOLD: Duration = Duration::from_secs(30);

pub struct CommandWorker {
    bot_instance_id: i64,
    db: Arc<PersistenceGateway>,
    facade: Arc<TelegramFacade>,
    cache: Arc<dyn MembershipCache>,
    verification: Arc<VerificationService>,
    enforcement: Arc<EnforcementService>,
    wake: Arc<Notify>,
}

impl CommandWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_instance_id: i64,
        db: Arc<PersistenceGateway>,
        facade: Arc<TelegramFacade>,
        cache: Arc<dyn MembershipCache>,
        verification: Arc<VerificationService>,
        enforcement: Arc<EnforcementService>,
    ) -> Self {
        Self {
            bot_instance_id,
            db,
            facade,
            cache,
            verification,
            enforcement,
            wake: Arc::new(Notify::new()),
        }
    }

    /// A clone-able handle dashboards can use to nudge the worker instead of
    /// waiting out the poll interval.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.db.reap_stale_processing_commands(STALE_PROCESSING_THRESHOLD).await {
            warn!(bot_instance_id = self.bot_instance_id, error = %err, "failed to reap stale commands at startup");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(bot_instance_id = self.bot_instance_id, "command worker shutting down");
                        return;
                    }
                }
            }

            if let Err(err) = self.drain_once().await {
                error!(bot_instance_id = self.bot_instance_id, error = %err, "command drain cycle failed");
            }
        }
    }

    async fn drain_once(&self) -> Result<()> {
        let commands = self.db.claim_next_pending_commands(self.bot_instance_id, CLAIM_LIMIT).await?;
        for command in commands {
            let id = command.id;
            match self.dispatch(&command).await {
                Ok(()) => {
                    self.db.complete_command(id).await?;
                }
                Err(err) => {
                    warn!(bot_instance_id = self.bot_instance_id, command_type = %command.command_type, error = %err, "command failed");
                    self.db.fail_command(id, &err.to_string()).await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, command: &AdminCommand) -> Result<()> {
        match command.command_type.as_str() {
            "ban_user" => {
                let (chat_id, user_id) = chat_and_user(&command.payload)?;
                self.facade.ban_member(chat_id, user_id).await?;
                self.audit(command, Some(chat_id), Some(user_id)).await;
                Ok(())
            }
            "unban_user" => {
                let (chat_id, user_id) = chat_and_user(&command.payload)?;
                self.facade.unban_member(chat_id, user_id).await?;
                self.audit(command, Some(chat_id), Some(user_id)).await;
                Ok(())
            }
            "resync_group" => {
                let group_id = command
                    .payload
                    .get("group_id")
                    .and_then(JsonValue::as_i64)
                    .ok_or_else(|| crate::error::CoreError::Fatal("resync_group missing group_id".into()))?;
                self.resync_group(group_id).await?;
                self.audit(command, Some(group_id), None).await;
                Ok(())
            }
            "resync_channel" => {
                let channel_id = command
                    .payload
                    .get("channel_id")
                    .and_then(JsonValue::as_i64)
                    .ok_or_else(|| crate::error::CoreError::Fatal("resync_channel missing channel_id".into()))?;
                self.cache.invalidate_channel(self.bot_instance_id, channel_id).await;
                self.audit(command, None, None).await;
                Ok(())
            }
            "send_message" => {
                let chat_id = command
                    .payload
                    .get("chat_id")
                    .and_then(JsonValue::as_i64)
                    .ok_or_else(|| crate::error::CoreError::Fatal("send_message missing chat_id".into()))?;
                let text = command
                    .payload
                    .get("text")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| crate::error::CoreError::Fatal("send_message missing text".into()))?;
                self.facade.send_message(chat_id, text).await
            }
            other => Err(crate::error::CoreError::Fatal(format!("unknown command type: {other}"))),
        }
    }

    /// Invalidates every enforced channel's cache entries for this group,
    /// then eagerly re-verifies its known recent users (bounded by
    /// `RESYNC_RECENT_USER_LIMIT`, since the Bot API gives no way to
    /// enumerate a large group's full membership). Mirrors `resync_channel`'s
    /// invalidate-then-reconverge shape, one level up.
    async fn resync_group(&self, group_id: i64) -> Result<()> {
        let Some((_, channels)) = self.db.get_group_with_channels(self.bot_instance_id, group_id).await? else {
            return Ok(());
        };
        for channel in &channels {
            self.cache.invalidate_channel(self.bot_instance_id, channel.channel_id).await;
        }

        let users = self
            .db
            .recent_users_in_group(self.bot_instance_id, group_id, RESYNC_RECENT_USER_LIMIT)
            .await?;
        let user_count = users.len();

        for user_id in users {
            match self.verification.verify(self.bot_instance_id, group_id, user_id).await {
                Ok(verdict) => {
                    let (channel_title, invite_link) = match &verdict {
                        Verdict::Restricted { missing_channel_id } => channels
                            .iter()
                            .find(|c| c.channel_id == *missing_channel_id)
                            .map(|c| (c.title.clone().unwrap_or_default(), c.invite_link.clone()))
                            .unwrap_or_default(),
                        _ => Default::default(),
                    };
                    if let Err(err) = self
                        .enforcement
                        .apply(group_id, user_id, verdict, None, &channel_title, invite_link.as_deref())
                        .await
                    {
                        warn!(bot_instance_id = self.bot_instance_id, group_id, user_id, error = %err, "resync_group enforcement failed for user");
                    }
                }
                Err(err) => {
                    warn!(bot_instance_id = self.bot_instance_id, group_id, user_id, error = %err, "resync_group verification failed for user");
                }
            }
        }

        info!(bot_instance_id = self.bot_instance_id, group_id, users = user_count, "resync_group completed");
        Ok(())
    }

    /// Writes one operator-visible audit row (§3) for a successfully
    /// dispatched command. Best-effort: a logging failure never fails the
    /// command itself.
    async fn audit(&self, command: &AdminCommand, group_id: Option<i64>, target_user_id: Option<i64>) {
        let log = AdminAuditLog {
            bot_instance_id: self.bot_instance_id,
            actor_user_id: command.created_by,
            action: command.command_type.clone(),
            group_id,
            target_user_id,
            details: command.payload.clone(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.db.record_admin_action(&log).await {
            warn!(bot_instance_id = self.bot_instance_id, error = %err, "failed to record admin audit log");
        }
    }
}

fn chat_and_user(payload: &JsonValue) -> Result<(i64, i64)> {
    let chat_id = payload
        .get("chat_id")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| crate::error::CoreError::Fatal("missing chat_id".into()))?;
    let user_id = payload
        .get("user_id")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| crate::error::CoreError::Fatal("missing user_id".into()))?;
    Ok((chat_id, user_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_and_user_requires_both_fields() {
        let payload = serde_json::json!({"chat_id": 1});
        assert!(chat_and_user(&payload).is_err());
        let payload = serde_json::json!({"chat_id": 1, "user_id": 2});
        assert_eq!(chat_and_user(&payload).unwrap(), (1, 2));
    }
}
